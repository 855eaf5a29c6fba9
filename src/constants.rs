//! Protocol and policy constants
//!
//! Modbus values are derived from the official Modbus specification:
//! - Maximum PDU size: 253 bytes (inherited from RS485 ADU limit of 256 bytes)
//! - Register/coil limits are calculated to fit within the PDU size constraint
//!
//! Wialon values follow the IPS 2.0 text protocol as spoken by the telemetry server.

use std::time::Duration;

// ============================================================================
// Modbus Frame Size Constants
// ============================================================================

/// Modbus MBAP header length for TCP
/// Format: Transaction ID(2) + Protocol ID(2) + Length(2) = 6 bytes
/// The Unit ID is counted by the Length field and is read together with the PDU.
pub const MBAP_HEADER_LEN: usize = 6;

/// Maximum PDU (Protocol Data Unit) size per Modbus specification
/// RS485 ADU (256 bytes) - Slave Address (1 byte) - CRC (2 bytes) = 253 bytes
pub const MAX_PDU_SIZE: usize = 253;

/// Maximum MBAP length field value (Unit ID + PDU)
/// = 1 (Unit ID) + 253 (Max PDU) = 254 bytes
pub const MAX_MBAP_LENGTH: usize = 1 + MAX_PDU_SIZE;

// ============================================================================
// Modbus Operation Limits
// ============================================================================

/// Maximum number of registers for FC03/FC04 (Read Holding/Input Registers)
///
/// Response PDU: 1 (FC) + 1 (byte count) + N × 2 ≤ 253 → N ≤ 125
pub const MAX_READ_REGISTERS: usize = 125;

/// Maximum number of registers for FC16 (Write Multiple Registers)
///
/// Request PDU: 1 + 2 + 2 + 1 + N × 2 ≤ 253 → N ≤ 123
pub const MAX_WRITE_REGISTERS: usize = 123;

/// Maximum number of coils for FC01/FC02 (Read Coils/Discrete Inputs)
///
/// Response PDU: 1 + 1 + ceil(N / 8) ≤ 253, rounded down to 2000.
pub const MAX_READ_COILS: usize = 2000;

// ============================================================================
// Modbus Function Codes
// ============================================================================

/// Read Coils (FC01)
pub const FC_READ_COILS: u8 = 0x01;

/// Read Discrete Inputs (FC02)
pub const FC_READ_DISCRETE_INPUTS: u8 = 0x02;

/// Read Holding Registers (FC03)
pub const FC_READ_HOLDING_REGISTERS: u8 = 0x03;

/// Read Input Registers (FC04)
pub const FC_READ_INPUT_REGISTERS: u8 = 0x04;

/// Write Single Coil (FC05)
pub const FC_WRITE_SINGLE_COIL: u8 = 0x05;

/// Write Single Register (FC06)
pub const FC_WRITE_SINGLE_REGISTER: u8 = 0x06;

/// Write Multiple Registers (FC16)
pub const FC_WRITE_MULTIPLE_REGISTERS: u8 = 0x10;

/// Coil ON value for FC05
pub const COIL_ON: u16 = 0xFF00;

/// Coil OFF value for FC05
pub const COIL_OFF: u16 = 0x0000;

// ============================================================================
// Modbus Exception Codes
// ============================================================================

/// Illegal Function
pub const EXCEPTION_ILLEGAL_FUNCTION: u8 = 0x01;

/// Illegal Data Address
pub const EXCEPTION_ILLEGAL_DATA_ADDRESS: u8 = 0x02;

/// Illegal Data Value
pub const EXCEPTION_ILLEGAL_DATA_VALUE: u8 = 0x03;

/// Server Device Failure
pub const EXCEPTION_SERVER_DEVICE_FAILURE: u8 = 0x04;

/// Server Device Busy
pub const EXCEPTION_SERVER_DEVICE_BUSY: u8 = 0x06;

/// Gateway Path Unavailable
pub const EXCEPTION_GATEWAY_PATH_UNAVAILABLE: u8 = 0x0A;

/// Gateway Target Device Failed to Respond
pub const EXCEPTION_GATEWAY_TARGET_FAILED: u8 = 0x0B;

// ============================================================================
// PLC Defaults
// ============================================================================

/// LOGO! answers on unit id 1 when sitting behind its TCP gateway.
pub const LOGO_UNIT_ID: u8 = 1;

/// Default PLC operation timeout.
pub const DEFAULT_PLC_TIMEOUT: Duration = Duration::from_millis(2500);

/// Attempts per gateway operation before the last error is surfaced.
pub const PLC_ATTEMPT_LIMIT: u32 = 2;

/// Pause between closing a stale PLC connection and dialing again.
pub const RECONNECT_PAUSE: Duration = Duration::from_millis(100);

// ============================================================================
// Generator (genset) command block
// ============================================================================

/// Register receiving the command code.
pub const GENSET_CODE_ADDRESS: u16 = 4209;

/// First of the two registers holding the 32-bit command argument.
pub const GENSET_ARGUMENT_ADDRESS: u16 = 4207;

/// Coil driving automatic start/stop when the PLC is wired for coil control.
pub const GENSET_AUTO_START_COIL: u16 = 4700;

/// Command code for start/stop.
pub const GENSET_START_STOP_CODE: u16 = 0x01;

/// Argument requesting a start.
pub const GENSET_ARGUMENT_START: u32 = 0x01FE_0000;

/// Argument requesting a stop.
pub const GENSET_ARGUMENT_STOP: u32 = 0x02FD_0000;

// ============================================================================
// Wialon IPS
// ============================================================================

/// Protocol version announced in the login frame.
pub const WIALON_PROTOCOL_VERSION: &str = "2.0";

/// Login accepted.
pub const WIALON_LOGIN_ACK: &str = "#AL#1";

/// Data frame accepted.
pub const WIALON_DATA_ACK: &str = "#AD#1";

/// Header of a server-to-device message.
pub const WIALON_MESSAGE_HEADER: &str = "#M#";

/// Value-type flag attached to every uploaded parameter (integer).
pub const WIALON_PARAM_TYPE_INT: u8 = 1;

/// Frame terminator.
pub const WIALON_FRAME_END: &str = "\r\n";

/// Deadline for the response to a login or data frame.
pub const WIALON_RESPONSE_TIMEOUT: Duration = Duration::from_millis(2000);

/// Deadline for a single command read.
pub const WIALON_COMMAND_TIMEOUT: Duration = Duration::from_millis(500);

/// Longest inbound line accepted from the telemetry server, terminator included.
pub const WIALON_MAX_LINE: usize = 1024;

// ============================================================================
// Polling policy
// ============================================================================

/// Default sampling period.
pub const DEFAULT_POLL_PERIOD: Duration = Duration::from_secs(10);

/// Default longest gap between uploads when nothing changes.
pub const DEFAULT_MAX_UPLOAD_INTERVAL: Duration = Duration::from_secs(10 * 60);

/// Consecutive PLC failures tolerated before the process gives up.
pub const PLC_FAILURE_CEILING: u32 = 6;

/// Consecutive telemetry failures tolerated before the process gives up.
pub const TELEMETRY_FAILURE_CEILING: u32 = 5;

/// Relative analog change that counts as significant.
pub const ANALOG_DEADBAND: f32 = 0.1;

/// Pause between the three reads of a sample cycle.
pub const INTER_READ_PAUSE: Duration = Duration::from_millis(50);

/// Pause after each coil write of a `W` command.
pub const INTER_WRITE_PAUSE: Duration = Duration::from_millis(50);

/// Settle time between handling a command and the forced upload.
pub const COMMAND_SETTLE_PAUSE: Duration = Duration::from_millis(500);

/// Depth of the listener → engine command channel.
pub const COMMAND_QUEUE_DEPTH: usize = 8;

/// Back-off of the command listener after a read error.
pub const LISTENER_ERROR_BACKOFF: Duration = Duration::from_secs(1);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_size_constants() {
        assert_eq!(MBAP_HEADER_LEN, 6);
        assert_eq!(MAX_PDU_SIZE, 253);
        assert_eq!(MAX_MBAP_LENGTH, 254);
    }

    #[test]
    fn test_register_limits() {
        let read_pdu_size = 1 + 1 + (MAX_READ_REGISTERS * 2);
        assert!(read_pdu_size <= MAX_PDU_SIZE);

        let write_pdu_size = 1 + 2 + 2 + 1 + (MAX_WRITE_REGISTERS * 2);
        assert!(write_pdu_size <= MAX_PDU_SIZE);
    }

    #[test]
    fn test_coil_limits() {
        let read_coil_pdu = 1 + 1 + MAX_READ_COILS.div_ceil(8);
        assert!(read_coil_pdu <= MAX_PDU_SIZE);
    }

    #[test]
    fn test_genset_arguments_split_into_words() {
        assert_eq!(GENSET_ARGUMENT_START >> 16, 0x01FE);
        assert_eq!(GENSET_ARGUMENT_STOP >> 16, 0x02FD);
        assert_eq!(GENSET_ARGUMENT_START & 0xFFFF, 0);
    }
}
