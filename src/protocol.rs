//! Modbus protocol definitions
//!
//! Requests and responses are transport-agnostic: they carry the unit id plus
//! the PDU fields, and the transport adds its own framing (MBAP for TCP).

use crate::bytes::{be_words, unpack_bits};
use crate::constants::*;
use crate::error::{GatewayError, GatewayResult};

/// Modbus slave/unit identifier.
pub type SlaveId = u8;

/// Function codes used by the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModbusFunction {
    ReadCoils,
    ReadDiscreteInputs,
    ReadHoldingRegisters,
    ReadInputRegisters,
    WriteSingleCoil,
    WriteSingleRegister,
    WriteMultipleRegisters,
}

impl ModbusFunction {
    pub fn to_u8(self) -> u8 {
        match self {
            Self::ReadCoils => FC_READ_COILS,
            Self::ReadDiscreteInputs => FC_READ_DISCRETE_INPUTS,
            Self::ReadHoldingRegisters => FC_READ_HOLDING_REGISTERS,
            Self::ReadInputRegisters => FC_READ_INPUT_REGISTERS,
            Self::WriteSingleCoil => FC_WRITE_SINGLE_COIL,
            Self::WriteSingleRegister => FC_WRITE_SINGLE_REGISTER,
            Self::WriteMultipleRegisters => FC_WRITE_MULTIPLE_REGISTERS,
        }
    }

    pub fn from_u8(code: u8) -> GatewayResult<Self> {
        match code {
            FC_READ_COILS => Ok(Self::ReadCoils),
            FC_READ_DISCRETE_INPUTS => Ok(Self::ReadDiscreteInputs),
            FC_READ_HOLDING_REGISTERS => Ok(Self::ReadHoldingRegisters),
            FC_READ_INPUT_REGISTERS => Ok(Self::ReadInputRegisters),
            FC_WRITE_SINGLE_COIL => Ok(Self::WriteSingleCoil),
            FC_WRITE_SINGLE_REGISTER => Ok(Self::WriteSingleRegister),
            FC_WRITE_MULTIPLE_REGISTERS => Ok(Self::WriteMultipleRegisters),
            other => Err(GatewayError::protocol(format!(
                "unsupported function code {:#04x}",
                other
            ))),
        }
    }
}

/// A single Modbus request.
///
/// For single writes `data` holds the two value bytes; for FC16 it holds the
/// register bytes without the byte-count prefix, which is added on encoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModbusRequest {
    pub slave_id: SlaveId,
    pub function: ModbusFunction,
    pub address: u16,
    pub quantity: u16,
    pub data: Vec<u8>,
}

impl ModbusRequest {
    /// Build a read request (FC01–FC04).
    pub fn new_read(slave_id: SlaveId, function: ModbusFunction, address: u16, quantity: u16) -> Self {
        Self {
            slave_id,
            function,
            address,
            quantity,
            data: Vec::new(),
        }
    }

    /// Check quantities and payload sizes against protocol limits.
    pub fn validate(&self) -> GatewayResult<()> {
        let quantity = self.quantity as usize;
        match self.function {
            ModbusFunction::ReadCoils | ModbusFunction::ReadDiscreteInputs => {
                if quantity == 0 || quantity > MAX_READ_COILS {
                    return Err(GatewayError::invalid_data(format!(
                        "bit read quantity {} outside 1..={}",
                        quantity, MAX_READ_COILS
                    )));
                }
            }
            ModbusFunction::ReadHoldingRegisters | ModbusFunction::ReadInputRegisters => {
                if quantity == 0 || quantity > MAX_READ_REGISTERS {
                    return Err(GatewayError::invalid_data(format!(
                        "register read quantity {} outside 1..={}",
                        quantity, MAX_READ_REGISTERS
                    )));
                }
            }
            ModbusFunction::WriteSingleCoil | ModbusFunction::WriteSingleRegister => {
                if self.data.len() != 2 {
                    return Err(GatewayError::invalid_data("single write needs two value bytes"));
                }
            }
            ModbusFunction::WriteMultipleRegisters => {
                if quantity == 0 || quantity > MAX_WRITE_REGISTERS || self.data.len() != quantity * 2 {
                    return Err(GatewayError::invalid_data(format!(
                        "register write of {} registers with {} data bytes",
                        quantity,
                        self.data.len()
                    )));
                }
            }
        }
        Ok(())
    }

    /// Encode the PDU (function code + fields), without unit id.
    pub fn encode_pdu(&self) -> Vec<u8> {
        let mut pdu = Vec::with_capacity(6 + self.data.len());
        pdu.push(self.function.to_u8());
        pdu.extend_from_slice(&self.address.to_be_bytes());
        match self.function {
            ModbusFunction::WriteSingleCoil | ModbusFunction::WriteSingleRegister => {
                pdu.extend_from_slice(&self.data);
            }
            ModbusFunction::WriteMultipleRegisters => {
                pdu.extend_from_slice(&self.quantity.to_be_bytes());
                pdu.push(self.data.len() as u8);
                pdu.extend_from_slice(&self.data);
            }
            _ => pdu.extend_from_slice(&self.quantity.to_be_bytes()),
        }
        pdu
    }
}

/// A decoded Modbus response.
///
/// For reads `data` keeps the byte-count prefix as received; use
/// [`parse_bits`](Self::parse_bits) / [`parse_registers`](Self::parse_registers).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModbusResponse {
    pub slave_id: SlaveId,
    pub function: ModbusFunction,
    data: Vec<u8>,
    exception: Option<u8>,
}

impl ModbusResponse {
    pub fn new_success(slave_id: SlaveId, function: ModbusFunction, data: Vec<u8>) -> Self {
        Self {
            slave_id,
            function,
            data,
            exception: None,
        }
    }

    pub fn new_exception(slave_id: SlaveId, function: ModbusFunction, code: u8) -> Self {
        Self {
            slave_id,
            function,
            data: Vec::new(),
            exception: Some(code),
        }
    }

    /// Decode a PDU (function code first) received from `slave_id`.
    pub fn from_pdu(slave_id: SlaveId, pdu: &[u8]) -> GatewayResult<Self> {
        let (&code, rest) = pdu
            .split_first()
            .ok_or_else(|| GatewayError::frame("empty PDU"))?;

        if code & 0x80 != 0 {
            let function = ModbusFunction::from_u8(code & 0x7F)?;
            let exception = *rest
                .first()
                .ok_or_else(|| GatewayError::frame("exception response without code"))?;
            return Ok(Self::new_exception(slave_id, function, exception));
        }

        let function = ModbusFunction::from_u8(code)?;
        Ok(Self::new_success(slave_id, function, rest.to_vec()))
    }

    /// Raw data after the function code.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn is_exception(&self) -> bool {
        self.exception.is_some()
    }

    /// The exception carried by this response, if any.
    pub fn get_exception(&self) -> Option<GatewayError> {
        self.exception
            .map(|code| GatewayError::exception(self.function.to_u8(), code))
    }

    /// Payload of a read response with the byte-count prefix checked and removed.
    fn read_payload(&self) -> GatewayResult<&[u8]> {
        let (&byte_count, payload) = self
            .data
            .split_first()
            .ok_or_else(|| GatewayError::frame("read response without byte count"))?;
        if payload.len() < byte_count as usize {
            return Err(GatewayError::frame(format!(
                "byte count {} but only {} bytes present",
                byte_count,
                payload.len()
            )));
        }
        Ok(&payload[..byte_count as usize])
    }

    /// All bits of an FC01/FC02 response (a multiple of eight).
    pub fn parse_bits(&self) -> GatewayResult<Vec<bool>> {
        let packed = self.read_payload()?;
        Ok(unpack_bits(packed, packed.len() * 8))
    }

    /// Registers of an FC03/FC04 response.
    pub fn parse_registers(&self) -> GatewayResult<Vec<u16>> {
        let payload = self.read_payload()?;
        if payload.len() % 2 != 0 {
            return Err(GatewayError::frame("odd register byte count"));
        }
        Ok(be_words(payload))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_function_code_round_trip() {
        for code in [0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x10] {
            assert_eq!(ModbusFunction::from_u8(code).unwrap().to_u8(), code);
        }
        assert!(ModbusFunction::from_u8(0x2B).is_err());
    }

    #[test]
    fn test_encode_read_pdu() {
        let req = ModbusRequest::new_read(1, ModbusFunction::ReadInputRegisters, 1032, 3);
        assert_eq!(req.encode_pdu(), vec![0x04, 0x04, 0x08, 0x00, 0x03]);
    }

    #[test]
    fn test_encode_write_multiple_pdu() {
        let req = ModbusRequest {
            slave_id: 1,
            function: ModbusFunction::WriteMultipleRegisters,
            address: 4207,
            quantity: 2,
            data: vec![0x01, 0xFE, 0x00, 0x00],
        };
        req.validate().unwrap();
        assert_eq!(
            req.encode_pdu(),
            vec![0x10, 0x10, 0x6F, 0x00, 0x02, 0x04, 0x01, 0xFE, 0x00, 0x00]
        );
    }

    #[test]
    fn test_validate_rejects_oversized_reads() {
        let req = ModbusRequest::new_read(1, ModbusFunction::ReadCoils, 0, 2001);
        assert!(req.validate().is_err());
        let req = ModbusRequest::new_read(1, ModbusFunction::ReadHoldingRegisters, 0, 126);
        assert!(req.validate().is_err());
        let req = ModbusRequest::new_read(1, ModbusFunction::ReadDiscreteInputs, 0, 0);
        assert!(req.validate().is_err());
    }

    #[test]
    fn test_parse_registers_skips_byte_count() {
        let resp = ModbusResponse::from_pdu(1, &[0x04, 0x04, 0x01, 0xF4, 0x03, 0x52]).unwrap();
        assert_eq!(resp.parse_registers().unwrap(), vec![500, 850]);
    }

    #[test]
    fn test_parse_bits() {
        let resp = ModbusResponse::from_pdu(1, &[0x02, 0x01, 0b0000_0110]).unwrap();
        let bits = resp.parse_bits().unwrap();
        assert_eq!(bits.len(), 8);
        assert_eq!(&bits[..4], &[false, true, true, false]);
    }

    #[test]
    fn test_exception_response() {
        let resp = ModbusResponse::from_pdu(1, &[0x85, 0x02]).unwrap();
        assert!(resp.is_exception());
        assert_eq!(resp.function, ModbusFunction::WriteSingleCoil);
        assert!(matches!(
            resp.get_exception(),
            Some(GatewayError::Exception { code: 0x02, .. })
        ));
    }

    #[test]
    fn test_truncated_read_is_frame_error() {
        let resp = ModbusResponse::from_pdu(1, &[0x03, 0x04, 0x00, 0x01]).unwrap();
        assert!(matches!(resp.parse_registers(), Err(GatewayError::Frame { .. })));
    }
}
