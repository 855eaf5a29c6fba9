//! # Bit and Word Helpers
//!
//! Conversions between the raw bytes carried by Modbus responses and the values
//! the gateway works with.
//!
//! ## Conventions
//!
//! - **Bits** (FC01/FC02) are packed eight per byte, least significant bit first:
//!   bit `n` lives in byte `n / 8` at position `n % 8`.
//! - **Registers** (FC03/FC04) are 16-bit words transmitted big-endian.
//! - **32-bit values** span two consecutive registers, high word first (ABCD).
//!
//! ```rust
//! use logo_wialon_gateway::bytes::{get_bit, regs_to_u32, u32_to_regs};
//!
//! assert!(get_bit(&[0b0101_0001], 4));
//! assert_eq!(u32_to_regs(0x01FE_0000), [0x01FE, 0x0000]);
//! assert_eq!(regs_to_u32(&[0x01FE, 0x0000]), 0x01FE_0000);
//! ```

/// Read bit `index` from an LSB-first packed buffer.
///
/// Indices past the end of `data` read as `false`.
#[inline]
pub fn get_bit(data: &[u8], index: usize) -> bool {
    data.get(index / 8)
        .map(|byte| byte & (1 << (index % 8)) != 0)
        .unwrap_or(false)
}

/// Unpack the first `count` bits of an LSB-first packed buffer.
pub fn unpack_bits(data: &[u8], count: usize) -> Vec<bool> {
    (0..count).map(|i| get_bit(data, i)).collect()
}

/// Split a byte buffer into big-endian 16-bit words.
///
/// A trailing odd byte is ignored.
pub fn be_words(data: &[u8]) -> Vec<u16> {
    data.chunks_exact(2)
        .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
        .collect()
}

/// Combine two registers, high word first.
#[inline]
pub fn regs_to_u32(regs: &[u16; 2]) -> u32 {
    (u32::from(regs[0]) << 16) | u32::from(regs[1])
}

/// Split a 32-bit value into two registers, high word first.
#[inline]
pub fn u32_to_regs(value: u32) -> [u16; 2] {
    [(value >> 16) as u16, (value & 0xFFFF) as u16]
}

/// Raw register value as an analog reading.
///
/// No engineering-unit scaling is applied; the register integer is returned as is.
#[inline]
pub fn register_to_analog(reg: u16) -> f32 {
    f32::from(reg)
}
