//! Transfer CRC arithmetic.
//!
//! UAVCAN v0 protects multi-frame transfers with CRC-16-CCITT-FALSE computed
//! over the data type signature (little-endian) followed by the payload.
//! The receive side accumulates the value frame by frame, so the helpers
//! here continue a running register by seeding a fresh digest with it.

use crc_any::CRCu16;

pub const INITIAL: u16 = 0xFFFF;

const POLY: u16 = 0x1021;

pub fn add_bytes(crc: u16, bytes: &[u8]) -> u16 {
    let mut digest = CRCu16::create_crc(POLY, 16, crc, 0, false);
    digest.digest(bytes);
    digest.get_crc()
}

pub fn add_signature(crc: u16, data_type_signature: u64) -> u16 {
    add_bytes(crc, &data_type_signature.to_le_bytes())
}
