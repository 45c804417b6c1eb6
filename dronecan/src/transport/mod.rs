//! CAN frame model and identifier-level protocol rules.
//!
//! Frames carry their flags (extended, remote, error) in the top bits of the
//! raw 32-bit identifier, the way SocketCAN and most driver layers hand them
//! over; everything below the flags is the 29-bit arbitration field.

mod bitfields;

pub use bitfields::{CanMessageId, CanServiceId, TailByte};

use arrayvec::ArrayVec;

use crate::transfer::TransferKind;
use crate::types::{DataTypeId, ANON_MSG_DATA_TYPE_ID_BIT_LEN, BROADCAST_NODE_ID};

/// Extended-frame flag.
pub const CAN_FRAME_EFF: u32 = 1 << 31;
/// Remote-transmission-request flag.
pub const CAN_FRAME_RTR: u32 = 1 << 30;
/// Error-frame flag.
pub const CAN_FRAME_ERR: u32 = 1 << 29;

pub const CAN_EXT_ID_MASK: u32 = 0x1FFF_FFFF;
pub const CAN_STD_ID_MASK: u32 = 0x0000_07FF;

/// Largest frame payload, tail byte included.
#[cfg(not(feature = "canfd"))]
pub const FRAME_MAX_DATA_LEN: usize = 8;
#[cfg(feature = "canfd")]
pub const FRAME_MAX_DATA_LEN: usize = 64;

/// Extended CAN frame, the only kind UAVCAN v0 puts on the wire.
#[derive(Clone, Debug)]
pub struct CanFrame {
    /// Raw identifier with the EFF/RTR/ERR flags in the top bits.
    pub id: u32,
    pub payload: ArrayVec<[u8; FRAME_MAX_DATA_LEN]>,
    /// Index of the interface the frame arrived on.
    pub iface_id: u8,
    #[cfg(feature = "deadline")]
    pub deadline_usec: u64,
    #[cfg(feature = "multi-iface")]
    pub iface_mask: u8,
    #[cfg(feature = "canfd")]
    pub canfd: bool,
}

impl CanFrame {
    pub fn new(id: u32, data: &[u8]) -> Self {
        CanFrame {
            id,
            payload: ArrayVec::from_iter(data.iter().copied()),
            iface_id: 0,
            #[cfg(feature = "deadline")]
            deadline_usec: 0,
            #[cfg(feature = "multi-iface")]
            iface_mask: 0,
            #[cfg(feature = "canfd")]
            canfd: false,
        }
    }
}

/// Data Length Code      9  10  11  12  13  14  15
/// Number of data bytes 12  16  20  24  32  48  64
pub fn dlc_to_data_length(dlc: usize) -> usize {
    match dlc {
        0..=8 => dlc,
        9 => 12,
        10 => 16,
        11 => 20,
        12 => 24,
        13 => 32,
        14 => 48,
        _ => 64,
    }
}

pub fn data_length_to_dlc(data_length: usize) -> usize {
    match data_length {
        0..=8 => data_length,
        9..=12 => 9,
        13..=16 => 10,
        17..=20 => 11,
        21..=24 => 12,
        25..=32 => 13,
        33..=48 => 14,
        _ => 15,
    }
}

/// True when `id` wins bus arbitration against `rhs`.
///
/// STD vs EXT: with equal 11 most significant bits the extended frame loses.
/// RTR vs data: with equal identifiers the remote frame loses. Otherwise the
/// numerically smaller identifier wins.
pub(crate) fn is_priority_higher(rhs: u32, id: u32) -> bool {
    let clean_id = id & CAN_EXT_ID_MASK;
    let rhs_clean_id = rhs & CAN_EXT_ID_MASK;

    let ext = id & CAN_FRAME_EFF != 0;
    let rhs_ext = rhs & CAN_FRAME_EFF != 0;
    if ext != rhs_ext {
        let arb11 = if ext { clean_id >> 18 } else { clean_id };
        let rhs_arb11 = if rhs_ext {
            rhs_clean_id >> 18
        } else {
            rhs_clean_id
        };
        if arb11 != rhs_arb11 {
            return arb11 < rhs_arb11;
        }
        return rhs_ext;
    }

    let rtr = id & CAN_FRAME_RTR != 0;
    let rhs_rtr = rhs & CAN_FRAME_RTR != 0;
    if clean_id == rhs_clean_id && rtr != rhs_rtr {
        return rhs_rtr;
    }

    clean_id < rhs_clean_id
}

pub(crate) fn extract_transfer_kind(id: u32) -> TransferKind {
    if !CanServiceId(id).service_not_message() {
        TransferKind::Broadcast
    } else if CanServiceId(id).request_not_response() {
        TransferKind::Request
    } else {
        TransferKind::Response
    }
}

/// Data type id carried by an identifier. Anonymous senders only own 2 bits
/// of the field, the rest is their discriminator; the mask applies to source
/// id 0 alone.
pub(crate) fn extract_data_type(id: u32) -> DataTypeId {
    if extract_transfer_kind(id) == TransferKind::Broadcast {
        let msg = CanMessageId(id);
        let mut dtid = msg.data_type_id();
        if msg.source_id() == BROADCAST_NODE_ID {
            dtid &= (1 << ANON_MSG_DATA_TYPE_ID_BIT_LEN) - 1;
        }
        dtid
    } else {
        DataTypeId::from(CanServiceId(id).service_type_id())
    }
}
