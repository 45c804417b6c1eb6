//! Transfer-level model: kinds, descriptors, and the objects exchanged with
//! the host on each side of the engine.

use crate::codec::{self, Scalar};
use crate::pool::{buffer_at, BlockIndex, PoolBlock, BUFFER_BLOCK_DATA_SIZE};
use crate::types::{DataTypeId, NodeId, TransferId};
use crate::Error;

/// Protocol-level transfer types. The discriminants are the wire encoding of
/// the service/request identifier bits.
#[derive(FromPrimitive, ToPrimitive, Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Debug, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TransferKind {
    Response = 0,
    Request = 1,
    Broadcast = 2,
}

/// Packed (data type, kind, source, destination) key identifying one
/// in-flight multi-frame transfer. Fits 32 bits so a reassembly state can
/// carry it by value.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) struct TransferDescriptor(u32);

impl TransferDescriptor {
    pub fn new(
        data_type_id: DataTypeId,
        kind: TransferKind,
        source: NodeId,
        destination: NodeId,
    ) -> Self {
        TransferDescriptor(
            u32::from(data_type_id)
                | (kind as u32) << 16
                | u32::from(source) << 18
                | u32::from(destination) << 25,
        )
    }
}

/// Parameters of an outgoing transfer.
///
/// `Default` yields the zeroed object; fill in what the transfer needs and
/// leave the rest. The transfer id lives outside this struct because the
/// engine advances it on success.
#[derive(Clone, Debug)]
pub struct TxTransfer<'a> {
    pub data_type_signature: u64,
    pub data_type_id: DataTypeId,
    /// 0..=31, lower wins arbitration.
    pub priority: u8,
    /// Only read by [`crate::Node::request_or_respond`]; broadcasts ignore it.
    pub transfer_kind: TransferKind,
    pub payload: &'a [u8],
    #[cfg(feature = "deadline")]
    pub deadline_usec: u64,
    #[cfg(feature = "multi-iface")]
    pub iface_mask: u8,
    #[cfg(feature = "canfd")]
    pub canfd: bool,
}

impl Default for TxTransfer<'_> {
    fn default() -> Self {
        TxTransfer {
            data_type_signature: 0,
            data_type_id: 0,
            priority: 0,
            transfer_kind: TransferKind::Broadcast,
            payload: &[],
            #[cfg(feature = "deadline")]
            deadline_usec: 0,
            #[cfg(feature = "multi-iface")]
            iface_mask: 0,
            #[cfg(feature = "canfd")]
            canfd: false,
        }
    }
}

/// A completed transfer as delivered to the handler.
///
/// The payload may be scattered over the reassembly head buffer, a chain of
/// pool blocks and the final frame's tail; it is only valid for the duration
/// of the delivery callback, after which the engine reclaims the chain. Use
/// [`RxTransfer::decode_scalar`] to read fields in place, or
/// [`RxTransfer::copy_payload_to`] to linearize it.
pub struct RxTransfer<'a> {
    pub timestamp_usec: u64,
    pub data_type_id: DataTypeId,
    pub transfer_kind: TransferKind,
    pub transfer_id: TransferId,
    pub priority: u8,
    /// 0 when the sender is anonymous.
    pub source_node_id: NodeId,
    #[cfg(feature = "canfd")]
    pub canfd: bool,
    /// Whether the tail-array optimization applies to this payload's
    /// encoding.
    #[cfg(any(feature = "canfd", feature = "tao"))]
    pub tao: bool,
    pub(crate) payload_len: u16,
    pub(crate) payload_head: &'a [u8],
    pub(crate) payload_middle: Option<BlockIndex>,
    pub(crate) payload_tail: &'a [u8],
    pub(crate) blocks: &'a [PoolBlock],
}

impl RxTransfer<'_> {
    pub fn payload_len(&self) -> usize {
        usize::from(self.payload_len)
    }

    /// Reads `bit_length` bits at `bit_offset` from the (possibly scattered)
    /// payload. Returns the decoded value and the number of bits actually
    /// read: 0 when the offset is past the payload, less than requested when
    /// the span overlaps the payload end.
    pub fn decode_scalar<T: Scalar>(
        &self,
        bit_offset: u32,
        bit_length: u8,
    ) -> Result<(T, u8), Error> {
        codec::decode_scalar(self, bit_offset, bit_length)
    }

    /// Linearizes the payload into `out`; returns the number of bytes
    /// written, bounded by the payload length and `out.len()`.
    pub fn copy_payload_to(&self, out: &mut [u8]) -> usize {
        let total = self.payload_len();
        let mut written = 0;

        let head_take = self.payload_head.len().min(total).min(out.len());
        out[..head_take].copy_from_slice(&self.payload_head[..head_take]);
        written += head_take;

        let mut block = self.payload_middle;
        while let Some(index) = block {
            if written >= out.len() || written >= total {
                return written;
            }
            let buffer = buffer_at(self.blocks, index);
            let n = BUFFER_BLOCK_DATA_SIZE
                .min(total - written)
                .min(out.len() - written);
            out[written..written + n].copy_from_slice(&buffer.data[..n]);
            written += n;
            block = buffer.next;
        }

        if written < out.len() && written < total {
            let n = self
                .payload_tail
                .len()
                .min(total - written)
                .min(out.len() - written);
            out[written..written + n].copy_from_slice(&self.payload_tail[..n]);
            written += n;
        }

        written
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use num_traits::FromPrimitive;

    #[test]
    fn kind_matches_wire_discriminants() {
        assert_eq!(TransferKind::from_u8(0), Some(TransferKind::Response));
        assert_eq!(TransferKind::from_u8(1), Some(TransferKind::Request));
        assert_eq!(TransferKind::from_u8(2), Some(TransferKind::Broadcast));
        assert_eq!(TransferKind::from_u8(3), None);
    }

    #[test]
    fn descriptors_distinguish_every_field() {
        let base = TransferDescriptor::new(100, TransferKind::Broadcast, 5, 0);
        assert_eq!(
            base,
            TransferDescriptor::new(100, TransferKind::Broadcast, 5, 0)
        );
        assert_ne!(
            base,
            TransferDescriptor::new(101, TransferKind::Broadcast, 5, 0)
        );
        assert_ne!(base, TransferDescriptor::new(100, TransferKind::Request, 5, 0));
        assert_ne!(
            base,
            TransferDescriptor::new(100, TransferKind::Broadcast, 6, 0)
        );
        assert_ne!(
            base,
            TransferDescriptor::new(100, TransferKind::Broadcast, 5, 1)
        );
    }
}
