//! Transmit pipeline: transfer validation, identifier formation,
//! fragmentation into tail-stamped frames, and priority-ordered queueing.

use arrayvec::ArrayVec;

use crate::crc;
use crate::node::Node;
use crate::pool::{Block, BlockIndex};
use crate::transfer::{TransferKind, TxTransfer};
use crate::transport::{
    data_length_to_dlc, dlc_to_data_length, is_priority_higher, CanFrame, TailByte,
    CAN_EXT_ID_MASK, CAN_FRAME_EFF, FRAME_MAX_DATA_LEN,
};
use crate::types::{
    NodeId, TransferId, ANON_MSG_DATA_TYPE_ID_BIT_LEN, BROADCAST_NODE_ID, MAX_NODE_ID,
    TRANSFER_PRIORITY_LOWEST,
};
use crate::{Error, TransferHandler};

/// One queued outgoing frame, linked in arbitration order.
pub(crate) struct TxQueueItem {
    pub next: Option<BlockIndex>,
    pub frame: CanFrame,
}

impl<H: TransferHandler> Node<'_, H> {
    /// Enqueues a broadcast transfer and, on success, advances the caller's
    /// transfer id. Returns the number of frames enqueued.
    ///
    /// Without a local node id only anonymous broadcasts are possible:
    /// payload up to 7 bytes, data type id within 2 bits, and a CRC-derived
    /// discriminator takes over the rest of the type field.
    pub fn broadcast(
        &mut self,
        transfer: &TxTransfer<'_>,
        inout_transfer_id: &mut TransferId,
    ) -> Result<usize, Error> {
        if transfer.priority > TRANSFER_PRIORITY_LOWEST {
            return Err(Error::InvalidArgument);
        }

        let can_id;
        let mut crc = crc::INITIAL;

        match self.node_id {
            None => {
                if transfer.payload.len() > 7 {
                    return Err(Error::NodeIdNotSet);
                }

                const DTID_MASK: u16 = (1 << ANON_MSG_DATA_TYPE_ID_BIT_LEN) - 1;
                if transfer.data_type_id & DTID_MASK != transfer.data_type_id {
                    return Err(Error::InvalidArgument);
                }

                // The discriminator disambiguates colliding anonymous ids
                // from different senders.
                let discriminator =
                    u32::from(crc::add_bytes(crc::INITIAL, transfer.payload) & 0x7FFE);
                can_id = u32::from(transfer.priority) << 24
                    | discriminator << 9
                    | u32::from(transfer.data_type_id & DTID_MASK) << 8
                    | u32::from(BROADCAST_NODE_ID);
            }
            Some(node_id) => {
                can_id = u32::from(transfer.priority) << 24
                    | u32::from(transfer.data_type_id) << 8
                    | u32::from(node_id);
                crc = calculate_crc(transfer);
            }
        }

        let result = self.enqueue_tx_frames(can_id, crc, transfer, *inout_transfer_id)?;
        increment_transfer_id(inout_transfer_id);
        Ok(result)
    }

    /// Enqueues a service request or response addressed to
    /// `destination_node_id`. On success a request advances the caller's
    /// transfer id; a response must echo the request's id, so it does not.
    pub fn request_or_respond(
        &mut self,
        destination_node_id: NodeId,
        transfer: &TxTransfer<'_>,
        inout_transfer_id: &mut TransferId,
    ) -> Result<usize, Error> {
        if transfer.priority > TRANSFER_PRIORITY_LOWEST {
            return Err(Error::InvalidArgument);
        }
        let kind = transfer.transfer_kind;
        if kind != TransferKind::Request && kind != TransferKind::Response {
            return Err(Error::InvalidArgument);
        }
        // Service type ids are 8 bits; destinations are real node addresses.
        if transfer.data_type_id > 0xFF || destination_node_id > MAX_NODE_ID {
            return Err(Error::InvalidArgument);
        }
        let node_id = self.node_id.ok_or(Error::NodeIdNotSet)?;

        let can_id = u32::from(transfer.priority) << 24
            | u32::from(transfer.data_type_id) << 16
            | (kind as u32) << 15
            | u32::from(destination_node_id) << 8
            | 1 << 7
            | u32::from(node_id);

        let crc = calculate_crc(transfer);

        let result = self.enqueue_tx_frames(can_id, crc, transfer, *inout_transfer_id)?;
        if kind == TransferKind::Request {
            increment_transfer_id(inout_transfer_id);
        }
        Ok(result)
    }

    fn enqueue_tx_frames(
        &mut self,
        can_id: u32,
        crc: u16,
        transfer: &TxTransfer<'_>,
        transfer_id: TransferId,
    ) -> Result<usize, Error> {
        debug_assert!(can_id & CAN_EXT_ID_MASK == can_id);

        let frame_max_data_len = frame_max_data_len(transfer);
        let mut result = 0;

        if transfer.payload.len() < frame_max_data_len {
            // Single-frame transfer.
            let mut payload: ArrayVec<[u8; FRAME_MAX_DATA_LEN]> = ArrayVec::new();
            payload.extend(transfer.payload.iter().copied());

            let padded_len = dlc_to_data_length(data_length_to_dlc(payload.len() + 1)) - 1;
            while payload.len() < padded_len {
                payload.push(0);
            }
            payload.push(TailByte::new(true, true, false, transfer_id).0);

            let item = TxQueueItem {
                next: None,
                frame: make_frame(can_id, payload, transfer),
            };
            let index = self.pool.allocate(Block::Tx(item)).ok_or(Error::OutOfMemory)?;
            self.push_tx_queue(index);
            result += 1;
        } else {
            // Multi-frame transfer. Refuse unless every frame can be queued:
            // a partial transfer would only waste bus bandwidth.
            let total_bytes = transfer.payload.len() + 2;
            let bytes_per_frame = frame_max_data_len - 1;
            let frames_needed = total_bytes.div_ceil(bytes_per_frame);
            if usize::from(self.pool.free_blocks()) < frames_needed {
                return Err(Error::OutOfMemory);
            }

            let mut data_index = 0;
            let mut toggle = false;
            let mut start_of_transfer = true;

            while data_index < transfer.payload.len() {
                let mut payload: ArrayVec<[u8; FRAME_MAX_DATA_LEN]> = ArrayVec::new();
                if data_index == 0 {
                    payload.push(crc as u8);
                    payload.push((crc >> 8) as u8);
                }
                while payload.len() < frame_max_data_len - 1
                    && data_index < transfer.payload.len()
                {
                    payload.push(transfer.payload[data_index]);
                    data_index += 1;
                }
                let end_of_transfer = data_index == transfer.payload.len();

                let padded_len = dlc_to_data_length(data_length_to_dlc(payload.len() + 1)) - 1;
                while payload.len() < padded_len {
                    payload.push(0);
                }
                payload.push(TailByte::new(start_of_transfer, end_of_transfer, toggle, transfer_id).0);

                let item = TxQueueItem {
                    next: None,
                    frame: make_frame(can_id, payload, transfer),
                };
                let index = self.pool.allocate(Block::Tx(item)).ok_or(Error::OutOfMemory)?;
                self.push_tx_queue(index);

                result += 1;
                toggle = !toggle;
                start_of_transfer = false;
            }
        }

        Ok(result)
    }

    /// Inserts a queued frame in arbitration order, FIFO among equals.
    fn push_tx_queue(&mut self, item_index: BlockIndex) {
        debug_assert!(!self.pool.tx_item(item_index).frame.payload.is_empty());

        let Some(mut queue_index) = self.tx_queue else {
            self.tx_queue = Some(item_index);
            return;
        };

        let item_id = self.pool.tx_item(item_index).frame.id;
        let mut previous: Option<BlockIndex> = None;
        loop {
            if is_priority_higher(self.pool.tx_item(queue_index).frame.id, item_id) {
                self.pool.tx_item_mut(item_index).next = Some(queue_index);
                match previous {
                    None => self.tx_queue = Some(item_index),
                    Some(previous) => self.pool.tx_item_mut(previous).next = Some(item_index),
                }
                return;
            }
            match self.pool.tx_item(queue_index).next {
                None => {
                    self.pool.tx_item_mut(queue_index).next = Some(item_index);
                    return;
                }
                Some(next) => {
                    previous = Some(queue_index);
                    queue_index = next;
                }
            }
        }
    }
}

fn frame_max_data_len(transfer: &TxTransfer<'_>) -> usize {
    #[cfg(feature = "canfd")]
    {
        if transfer.canfd { 64 } else { 8 }
    }
    #[cfg(not(feature = "canfd"))]
    {
        let _ = transfer;
        FRAME_MAX_DATA_LEN
    }
}

fn make_frame(
    can_id: u32,
    payload: ArrayVec<[u8; FRAME_MAX_DATA_LEN]>,
    transfer: &TxTransfer<'_>,
) -> CanFrame {
    let _ = transfer;
    CanFrame {
        id: can_id | CAN_FRAME_EFF,
        payload,
        iface_id: 0,
        #[cfg(feature = "deadline")]
        deadline_usec: transfer.deadline_usec,
        #[cfg(feature = "multi-iface")]
        iface_mask: transfer.iface_mask,
        #[cfg(feature = "canfd")]
        canfd: transfer.canfd,
    }
}

/// Multi-frame transfer CRC: the data type signature (little-endian) then
/// the payload. Single-frame transfers carry no CRC. Under CAN FD the DLC
/// padding of the final frame counts as well.
fn calculate_crc(transfer: &TxTransfer<'_>) -> u16 {
    let mut crc = crc::INITIAL;

    #[cfg(feature = "canfd")]
    let multi_frame = (transfer.payload.len() > 7 && !transfer.canfd)
        || (transfer.payload.len() > 63 && transfer.canfd);
    #[cfg(not(feature = "canfd"))]
    let multi_frame = transfer.payload.len() > 7;

    if multi_frame {
        crc = crc::add_signature(crc, transfer.data_type_signature);
        crc = crc::add_bytes(crc, transfer.payload);

        #[cfg(feature = "canfd")]
        if transfer.payload.len() > 63 && transfer.canfd {
            let tail_bytes = (transfer.payload.len() + 2) % 63;
            let padding = dlc_to_data_length(data_length_to_dlc(tail_bytes + 1)) - 1 - tail_bytes;
            for _ in 0..padding {
                crc = crc::add_bytes(crc, &[0]);
            }
        }
    }
    crc
}

pub(crate) fn increment_transfer_id(transfer_id: &mut TransferId) {
    *transfer_id += 1;
    if *transfer_id >= 32 {
        *transfer_id = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::tests::{collect_tx_frames, AcceptAll};
    use crate::pool::PoolBlock;
    use crate::types::TRANSFER_PRIORITY_MEDIUM;

    #[test]
    fn single_frame_broadcast_layout() {
        let mut arena = [PoolBlock::EMPTY; 16];
        let mut node = Node::new(&mut arena, AcceptAll::new(0));
        node.set_local_node_id(42).unwrap();

        let mut transfer_id = 0;
        let frames = node
            .broadcast(
                &TxTransfer {
                    data_type_id: 123,
                    priority: TRANSFER_PRIORITY_MEDIUM,
                    payload: &[0xAA, 0xBB],
                    ..Default::default()
                },
                &mut transfer_id,
            )
            .unwrap();

        assert_eq!(frames, 1);
        assert_eq!(transfer_id, 1);

        let frame = node.peek_tx_queue().unwrap();
        assert_eq!(frame.id, CAN_FRAME_EFF | 0x1000_7B2A);
        assert_eq!(&frame.payload[..], &[0xAA, 0xBB, 0xC0]);
        node.pop_tx_queue();
        assert!(node.peek_tx_queue().is_none());
        assert_eq!(node.pool_statistics().current_usage_blocks, 0);
    }

    #[test]
    fn multi_frame_broadcast_layout() {
        let mut arena = [PoolBlock::EMPTY; 16];
        let mut node = Node::new(&mut arena, AcceptAll::new(0));
        node.set_local_node_id(1).unwrap();

        let signature = 0x0B2A812620A11D40;
        let payload: [u8; 12] = [1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12];
        let mut transfer_id = 0;
        let frames = node
            .broadcast(
                &TxTransfer {
                    data_type_signature: signature,
                    data_type_id: 20,
                    priority: TRANSFER_PRIORITY_MEDIUM,
                    payload: &payload,
                    ..Default::default()
                },
                &mut transfer_id,
            )
            .unwrap();
        assert_eq!(frames, 2);
        assert_eq!(transfer_id, 1);

        let expected_crc =
            crc::add_bytes(crc::add_signature(crc::INITIAL, signature), &payload);

        let frames = collect_tx_frames(&mut node);
        assert_eq!(frames.len(), 2);
        assert_eq!(
            &frames[0].1[..],
            &[
                expected_crc as u8,
                (expected_crc >> 8) as u8,
                1,
                2,
                3,
                4,
                5,
                0x80
            ]
        );
        assert_eq!(&frames[1].1[..], &[6, 7, 8, 9, 10, 11, 12, 0x60]);
        assert_eq!(frames[0].0, frames[1].0);
    }

    #[test]
    fn multi_frame_is_all_or_nothing_on_exhaustion() {
        let mut arena = [PoolBlock::EMPTY; 2];
        let mut node = Node::new(&mut arena, AcceptAll::new(0));
        node.set_local_node_id(1).unwrap();

        // 15 payload bytes + CRC need 3 frames; only 2 blocks exist.
        let payload = [0u8; 15];
        let mut transfer_id = 0;
        let result = node.broadcast(
            &TxTransfer {
                data_type_id: 20,
                priority: TRANSFER_PRIORITY_MEDIUM,
                payload: &payload,
                ..Default::default()
            },
            &mut transfer_id,
        );

        assert_eq!(result, Err(Error::OutOfMemory));
        assert_eq!(transfer_id, 0);
        assert!(node.peek_tx_queue().is_none());
        assert_eq!(node.pool_statistics().current_usage_blocks, 0);
    }

    #[test]
    fn queue_orders_by_arbitration_fifo_among_equals() {
        let mut arena = [PoolBlock::EMPTY; 16];
        let mut node = Node::new(&mut arena, AcceptAll::new(0));
        node.set_local_node_id(7).unwrap();

        let mut transfer_id = 0;
        for (data_type_id, priority) in [(10u16, 24u8), (11, 8), (12, 24), (13, 0), (14, 8)] {
            node.broadcast(
                &TxTransfer {
                    data_type_id,
                    priority,
                    payload: &[priority],
                    ..Default::default()
                },
                &mut transfer_id,
            )
            .unwrap();
        }

        let frames = collect_tx_frames(&mut node);
        let mut previous: Option<u32> = None;
        for (id, _) in &frames {
            if let Some(previous) = previous {
                assert!(
                    !is_priority_higher(previous, *id),
                    "queue order violates arbitration"
                );
            }
            previous = Some(*id);
        }
        // FIFO among the two priority-8 transfers.
        let p8: [u16; 2] = [
            crate::transport::CanMessageId(frames[1].0).data_type_id(),
            crate::transport::CanMessageId(frames[2].0).data_type_id(),
        ];
        assert_eq!(p8, [11, 14]);
    }

    #[test]
    fn anonymous_broadcast_constraints() {
        let mut arena = [PoolBlock::EMPTY; 16];
        let mut node = Node::new(&mut arena, AcceptAll::new(0));
        let mut transfer_id = 0;

        // Payload beyond 7 bytes needs a node id.
        assert_eq!(
            node.broadcast(
                &TxTransfer {
                    data_type_id: 1,
                    payload: &[0; 8],
                    ..Default::default()
                },
                &mut transfer_id,
            ),
            Err(Error::NodeIdNotSet)
        );

        // The data type id must fit 2 bits.
        assert_eq!(
            node.broadcast(
                &TxTransfer {
                    data_type_id: 4,
                    payload: &[0; 4],
                    ..Default::default()
                },
                &mut transfer_id,
            ),
            Err(Error::InvalidArgument)
        );

        // A conforming anonymous broadcast carries a discriminator and a
        // zero source id.
        let frames = node
            .broadcast(
                &TxTransfer {
                    data_type_id: 3,
                    priority: TRANSFER_PRIORITY_MEDIUM,
                    payload: &[0xDE, 0xAD],
                    ..Default::default()
                },
                &mut transfer_id,
            )
            .unwrap();
        assert_eq!(frames, 1);

        let frame = node.peek_tx_queue().unwrap();
        let discriminator = u32::from(crc::add_bytes(crc::INITIAL, &[0xDE, 0xAD]) & 0x7FFE);
        let expected_id =
            u32::from(TRANSFER_PRIORITY_MEDIUM) << 24 | discriminator << 9 | 3 << 8;
        assert_eq!(frame.id, CAN_FRAME_EFF | expected_id);
    }

    #[test]
    fn response_does_not_advance_transfer_id() {
        let mut arena = [PoolBlock::EMPTY; 16];
        let mut node = Node::new(&mut arena, AcceptAll::new(0));
        node.set_local_node_id(5).unwrap();

        let mut transfer_id = 9;
        node.request_or_respond(
            8,
            &TxTransfer {
                data_type_id: 0x55,
                transfer_kind: TransferKind::Request,
                priority: TRANSFER_PRIORITY_MEDIUM,
                payload: &[1],
                ..Default::default()
            },
            &mut transfer_id,
        )
        .unwrap();
        assert_eq!(transfer_id, 10);

        node.request_or_respond(
            8,
            &TxTransfer {
                data_type_id: 0x55,
                transfer_kind: TransferKind::Response,
                priority: TRANSFER_PRIORITY_MEDIUM,
                payload: &[1],
                ..Default::default()
            },
            &mut transfer_id,
        )
        .unwrap();
        assert_eq!(transfer_id, 10);

        // Broadcast is not a service kind.
        assert_eq!(
            node.request_or_respond(
                8,
                &TxTransfer {
                    data_type_id: 0x55,
                    transfer_kind: TransferKind::Broadcast,
                    payload: &[1],
                    ..Default::default()
                },
                &mut transfer_id,
            ),
            Err(Error::InvalidArgument)
        );
    }

    #[test]
    fn service_id_formation() {
        let mut arena = [PoolBlock::EMPTY; 16];
        let mut node = Node::new(&mut arena, AcceptAll::new(0));
        node.set_local_node_id(5).unwrap();

        let mut transfer_id = 0;
        node.request_or_respond(
            8,
            &TxTransfer {
                data_type_id: 0xEE,
                transfer_kind: TransferKind::Request,
                priority: 31,
                payload: &[1, 2, 3],
                ..Default::default()
            },
            &mut transfer_id,
        )
        .unwrap();

        let id = crate::transport::CanServiceId(node.peek_tx_queue().unwrap().id);
        assert_eq!(id.priority(), 31);
        assert_eq!(id.service_type_id(), 0xEE);
        assert!(id.request_not_response());
        assert_eq!(id.destination_id(), 8);
        assert!(id.service_not_message());
        assert_eq!(id.source_id(), 5);
    }

    #[test]
    fn transfer_id_wraps_at_32() {
        let mut transfer_id = 30;
        increment_transfer_id(&mut transfer_id);
        assert_eq!(transfer_id, 31);
        increment_transfer_id(&mut transfer_id);
        assert_eq!(transfer_id, 0);
    }
}
