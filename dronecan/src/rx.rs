//! Receive pipeline: frame acceptance, per-descriptor reassembly states,
//! toggle/transfer-id/CRC validation and delivery of completed transfers.

use crate::crc;
use crate::node::Node;
use crate::pool::{
    rx_state_at, Block, BlockIndex, Pool, BUFFER_BLOCK_DATA_SIZE, RX_PAYLOAD_HEAD_SIZE,
};
use crate::transfer::{RxTransfer, TransferDescriptor, TransferKind};
use crate::transport::{
    extract_data_type, extract_transfer_kind, CanFrame, CanMessageId, CanServiceId, TailByte,
    CAN_FRAME_EFF, CAN_FRAME_ERR, CAN_FRAME_RTR,
};
use crate::types::{TransferId, BROADCAST_NODE_ID};
use crate::{Error, TransferHandler};

/// Reassembly state for one transfer descriptor. Lives in a pool block;
/// short payload prefixes stay in the inline head buffer.
pub(crate) struct RxState {
    pub next: Option<BlockIndex>,
    pub buffer_blocks: Option<BlockIndex>,
    pub descriptor: TransferDescriptor,
    pub calculated_crc: u16,
    pub payload_crc: u16,
    pub payload_len: u16,
    pub timestamp_usec: u64,
    pub iface_id: u8,
    pub next_toggle: bool,
    pub transfer_id: TransferId,
    pub buffer_head: [u8; RX_PAYLOAD_HEAD_SIZE],
}

impl RxState {
    fn new(descriptor: TransferDescriptor) -> Self {
        RxState {
            next: None,
            buffer_blocks: None,
            descriptor,
            calculated_crc: 0,
            payload_crc: 0,
            payload_len: 0,
            timestamp_usec: 0,
            iface_id: 0,
            next_toggle: false,
            transfer_id: 0,
            buffer_head: [0; RX_PAYLOAD_HEAD_SIZE],
        }
    }

    /// Primes the state for the follow-up transfer; the payload must already
    /// be released or handed off.
    fn prepare_for_next_transfer(&mut self) {
        debug_assert!(self.buffer_blocks.is_none());
        self.transfer_id = self.transfer_id.wrapping_add(1) & 31;
        self.payload_len = 0;
        self.next_toggle = false;
    }
}

/// Forward distance from `b` to `a` on the 5-bit transfer-id circle.
fn transfer_id_forward_distance(a: TransferId, b: TransferId) -> u8 {
    a.wrapping_sub(b) & 31
}

impl<H: TransferHandler> Node<'_, H> {
    /// Processes one received frame.
    ///
    /// Frames must arrive in bus order per descriptor. Completed transfers
    /// are delivered to the handler from inside this call; every rejection
    /// leaves the engine consistent for the next frame.
    pub fn handle_rx_frame(&mut self, frame: &CanFrame, timestamp_usec: u64) -> Result<(), Error> {
        let transfer_kind = extract_transfer_kind(frame.id);
        let destination_node_id = if transfer_kind == TransferKind::Broadcast {
            BROADCAST_NODE_ID
        } else {
            CanServiceId(frame.id).destination_id()
        };

        if frame.id & CAN_FRAME_EFF == 0
            || frame.id & CAN_FRAME_RTR != 0
            || frame.id & CAN_FRAME_ERR != 0
            || frame.payload.is_empty()
        {
            return Err(Error::RxIncompatiblePacket);
        }

        if transfer_kind != TransferKind::Broadcast
            && destination_node_id != self.node_id.unwrap_or(BROADCAST_NODE_ID)
        {
            return Err(Error::RxWrongAddress);
        }

        let priority = CanMessageId(frame.id).priority();
        let source_node_id = CanMessageId(frame.id).source_id();
        let data_type_id = extract_data_type(frame.id);
        let descriptor =
            TransferDescriptor::new(data_type_id, transfer_kind, source_node_id, destination_node_id);

        let tail = TailByte(*frame.payload.last().unwrap());

        let mut data_type_signature = 0;

        let state_index = if tail.start_of_transfer() {
            match self
                .handler
                .should_accept(data_type_id, transfer_kind, source_node_id)
            {
                Some(signature) => {
                    data_type_signature = signature;
                    self.find_or_create_rx_state(descriptor)
                        .ok_or(Error::OutOfMemory)?
                }
                None => return Err(Error::RxNotWanted),
            }
        } else {
            match self.find_rx_state(descriptor) {
                Some(index) => index,
                None => {
                    // No state means the start was either rejected or lost.
                    // Asking the predicate here keeps it off the per-frame
                    // path of transfers that are being accepted.
                    if self
                        .handler
                        .should_accept(data_type_id, transfer_kind, source_node_id)
                        .is_none()
                    {
                        return Err(Error::RxNotWanted);
                    }
                    return Err(Error::RxMissedStart);
                }
            }
        };

        let first_frame = tail.start_of_transfer();
        let need_restart = {
            let state = self.pool.rx_state(state_index);
            let elapsed = timestamp_usec.wrapping_sub(state.timestamp_usec);

            let not_initialized = state.timestamp_usec == 0;
            let tid_timed_out = elapsed > self.config.transfer_timeout_usec;
            let same_iface = frame.iface_id == state.iface_id;
            let not_previous_tid =
                transfer_id_forward_distance(state.transfer_id, tail.transfer_id()) > 1;
            let iface_switch_allowed = elapsed > self.config.iface_switch_delay_usec;
            let non_wrapped_tid =
                transfer_id_forward_distance(tail.transfer_id(), state.transfer_id) < 16;
            let incomplete_frame = state.buffer_blocks.is_some();

            not_initialized
                || tid_timed_out
                || (same_iface && first_frame && (not_previous_tid || incomplete_frame))
                || (iface_switch_allowed && first_frame && non_wrapped_tid)
        };

        if need_restart {
            self.release_state_payload(state_index);
            let state = self.pool.rx_state_mut(state_index);
            state.transfer_id = tail.transfer_id();
            state.next_toggle = false;
            state.iface_id = frame.iface_id;
            if !first_frame {
                state.transfer_id = state.transfer_id.wrapping_add(1) & 31;
                return Err(Error::RxMissedStart);
            }
        }

        if frame.iface_id != self.pool.rx_state(state_index).iface_id {
            // Not the accepting interface; drop without an error.
            return Ok(());
        }

        #[cfg(feature = "canfd")]
        let tao = !(frame.canfd || self.tao_disabled);
        #[cfg(all(feature = "tao", not(feature = "canfd")))]
        let tao = !self.tao_disabled;

        let frame_payload = &frame.payload[..frame.payload.len() - 1];

        if tail.start_of_transfer() && tail.end_of_transfer() {
            // Single-frame transfer, delivered straight from the frame.
            self.pool.rx_state_mut(state_index).timestamp_usec = timestamp_usec;

            let Node { pool, handler, .. } = self;
            let transfer = RxTransfer {
                timestamp_usec,
                data_type_id,
                transfer_kind,
                transfer_id: tail.transfer_id(),
                priority,
                source_node_id,
                #[cfg(feature = "canfd")]
                canfd: frame.canfd,
                #[cfg(any(feature = "canfd", feature = "tao"))]
                tao,
                payload_len: frame_payload.len() as u16,
                payload_head: frame_payload,
                payload_middle: None,
                payload_tail: &[],
                blocks: pool.blocks(),
            };
            handler.on_transfer_reception(&transfer);

            self.pool
                .rx_state_mut(state_index)
                .prepare_for_next_transfer();
            return Ok(());
        }

        if tail.toggle() != self.pool.rx_state(state_index).next_toggle {
            return Err(Error::RxWrongToggle);
        }
        if tail.transfer_id() != self.pool.rx_state(state_index).transfer_id {
            return Err(Error::RxUnexpectedTid);
        }

        if tail.start_of_transfer() && !tail.end_of_transfer() {
            // First frame: two CRC bytes, at least one payload byte, tail.
            if frame.payload.len() <= 3 {
                return Err(Error::RxShortFrame);
            }

            {
                let state = self.pool.rx_state_mut(state_index);
                state.timestamp_usec = timestamp_usec;
                state.payload_len = 0;
            }

            let payload_after_crc = &frame.payload[2..frame.payload.len() - 1];
            if buffer_push_bytes(&mut self.pool, state_index, payload_after_crc).is_err() {
                self.release_state_payload(state_index);
                self.pool
                    .rx_state_mut(state_index)
                    .prepare_for_next_transfer();
                return Err(Error::OutOfMemory);
            }

            let state = self.pool.rx_state_mut(state_index);
            state.payload_crc = u16::from(frame.payload[0]) | u16::from(frame.payload[1]) << 8;
            state.calculated_crc = crc::add_signature(crc::INITIAL, data_type_signature);
            state.calculated_crc = crc::add_bytes(state.calculated_crc, payload_after_crc);
        } else if !tail.start_of_transfer() && !tail.end_of_transfer() {
            // Middle frame.
            if buffer_push_bytes(&mut self.pool, state_index, frame_payload).is_err() {
                self.release_state_payload(state_index);
                self.pool
                    .rx_state_mut(state_index)
                    .prepare_for_next_transfer();
                return Err(Error::OutOfMemory);
            }

            let state = self.pool.rx_state_mut(state_index);
            state.calculated_crc = crc::add_bytes(state.calculated_crc, frame_payload);
        } else {
            // Final frame: merge, validate the CRC, deliver, reclaim.
            let mut tail_offset = 0;

            // The beginning of the final frame tops up the head buffer or
            // the last chained block; whatever is left rides along as the
            // transfer's tail slice.
            let state_payload_len = usize::from(self.pool.rx_state(state_index).payload_len);
            if state_payload_len < RX_PAYLOAD_HEAD_SIZE {
                let state = self.pool.rx_state_mut(state_index);
                let mut i = state_payload_len;
                while i < RX_PAYLOAD_HEAD_SIZE && tail_offset < frame_payload.len() {
                    state.buffer_head[i] = frame_payload[tail_offset];
                    i += 1;
                    tail_offset += 1;
                }
            } else if let Some(first) = self.pool.rx_state(state_index).buffer_blocks {
                let mut block_index = first;
                let mut offset = RX_PAYLOAD_HEAD_SIZE;
                while let Some(next) = self.pool.buffer(block_index).next {
                    block_index = next;
                    offset += BUFFER_BLOCK_DATA_SIZE;
                }
                let offset_within_block = state_payload_len - offset;
                debug_assert!(offset_within_block <= BUFFER_BLOCK_DATA_SIZE);

                let block = self.pool.buffer_mut(block_index);
                let mut i = offset_within_block;
                while i < BUFFER_BLOCK_DATA_SIZE && tail_offset < frame_payload.len() {
                    block.data[i] = frame_payload[tail_offset];
                    i += 1;
                    tail_offset += 1;
                }
            }

            let (calculated_crc, payload_crc, total_len, payload_middle) = {
                let state = self.pool.rx_state_mut(state_index);
                state.calculated_crc = crc::add_bytes(state.calculated_crc, frame_payload);
                (
                    state.calculated_crc,
                    state.payload_crc,
                    state.payload_len + frame_payload.len() as u16,
                    // Chain ownership moves to the delivered transfer.
                    state.buffer_blocks.take(),
                )
            };

            let crc_ok = calculated_crc == payload_crc;
            if crc_ok {
                let Node { pool, handler, .. } = self;
                let blocks = pool.blocks();
                let transfer = RxTransfer {
                    timestamp_usec,
                    data_type_id,
                    transfer_kind,
                    transfer_id: tail.transfer_id(),
                    priority,
                    source_node_id,
                    #[cfg(feature = "canfd")]
                    canfd: frame.canfd,
                    #[cfg(any(feature = "canfd", feature = "tao"))]
                    tao,
                    payload_len: total_len,
                    payload_head: &rx_state_at(blocks, state_index).buffer_head,
                    payload_middle,
                    payload_tail: if tail_offset >= frame_payload.len() {
                        &[]
                    } else {
                        &frame_payload[tail_offset..]
                    },
                    blocks,
                };
                handler.on_transfer_reception(&transfer);
            }

            // Reclaim whatever the delivery did not consume.
            let mut block = payload_middle;
            while let Some(index) = block {
                block = self.pool.buffer(index).next;
                self.pool.free(index);
            }
            self.pool
                .rx_state_mut(state_index)
                .prepare_for_next_transfer();

            return if crc_ok { Ok(()) } else { Err(Error::RxBadCrc) };
        }

        let state = self.pool.rx_state_mut(state_index);
        state.next_toggle = !state.next_toggle;
        Ok(())
    }

    fn find_rx_state(&self, descriptor: TransferDescriptor) -> Option<BlockIndex> {
        let mut cursor = self.rx_states;
        while let Some(index) = cursor {
            let state = self.pool.rx_state(index);
            if state.descriptor == descriptor {
                return Some(index);
            }
            cursor = state.next;
        }
        None
    }

    /// Finds the state for `descriptor`, creating and prepending one if none
    /// exists. `None` on pool exhaustion.
    fn find_or_create_rx_state(&mut self, descriptor: TransferDescriptor) -> Option<BlockIndex> {
        if let Some(index) = self.find_rx_state(descriptor) {
            return Some(index);
        }
        let index = self.pool.allocate(Block::Rx(RxState::new(descriptor)))?;
        self.pool.rx_state_mut(index).next = self.rx_states;
        self.rx_states = Some(index);
        Some(index)
    }

    pub(crate) fn release_state_payload(&mut self, state_index: BlockIndex) {
        while let Some(block_index) = self.pool.rx_state(state_index).buffer_blocks {
            let next = self.pool.buffer(block_index).next;
            self.pool.rx_state_mut(state_index).buffer_blocks = next;
            self.pool.free(block_index);
        }
        self.pool.rx_state_mut(state_index).payload_len = 0;
    }
}

/// Appends `data` to a state's payload: the inline head fills first, then
/// chained blocks are extended on demand. On exhaustion the bytes written so
/// far stay in place; the caller releases the whole payload.
fn buffer_push_bytes(
    pool: &mut Pool<'_>,
    state_index: BlockIndex,
    data: &[u8],
) -> Result<(), Error> {
    let mut data_index = 0;

    {
        let state = pool.rx_state_mut(state_index);
        let payload_len = usize::from(state.payload_len);
        if payload_len < RX_PAYLOAD_HEAD_SIZE {
            let n = data.len().min(RX_PAYLOAD_HEAD_SIZE - payload_len);
            state.buffer_head[payload_len..payload_len + n].copy_from_slice(&data[..n]);
            data_index = n;
            if data_index >= data.len() {
                state.payload_len += data.len() as u16;
                return Ok(());
            }
        }
    }

    let payload_len = usize::from(pool.rx_state(state_index).payload_len);
    let mut index_at_nth_block;
    let mut block_index;

    match pool.rx_state(state_index).buffer_blocks {
        None => {
            block_index = pool.allocate_buffer().ok_or(Error::OutOfMemory)?;
            pool.rx_state_mut(state_index).buffer_blocks = Some(block_index);
            index_at_nth_block = 0;
        }
        Some(first) => {
            // The head is full, so the running length locates the write
            // position inside the last block.
            index_at_nth_block = (payload_len - RX_PAYLOAD_HEAD_SIZE) % BUFFER_BLOCK_DATA_SIZE;

            let mut nth_block = 1;
            block_index = first;
            while let Some(next) = pool.buffer(block_index).next {
                nth_block += 1;
                block_index = next;
            }

            let num_buffer_blocks =
                (payload_len + data.len() - RX_PAYLOAD_HEAD_SIZE) / BUFFER_BLOCK_DATA_SIZE + 1;
            if num_buffer_blocks > nth_block && index_at_nth_block == 0 {
                let new_block = pool.allocate_buffer().ok_or(Error::OutOfMemory)?;
                pool.buffer_mut(block_index).next = Some(new_block);
                block_index = new_block;
            }
        }
    }

    while data_index < data.len() {
        let n = (data.len() - data_index).min(BUFFER_BLOCK_DATA_SIZE - index_at_nth_block);
        pool.buffer_mut(block_index).data[index_at_nth_block..index_at_nth_block + n]
            .copy_from_slice(&data[data_index..data_index + n]);
        data_index += n;
        index_at_nth_block += n;

        if data_index < data.len() {
            let new_block = pool.allocate_buffer().ok_or(Error::OutOfMemory)?;
            pool.buffer_mut(block_index).next = Some(new_block);
            block_index = new_block;
            index_at_nth_block = 0;
        }
    }

    let state = pool.rx_state_mut(state_index);
    state.payload_len += data.len() as u16;
    Ok(())
}
