//! Bit-level views of the 29-bit extended CAN identifier and the tail byte.
//!
//! Identifier layout, LSB first: source node id (7 bits), service flag,
//! then for messages a 16-bit data type id, for services destination (7),
//! request flag and service type id (8); the top 5 bits are the priority.

use bitfield::bitfield;

use crate::types::{DataTypeId, NodeId, TransferId, TRANSFER_ID_BIT_LEN};

bitfield! {
    /// Identifier of a message (broadcast) frame.
    #[derive(Copy, Clone)]
    pub struct CanMessageId(u32);
    impl Debug;
    pub u8, source_id, set_source_id: 6, 0;
    pub service_not_message, set_service_not_message: 7;
    pub u16, data_type_id, set_data_type_id: 23, 8;
    pub u8, priority, set_priority: 28, 24;
}

impl CanMessageId {
    pub fn new(priority: u8, data_type_id: DataTypeId, source: NodeId) -> Self {
        let mut id = CanMessageId(0);
        id.set_priority(priority);
        id.set_data_type_id(data_type_id);
        id.set_source_id(source);
        id
    }
}

bitfield! {
    /// Identifier of a service (request or response) frame.
    #[derive(Copy, Clone)]
    pub struct CanServiceId(u32);
    impl Debug;
    pub u8, source_id, set_source_id: 6, 0;
    pub service_not_message, set_service_not_message: 7;
    pub u8, destination_id, set_destination_id: 14, 8;
    pub request_not_response, set_request_not_response: 15;
    pub u8, service_type_id, set_service_type_id: 23, 16;
    pub u8, priority, set_priority: 28, 24;
}

impl CanServiceId {
    pub fn new(
        priority: u8,
        request: bool,
        service_type_id: u8,
        destination: NodeId,
        source: NodeId,
    ) -> Self {
        let mut id = CanServiceId(0);
        id.set_priority(priority);
        id.set_service_type_id(service_type_id);
        id.set_request_not_response(request);
        id.set_destination_id(destination);
        id.set_service_not_message(true);
        id.set_source_id(source);
        id
    }
}

bitfield! {
    /// Final data byte of every frame: start/end of transfer, toggle, and
    /// the 5-bit transfer id.
    #[derive(Copy, Clone)]
    pub struct TailByte(u8);
    impl Debug;
    pub u8, transfer_id, set_transfer_id: 4, 0;
    pub toggle, set_toggle: 5;
    pub end_of_transfer, set_end_of_transfer: 6;
    pub start_of_transfer, set_start_of_transfer: 7;
}

impl TailByte {
    pub fn new(start: bool, end: bool, toggle: bool, transfer_id: TransferId) -> Self {
        let mut tail = TailByte(0);
        tail.set_start_of_transfer(start);
        tail.set_end_of_transfer(end);
        tail.set_toggle(toggle);
        tail.set_transfer_id(transfer_id & ((1 << TRANSFER_ID_BIT_LEN) - 1));
        tail
    }
}
