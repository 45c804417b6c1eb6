//! Aliases and ranges for the protocol's primitive values.

/// Node address on the bus. Address 0 is the broadcast/anonymous address and
/// is never assigned to a node.
pub type NodeId = u8;

/// Message data type id. 16 bits for regular messages, 8 for services, 2 for
/// anonymous messages.
pub type DataTypeId = u16;

/// 5-bit cyclic transfer counter.
pub type TransferId = u8;

pub const BROADCAST_NODE_ID: NodeId = 0;
pub const MIN_NODE_ID: NodeId = 1;
pub const MAX_NODE_ID: NodeId = 127;

pub const TRANSFER_ID_BIT_LEN: u8 = 5;
pub const ANON_MSG_DATA_TYPE_ID_BIT_LEN: u8 = 2;

/// Transfer priority is a plain 5-bit value; lower wins arbitration.
/// The named levels are the conventional anchors.
pub const TRANSFER_PRIORITY_HIGHEST: u8 = 0;
pub const TRANSFER_PRIORITY_HIGH: u8 = 8;
pub const TRANSFER_PRIORITY_MEDIUM: u8 = 16;
pub const TRANSFER_PRIORITY_LOW: u8 = 24;
pub const TRANSFER_PRIORITY_LOWEST: u8 = 31;
