//! # UAVCAN v0 transport engine
//!
//! Allocation-bounded implementation of the UAVCAN v0 ("DroneCAN")
//! transport over Classic CAN 2.0B and CAN FD. The engine fragments
//! outgoing transfers into priority-ordered CAN frames, reassembles
//! incoming frames into transfers with toggle/transfer-id/CRC validation,
//! and delivers completed transfers to the host through the
//! [`TransferHandler`] trait.
//!
//! Every piece of per-transfer state is carved out of one caller-supplied
//! arena of [`PoolBlock`]s, so worst-case memory use is fixed at
//! construction and the crate never touches a heap. There is no scheduling
//! or I/O inside: the host feeds frames to [`Node::handle_rx_frame`],
//! drains [`Node::peek_tx_queue`]/[`Node::pop_tx_queue`] into its CAN
//! driver, and calls [`Node::cleanup_stale_transfers`] periodically.
//!
//! Drivers, node applications, dynamic node-id allocation and any
//! publish/subscribe layering live outside this crate.
#![no_std]

#[allow(unused_imports)]
#[cfg(any(feature = "std", test))]
#[macro_use]
extern crate std;

#[macro_use]
extern crate num_derive;

pub mod codec;
pub mod pool;
pub mod transfer;
pub mod transport;
pub mod types;

mod crc;
mod node;
mod rx;
mod tx;

pub use node::{Config, Node, TransferHandler};
pub use pool::{PoolBlock, PoolStatistics};
pub use transfer::{RxTransfer, TransferKind, TxTransfer};
pub use transport::CanFrame;

/// Engine error codes. Frame-level rejections apply to the offending frame
/// only; the engine stays consistent and keeps processing.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error {
    /// A caller-supplied argument violates the contract.
    InvalidArgument,
    /// The block pool is exhausted. Non-fatal; retry after resources free
    /// up. Multi-frame transmissions fail whole, never partially.
    OutOfMemory,
    /// The operation needs an assigned node id (or, for anonymous
    /// broadcasts, a payload small enough for a single frame).
    NodeIdNotSet,
    /// Internal invariant violation.
    Internal,
    /// Not an extended data frame, or no payload at all.
    RxIncompatiblePacket,
    /// Service transfer addressed to some other node.
    RxWrongAddress,
    /// The accept-predicate declined the transfer.
    RxNotWanted,
    /// Non-start frame with no reassembly in progress.
    RxMissedStart,
    /// Toggle bit out of sequence, usually a duplicated or dropped frame.
    RxWrongToggle,
    /// Frame belongs to a different transfer than the one in progress.
    RxUnexpectedTid,
    /// First frame of a multi-frame transfer too short to carry the CRC
    /// and any payload.
    RxShortFrame,
    /// Transfer completed but its CRC does not match; nothing delivered.
    RxBadCrc,
}
