//! The engine instance: one [`Node`] ties the block pool, the transmit and
//! receive pipelines and the host's handler together. The host drives it by
//! feeding received frames in, draining the transmit queue, and calling the
//! janitor periodically; the engine itself never blocks, spawns or sleeps.

use crate::pool::{BlockIndex, Pool, PoolBlock, PoolStatistics};
use crate::transfer::{RxTransfer, TransferKind};
use crate::transport::CanFrame;
use crate::types::{DataTypeId, NodeId, MAX_NODE_ID, MIN_NODE_ID};
use crate::Error;

/// Host-side callbacks, passed in at construction. The handler value itself
/// carries whatever state the host wants available during delivery; the
/// node hands it back through [`Node::handler`]/[`Node::handler_mut`].
pub trait TransferHandler {
    /// Accept-predicate, consulted on the first frame of every transfer
    /// (and on stray non-start frames with no reassembly in progress).
    /// Return the expected 64-bit data type signature to accept the
    /// transfer, `None` to reject it.
    fn should_accept(
        &mut self,
        data_type_id: DataTypeId,
        transfer_kind: TransferKind,
        source_node_id: NodeId,
    ) -> Option<u64>;

    /// Delivery of a completed, CRC-valid transfer. The payload is only
    /// valid for the duration of the call; the engine reclaims it
    /// afterwards.
    fn on_transfer_reception(&mut self, transfer: &RxTransfer<'_>);
}

/// Instance-level timing knobs. The defaults are the protocol's reference
/// values and are what every deployment is expected to run with.
#[derive(Copy, Clone, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Config {
    /// A reassembly older than this is abandoned and its state reclaimed.
    pub transfer_timeout_usec: u64,
    /// Quiet period after which reception may follow a redundant interface.
    pub iface_switch_delay_usec: u64,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            transfer_timeout_usec: 2_000_000,
            iface_switch_delay_usec: 1_000_000,
        }
    }
}

/// A UAVCAN v0 transport engine instance.
///
/// All per-transfer state lives in the caller-supplied arena; the node
/// itself is a handful of list heads. Nothing here is re-entrant: the host
/// serializes access by holding the `&mut`.
pub struct Node<'arena, H: TransferHandler> {
    pub(crate) node_id: Option<NodeId>,
    pub(crate) handler: H,
    pub(crate) pool: Pool<'arena>,
    pub(crate) rx_states: Option<BlockIndex>,
    pub(crate) tx_queue: Option<BlockIndex>,
    pub(crate) config: Config,
    #[cfg(any(feature = "canfd", feature = "tao"))]
    pub(crate) tao_disabled: bool,
}

impl<'arena, H: TransferHandler> Node<'arena, H> {
    /// Builds a node over `arena` with the default [`Config`]. Capacity is
    /// the arena length, capped at 65535 blocks.
    pub fn new(arena: &'arena mut [PoolBlock], handler: H) -> Self {
        Self::with_config(arena, handler, Config::default())
    }

    pub fn with_config(arena: &'arena mut [PoolBlock], handler: H, config: Config) -> Self {
        Node {
            node_id: None,
            handler,
            pool: Pool::new(arena),
            rx_states: None,
            tx_queue: None,
            config,
            #[cfg(any(feature = "canfd", feature = "tao"))]
            tao_disabled: false,
        }
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    pub fn handler_mut(&mut self) -> &mut H {
        &mut self.handler
    }

    /// `None` while the node is anonymous.
    pub fn local_node_id(&self) -> Option<NodeId> {
        self.node_id
    }

    /// One-shot node id assignment: accepted only while anonymous and only
    /// for ids in 1..=127.
    pub fn set_local_node_id(&mut self, node_id: NodeId) -> Result<(), Error> {
        if self.node_id.is_none() && (MIN_NODE_ID..=MAX_NODE_ID).contains(&node_id) {
            self.node_id = Some(node_id);
            Ok(())
        } else {
            Err(Error::InvalidArgument)
        }
    }

    /// Returns the node to the anonymous state, after which
    /// [`Node::set_local_node_id`] may be called again.
    pub fn forget_local_node_id(&mut self) {
        self.node_id = None;
    }

    /// Disables the tail-array-optimization hint on delivered transfers.
    #[cfg(any(feature = "canfd", feature = "tao"))]
    pub fn set_tao_disabled(&mut self, disabled: bool) {
        self.tao_disabled = disabled;
    }

    /// The highest-priority queued frame, if any. The frame stays queued
    /// until [`Node::pop_tx_queue`].
    pub fn peek_tx_queue(&self) -> Option<&CanFrame> {
        self.tx_queue.map(|index| &self.pool.tx_item(index).frame)
    }

    /// Mutable variant of [`Node::peek_tx_queue`], for hosts that strip
    /// interface-mask bits as they hand the frame to each driver.
    pub fn peek_tx_queue_mut(&mut self) -> Option<&mut CanFrame> {
        self.tx_queue
            .map(|index| &mut self.pool.tx_item_mut(index).frame)
    }

    /// Destroys the head of the transmit queue. No-op when empty.
    pub fn pop_tx_queue(&mut self) {
        if let Some(index) = self.tx_queue {
            self.tx_queue = self.pool.tx_item(index).next;
            self.pool.free(index);
        }
    }

    /// Reclaims reassembly states whose transfer started longer than the
    /// transfer timeout ago, and (feature-gated) transmit items past their
    /// deadline or with an exhausted interface mask. Call this periodically.
    pub fn cleanup_stale_transfers(&mut self, current_time_usec: u64) {
        let mut previous: Option<BlockIndex> = None;
        let mut cursor = self.rx_states;
        while let Some(index) = cursor {
            let (timestamp, next) = {
                let state = self.pool.rx_state(index);
                (state.timestamp_usec, state.next)
            };
            if current_time_usec.wrapping_sub(timestamp) > self.config.transfer_timeout_usec {
                self.release_state_payload(index);
                match previous {
                    None => self.rx_states = next,
                    Some(previous) => self.pool.rx_state_mut(previous).next = next,
                }
                self.pool.free(index);
            } else {
                previous = Some(index);
            }
            cursor = next;
        }

        #[cfg(any(feature = "deadline", feature = "multi-iface"))]
        {
            let mut previous: Option<BlockIndex> = None;
            let mut cursor = self.tx_queue;
            while let Some(index) = cursor {
                let (next, expired) = {
                    let item = self.pool.tx_item(index);
                    #[cfg(all(feature = "deadline", feature = "multi-iface"))]
                    let expired = current_time_usec > item.frame.deadline_usec
                        || item.frame.iface_mask == 0;
                    #[cfg(all(feature = "deadline", not(feature = "multi-iface")))]
                    let expired = current_time_usec > item.frame.deadline_usec;
                    #[cfg(all(feature = "multi-iface", not(feature = "deadline")))]
                    let expired = item.frame.iface_mask == 0;
                    (item.next, expired)
                };
                if expired {
                    match previous {
                        None => self.tx_queue = next,
                        Some(previous) => self.pool.tx_item_mut(previous).next = next,
                    }
                    self.pool.free(index);
                } else {
                    previous = Some(index);
                }
                cursor = next;
            }
        }
    }

    pub fn pool_statistics(&self) -> PoolStatistics {
        self.pool.statistics()
    }
}
