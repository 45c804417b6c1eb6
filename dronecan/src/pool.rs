//! Fixed-block pool allocator backing all per-transfer state.
//!
//! The caller hands the engine one uniform arena of [`PoolBlock`]s. Every
//! reassembly state, payload buffer block and transmit queue item is carved
//! out of that arena, so the engine's worst-case memory use is fixed at
//! construction and it never touches a general allocator.
//!
//! Blocks link to each other through 16-bit [`BlockIndex`] handles instead of
//! references, which keeps every structure the same size on 32- and 64-bit
//! hosts and sidesteps self-referential borrows.

use crate::rx::RxState;
use crate::tx::TxQueueItem;

/// Payload bytes carried by one chained buffer block.
#[cfg(not(feature = "canfd"))]
pub const BUFFER_BLOCK_DATA_SIZE: usize = 28;
#[cfg(feature = "canfd")]
pub const BUFFER_BLOCK_DATA_SIZE: usize = 64;

/// Payload prefix stored directly inside a reassembly state, so that short
/// multi-frame transfers never need a chained block.
pub const RX_PAYLOAD_HEAD_SIZE: usize = 6;

/// One link of a multi-frame payload chain.
pub(crate) struct BufferBlock {
    pub next: Option<BlockIndex>,
    pub data: [u8; BUFFER_BLOCK_DATA_SIZE],
}

impl BufferBlock {
    fn new() -> Self {
        BufferBlock {
            next: None,
            data: [0; BUFFER_BLOCK_DATA_SIZE],
        }
    }
}

/// Handle to a block of the arena. Always 16 bits, so structures holding one
/// have identical layout on every host width.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) struct BlockIndex(u16);

impl BlockIndex {
    fn index(self) -> usize {
        usize::from(self.0)
    }
}

/// What currently lives in a block. A block on the free list is `Free`; an
/// allocated block is exactly one of the concrete per-transfer structures.
pub(crate) enum Block {
    Free { next: Option<BlockIndex> },
    Rx(RxState),
    Buffer(BufferBlock),
    Tx(TxQueueItem),
}

/// One uniform block of the caller-supplied arena.
///
/// Build the arena as `[PoolBlock::EMPTY; N]`; the pool threads the blocks
/// onto its free list when the instance is constructed.
pub struct PoolBlock(pub(crate) Block);

impl PoolBlock {
    /// An unlinked block, fit for array-repeat arena initialization.
    pub const EMPTY: PoolBlock = PoolBlock(Block::Free { next: None });

    pub const fn new() -> Self {
        Self::EMPTY
    }
}

impl Default for PoolBlock {
    fn default() -> Self {
        Self::new()
    }
}

/// Pool usage counters, queryable through the instance.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct PoolStatistics {
    pub capacity_blocks: u16,
    pub current_usage_blocks: u16,
    pub peak_usage_blocks: u16,
}

pub(crate) struct Pool<'arena> {
    blocks: &'arena mut [PoolBlock],
    free_list: Option<BlockIndex>,
    statistics: PoolStatistics,
}

impl<'arena> Pool<'arena> {
    /// Threads up to 65535 blocks of `arena` onto the free list in index
    /// order; any excess is left untouched.
    pub fn new(arena: &'arena mut [PoolBlock]) -> Self {
        let capacity = arena.len().min(usize::from(u16::MAX));
        let blocks = &mut arena[..capacity];

        for (i, block) in blocks.iter_mut().enumerate() {
            let next = if i + 1 < capacity {
                Some(BlockIndex((i + 1) as u16))
            } else {
                None
            };
            block.0 = Block::Free { next };
        }

        Pool {
            blocks,
            free_list: if capacity > 0 { Some(BlockIndex(0)) } else { None },
            statistics: PoolStatistics {
                capacity_blocks: capacity as u16,
                current_usage_blocks: 0,
                peak_usage_blocks: 0,
            },
        }
    }

    /// Takes the free-list head and moves `contents` into it. `None` on
    /// exhaustion. O(1).
    pub fn allocate(&mut self, contents: Block) -> Option<BlockIndex> {
        let head = self.free_list?;
        match self.blocks[head.index()].0 {
            Block::Free { next } => self.free_list = next,
            _ => unreachable!("free list points at a live block"),
        }
        self.blocks[head.index()].0 = contents;

        self.statistics.current_usage_blocks += 1;
        if self.statistics.peak_usage_blocks < self.statistics.current_usage_blocks {
            self.statistics.peak_usage_blocks = self.statistics.current_usage_blocks;
        }
        Some(head)
    }

    pub fn allocate_buffer(&mut self) -> Option<BlockIndex> {
        self.allocate(Block::Buffer(BufferBlock::new()))
    }

    /// Returns a block to the head of the free list. O(1).
    pub fn free(&mut self, index: BlockIndex) {
        debug_assert!(self.statistics.current_usage_blocks > 0);
        self.blocks[index.index()].0 = Block::Free {
            next: self.free_list,
        };
        self.free_list = Some(index);
        self.statistics.current_usage_blocks -= 1;
    }

    pub fn statistics(&self) -> PoolStatistics {
        self.statistics
    }

    pub fn free_blocks(&self) -> u16 {
        self.statistics.capacity_blocks - self.statistics.current_usage_blocks
    }

    /// Shared view of the arena, for walking payload chains during delivery.
    pub fn blocks(&self) -> &[PoolBlock] {
        self.blocks
    }

    // Typed views of allocated blocks. The tag is an internal invariant;
    // a mismatch is a corrupted arena and stops the program.

    pub fn rx_state(&self, index: BlockIndex) -> &RxState {
        match &self.blocks[index.index()].0 {
            Block::Rx(state) => state,
            _ => unreachable!("block is not an rx state"),
        }
    }

    pub fn rx_state_mut(&mut self, index: BlockIndex) -> &mut RxState {
        match &mut self.blocks[index.index()].0 {
            Block::Rx(state) => state,
            _ => unreachable!("block is not an rx state"),
        }
    }

    pub fn buffer(&self, index: BlockIndex) -> &BufferBlock {
        buffer_at(self.blocks, index)
    }

    pub fn buffer_mut(&mut self, index: BlockIndex) -> &mut BufferBlock {
        match &mut self.blocks[index.index()].0 {
            Block::Buffer(block) => block,
            _ => unreachable!("block is not a payload buffer"),
        }
    }

    pub fn tx_item(&self, index: BlockIndex) -> &TxQueueItem {
        match &self.blocks[index.index()].0 {
            Block::Tx(item) => item,
            _ => unreachable!("block is not a tx queue item"),
        }
    }

    pub fn tx_item_mut(&mut self, index: BlockIndex) -> &mut TxQueueItem {
        match &mut self.blocks[index.index()].0 {
            Block::Tx(item) => item,
            _ => unreachable!("block is not a tx queue item"),
        }
    }
}

/// [`Pool::buffer`] over a shared arena slice, for payload views that
/// outlive the pool borrow.
pub(crate) fn buffer_at(blocks: &[PoolBlock], index: BlockIndex) -> &BufferBlock {
    match &blocks[index.index()].0 {
        Block::Buffer(block) => block,
        _ => unreachable!("block is not a payload buffer"),
    }
}

/// [`Pool::rx_state`] over a shared arena slice.
pub(crate) fn rx_state_at(blocks: &[PoolBlock], index: BlockIndex) -> &RxState {
    match &blocks[index.index()].0 {
        Block::Rx(state) => state,
        _ => unreachable!("block is not an rx state"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const AVAILABLE_BLOCKS: usize = 3;

    fn free_list_len(pool: &Pool<'_>) -> usize {
        let mut len = 0;
        let mut cursor = pool.free_list;
        while let Some(index) = cursor {
            len += 1;
            cursor = match pool.blocks[index.index()].0 {
                Block::Free { next } => next,
                _ => panic!("free list points at a live block"),
            };
        }
        len
    }

    #[test]
    fn free_list_is_constructed_correctly() {
        let mut arena = [PoolBlock::EMPTY; AVAILABLE_BLOCKS];
        let pool = Pool::new(&mut arena);

        assert_eq!(pool.free_list, Some(BlockIndex(0)));
        match pool.blocks[0].0 {
            Block::Free { next } => assert_eq!(next, Some(BlockIndex(1))),
            _ => panic!(),
        }
        match pool.blocks[1].0 {
            Block::Free { next } => assert_eq!(next, Some(BlockIndex(2))),
            _ => panic!(),
        }
        match pool.blocks[2].0 {
            Block::Free { next } => assert_eq!(next, None),
            _ => panic!(),
        }

        assert_eq!(pool.statistics().capacity_blocks, AVAILABLE_BLOCKS as u16);
        assert_eq!(pool.statistics().current_usage_blocks, 0);
        assert_eq!(pool.statistics().peak_usage_blocks, 0);
    }

    #[test]
    fn can_allocate_block() {
        let mut arena = [PoolBlock::EMPTY; AVAILABLE_BLOCKS];
        let mut pool = Pool::new(&mut arena);

        let block = pool.allocate_buffer();

        assert_eq!(block, Some(BlockIndex(0)));
        assert_eq!(pool.free_list, Some(BlockIndex(1)));

        assert_eq!(pool.statistics().capacity_blocks, AVAILABLE_BLOCKS as u16);
        assert_eq!(pool.statistics().current_usage_blocks, 1);
        assert_eq!(pool.statistics().peak_usage_blocks, 1);
    }

    #[test]
    fn returns_none_if_there_is_no_block_left() {
        let mut arena = [PoolBlock::EMPTY; AVAILABLE_BLOCKS];
        let mut pool = Pool::new(&mut arena);

        for _ in 0..AVAILABLE_BLOCKS {
            assert!(pool.allocate_buffer().is_some());
        }

        assert_eq!(pool.allocate_buffer(), None);

        assert_eq!(pool.statistics().capacity_blocks, AVAILABLE_BLOCKS as u16);
        assert_eq!(
            pool.statistics().current_usage_blocks,
            AVAILABLE_BLOCKS as u16
        );
        assert_eq!(pool.statistics().peak_usage_blocks, AVAILABLE_BLOCKS as u16);
    }

    #[test]
    fn can_free_block() {
        let mut arena = [PoolBlock::EMPTY; AVAILABLE_BLOCKS];
        let mut pool = Pool::new(&mut arena);

        let block = pool.allocate_buffer().unwrap();
        pool.free(block);

        // The freed block returns to the head of the list.
        assert_eq!(pool.free_list, Some(BlockIndex(0)));
        assert_eq!(pool.statistics().current_usage_blocks, 0);
        assert_eq!(pool.statistics().peak_usage_blocks, 1);
    }

    #[test]
    fn usage_plus_free_list_is_conserved() {
        let mut arena = [PoolBlock::EMPTY; 8];
        let mut pool = Pool::new(&mut arena);
        let mut held = [None; 8];

        // Interleave allocations and frees; the books must balance at every
        // step and the peak must never decrease.
        let mut peak_seen = 0;
        for round in 0..4usize {
            for slot in 0..8usize {
                if (slot + round) % 3 == 0 {
                    if let Some(index) = held[slot].take() {
                        pool.free(index);
                    }
                } else if held[slot].is_none() {
                    held[slot] = pool.allocate_buffer();
                }

                let stats = pool.statistics();
                assert_eq!(
                    usize::from(stats.current_usage_blocks) + free_list_len(&pool),
                    usize::from(stats.capacity_blocks)
                );
                peak_seen = peak_seen.max(stats.current_usage_blocks);
                assert!(stats.peak_usage_blocks >= peak_seen);
            }
        }
    }

}
