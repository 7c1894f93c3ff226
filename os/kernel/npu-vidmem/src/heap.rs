//! # Heap sub-allocator
//!
//! Carves one pre-acquired, physically contiguous region into many
//! independently freeable blocks.
//!
//! Nodes live in an arena and refer to each other by index. The node list
//! covers the whole heap without gaps and is kept in offset order:
//!
//! ```text
//!  offset 0                                                  size
//! +--------+-----------+----------------+--------+------------+
//! | Used A |  Free     |  Used B        | Used C |  Free      |
//! +--------+-----------+----------------+--------+------------+
//!              ^ idle[0]                              ^ idle[1]
//! ```
//!
//! The idle list holds the Free nodes only, also in offset order, so the
//! first-fit scan skips Used nodes entirely.
//!
//! ## Invariants
//! - Nodes are sorted by offset, non-overlapping and together span the heap.
//! - No two neighbouring nodes are both Free.
//! - `free_bytes` equals the sum of Free node sizes.
//! - A node id carries the generation of its arena slot; freeing a block whose
//!   slot has since been reused or merged away is reported as
//!   [`HeapError::StaleBlock`] instead of corrupting the list.

use crate::lock::TicketLock;
use alloc::string::String;
use alloc::vec::Vec;
use log::{debug, error, info, warn};
use npu_memory_addresses::{DeviceAddress, align_up};

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum HeapError {
    #[error("no free block is large enough")]
    Exhausted,
    #[error("request size is zero or overflows")]
    InvalidSize,
    #[error("alignment is not a power of two")]
    InvalidAlignment,
    #[error("block is not a live allocation of this heap")]
    StaleBlock,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum NodeStatus {
    Free,
    Used,
}

/// Arena reference to a node.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct NodeId {
    index: u32,
    generation: u32,
}

/// A live sub-allocation.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct HeapBlock {
    node: NodeId,
    offset: u64,
    size: u64,
}

impl HeapBlock {
    #[must_use]
    pub const fn offset(&self) -> u64 {
        self.offset
    }

    #[must_use]
    pub const fn size(&self) -> u64 {
        self.size
    }
}

/// Snapshot of one node, for diagnostics.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct HeapNodeInfo {
    pub offset: u64,
    pub size: u64,
    pub status: NodeStatus,
}

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct HeapStats {
    pub total: u64,
    pub free: u64,
    pub largest_free: u64,
    pub nodes: usize,
    pub free_nodes: usize,
    pub nodes_created: u64,
    pub nodes_deleted: u64,
    /// `100 - largest_free * 100 / free`, or 0 when nothing is free.
    pub fragmentation_percent: u8,
    /// Lock acquisitions that had to wait.
    pub contentions: u64,
}

#[derive(Debug)]
struct HeapNode {
    offset: u64,
    size: u64,
    status: NodeStatus,
    prev: Option<u32>,
    next: Option<u32>,
}

#[derive(Debug)]
struct Slot {
    generation: u32,
    node: Option<HeapNode>,
}

#[derive(Debug)]
struct HeapState {
    slots: Vec<Slot>,
    vacant: Vec<u32>,
    head: u32,
    /// Free node indices, sorted by offset.
    idle: Vec<u32>,
    free_bytes: u64,
    nodes_created: u64,
    nodes_deleted: u64,
}

pub struct HeapSubAllocator {
    name: String,
    base: DeviceAddress,
    size: u64,
    granularity: u64,
    state: TicketLock<HeapState>,
}

impl HeapSubAllocator {
    /// Create a heap over `[base, base + size)` handing out multiples of
    /// `granularity`.
    ///
    /// # Errors
    /// - [`HeapError::InvalidAlignment`] if `granularity` is not a power of two
    ///   or does not divide `base`.
    /// - [`HeapError::InvalidSize`] for an empty or overflowing heap, or a
    ///   size that is not a multiple of `granularity`.
    pub fn new(
        name: impl Into<String>,
        base: DeviceAddress,
        size: u64,
        granularity: u64,
    ) -> Result<Self, HeapError> {
        if !granularity.is_power_of_two() || base.as_u64() % granularity != 0 {
            return Err(HeapError::InvalidAlignment);
        }
        if size == 0 || size % granularity != 0 || base.end(size).is_none() {
            return Err(HeapError::InvalidSize);
        }

        let name = name.into();
        info!(
            "heap {name}: {size:#x} bytes at {base:?}, granularity {granularity:#x}"
        );
        let state = HeapState {
            slots: alloc::vec![Slot {
                generation: 0,
                node: Some(HeapNode {
                    offset: 0,
                    size,
                    status: NodeStatus::Free,
                    prev: None,
                    next: None,
                }),
            }],
            vacant: Vec::new(),
            head: 0,
            idle: alloc::vec![0],
            free_bytes: size,
            nodes_created: 1,
            nodes_deleted: 0,
        };
        Ok(Self {
            name,
            base,
            size,
            granularity,
            state: TicketLock::new(state),
        })
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub const fn base(&self) -> DeviceAddress {
        self.base
    }

    #[must_use]
    pub const fn size(&self) -> u64 {
        self.size
    }

    #[must_use]
    pub const fn granularity(&self) -> u64 {
        self.granularity
    }

    /// Device address of a block handed out by this heap.
    #[must_use]
    pub fn block_address(&self, block: &HeapBlock) -> DeviceAddress {
        self.base + block.offset
    }

    /// First-fit allocation of `size` bytes whose device address is a
    /// multiple of `align`.
    ///
    /// # Errors
    /// - [`HeapError::InvalidSize`] or [`HeapError::InvalidAlignment`] for a
    ///   malformed request.
    /// - [`HeapError::Exhausted`] when no free node can hold it.
    pub fn allocate(&self, size: u64, align: u64) -> Result<HeapBlock, HeapError> {
        if size == 0 {
            return Err(HeapError::InvalidSize);
        }
        if !align.is_power_of_two() {
            return Err(HeapError::InvalidAlignment);
        }
        let size = align_up(size, self.granularity)
            .ok_or(HeapError::InvalidSize)?;
        if size > self.size {
            return Err(HeapError::Exhausted);
        }
        let align = align.max(self.granularity);

        let block = self.state.with_lock(|s| s.allocate(self.base.as_u64(), size, align));
        match block {
            Ok(b) => debug!(
                "heap {}: allocated {:#x} bytes at offset {:#x}",
                self.name, b.size, b.offset
            ),
            Err(_) => debug!("heap {}: no room for {size:#x} bytes", self.name),
        }
        block
    }

    /// Return a block; merges it with Free neighbours.
    ///
    /// # Errors
    /// [`HeapError::StaleBlock`] if the block was already freed or belongs to
    /// another heap.
    pub fn free(&self, block: &HeapBlock) -> Result<(), HeapError> {
        let res = self.state.with_lock(|s| s.free(block));
        match res {
            Ok(()) => debug!(
                "heap {}: freed {:#x} bytes at offset {:#x}",
                self.name, block.size, block.offset
            ),
            Err(e) => error!(
                "heap {}: rejecting free of offset {:#x}: {e}",
                self.name, block.offset
            ),
        }
        res
    }

    #[must_use]
    pub fn stats(&self) -> HeapStats {
        let mut stats = self.state.with_lock(|s| {
            let mut stats = HeapStats {
                total: self.size,
                free: s.free_bytes,
                nodes_created: s.nodes_created,
                nodes_deleted: s.nodes_deleted,
                free_nodes: s.idle.len(),
                ..HeapStats::default()
            };
            for info in s.walk() {
                stats.nodes += 1;
                if info.status == NodeStatus::Free {
                    stats.largest_free = stats.largest_free.max(info.size);
                }
            }
            stats
        });
        if stats.free > 0 {
            let pct = 100 - (u128::from(stats.largest_free) * 100 / u128::from(stats.free));
            stats.fragmentation_percent = u8::try_from(pct).unwrap_or(100);
        }
        stats.contentions = self.state.contentions();
        stats
    }

    /// All nodes in offset order.
    #[must_use]
    pub fn nodes(&self) -> Vec<HeapNodeInfo> {
        self.state.with_lock(|s| s.walk().collect())
    }

    /// Verify the structural invariants listed in the module docs.
    ///
    /// # Errors
    /// A description of the first violated invariant.
    pub fn check_invariants(&self) -> Result<(), &'static str> {
        self.state.with_lock(|s| s.check(self.size))
    }

    /// Log and count allocations still outstanding. Called at teardown.
    #[must_use]
    pub fn report_leaks(&self) -> usize {
        let (used, created, deleted) = self.state.with_lock(|s| {
            let used = s.walk().filter(|n| n.status == NodeStatus::Used).count();
            (used, s.nodes_created, s.nodes_deleted)
        });
        let live = created.saturating_sub(deleted);
        if used > 0 || live != 1 {
            warn!(
                "heap {}: {used} block(s) leaked ({created} nodes created, {deleted} deleted)",
                self.name
            );
        }
        used
    }
}

impl HeapState {
    fn node(&self, index: u32) -> &HeapNode {
        // Indices reachable from the list always name occupied slots.
        match &self.slots[index as usize].node {
            Some(node) => node,
            None => unreachable!("dangling heap node index {index}"),
        }
    }

    fn node_mut(&mut self, index: u32) -> &mut HeapNode {
        match &mut self.slots[index as usize].node {
            Some(node) => node,
            None => unreachable!("dangling heap node index {index}"),
        }
    }

    fn insert_node(&mut self, node: HeapNode) -> u32 {
        self.nodes_created += 1;
        if let Some(index) = self.vacant.pop() {
            self.slots[index as usize].node = Some(node);
            index
        } else {
            let index = u32::try_from(self.slots.len()).unwrap_or(u32::MAX);
            self.slots.push(Slot {
                generation: 0,
                node: Some(node),
            });
            index
        }
    }

    fn remove_node(&mut self, index: u32) {
        let slot = &mut self.slots[index as usize];
        slot.node = None;
        slot.generation = slot.generation.wrapping_add(1);
        self.vacant.push(index);
        self.nodes_deleted += 1;
    }

    fn idle_position(&self, offset: u64) -> Result<usize, usize> {
        self.idle
            .binary_search_by_key(&offset, |&i| self.node(i).offset)
    }

    fn allocate(&mut self, base: u64, size: u64, align: u64) -> Result<HeapBlock, HeapError> {
        let mut found = None;
        for (pos, &index) in self.idle.iter().enumerate() {
            let node = self.node(index);
            let start = base + node.offset;
            let Some(aligned) = align_up(start, align) else {
                continue;
            };
            let pad = aligned - start;
            if pad.checked_add(size).is_some_and(|need| need <= node.size) {
                found = Some((pos, index, pad));
                break;
            }
        }
        let (pos, index, pad) = found.ok_or(HeapError::Exhausted)?;

        let (offset, node_size, prev, next) = {
            let n = self.node(index);
            (n.offset, n.size, n.prev, n.next)
        };

        // Front padding stays Free in front of the block.
        let mut idle_pos = pos;
        let mut prev_link = prev;
        if pad > 0 {
            let front = self.insert_node(HeapNode {
                offset,
                size: pad,
                status: NodeStatus::Free,
                prev,
                next: Some(index),
            });
            match prev {
                Some(p) => self.node_mut(p).next = Some(front),
                None => self.head = front,
            }
            self.idle.insert(idle_pos, front);
            idle_pos += 1;
            prev_link = Some(front);
        }

        let tail = node_size - pad - size;
        let mut next_link = next;
        if tail > 0 {
            let rest = self.insert_node(HeapNode {
                offset: offset + pad + size,
                size: tail,
                status: NodeStatus::Free,
                prev: Some(index),
                next,
            });
            if let Some(n) = next {
                self.node_mut(n).prev = Some(rest);
            }
            self.idle[idle_pos] = rest;
            next_link = Some(rest);
        } else {
            self.idle.remove(idle_pos);
        }

        // Every hand-out gets a fresh generation so ids of earlier blocks at
        // the same slot go stale.
        let slot = &mut self.slots[index as usize];
        slot.generation = slot.generation.wrapping_add(1);
        let generation = slot.generation;
        let node = self.node_mut(index);
        node.offset = offset + pad;
        node.size = size;
        node.status = NodeStatus::Used;
        node.prev = prev_link;
        node.next = next_link;
        self.free_bytes -= size;

        Ok(HeapBlock {
            node: NodeId { index, generation },
            offset: offset + pad,
            size,
        })
    }

    fn free(&mut self, block: &HeapBlock) -> Result<(), HeapError> {
        let index = block.node.index;
        let valid = self.slots.get(index as usize).is_some_and(|slot| {
            slot.generation == block.node.generation
                && slot.node.as_ref().is_some_and(|n| {
                    n.status == NodeStatus::Used && n.offset == block.offset && n.size == block.size
                })
        });
        if !valid {
            return Err(HeapError::StaleBlock);
        }

        let (prev, next) = {
            let n = self.node_mut(index);
            n.status = NodeStatus::Free;
            (n.prev, n.next)
        };
        self.free_bytes += block.size;

        if let Some(n) = next
            && self.node(n).status == NodeStatus::Free
        {
            let (size, after) = (self.node(n).size, self.node(n).next);
            if let Ok(p) = self.idle_position(self.node(n).offset) {
                self.idle.remove(p);
            }
            let node = self.node_mut(index);
            node.size += size;
            node.next = after;
            if let Some(a) = after {
                self.node_mut(a).prev = Some(index);
            }
            self.remove_node(n);
        }

        if let Some(p) = prev
            && self.node(p).status == NodeStatus::Free
        {
            let (size, after) = (self.node(index).size, self.node(index).next);
            let prev_node = self.node_mut(p);
            prev_node.size += size;
            prev_node.next = after;
            if let Some(a) = after {
                self.node_mut(a).prev = Some(p);
            }
            self.remove_node(index);
        } else {
            let offset = self.node(index).offset;
            if let Err(p) = self.idle_position(offset) {
                self.idle.insert(p, index);
            }
        }
        Ok(())
    }

    fn walk(&self) -> impl Iterator<Item = HeapNodeInfo> + '_ {
        let mut cursor = Some(self.head);
        core::iter::from_fn(move || {
            let index = cursor?;
            let node = self.node(index);
            cursor = node.next;
            Some(HeapNodeInfo {
                offset: node.offset,
                size: node.size,
                status: node.status,
            })
        })
    }

    fn check(&self, total: u64) -> Result<(), &'static str> {
        let mut expected_offset = 0;
        let mut free = 0;
        let mut prev_status = None;
        let mut prev_index: Option<u32> = None;
        let mut free_nodes = Vec::new();
        let mut cursor = Some(self.head);
        while let Some(index) = cursor {
            let node = self.node(index);
            if node.prev != prev_index {
                return Err("broken back link");
            }
            if node.offset != expected_offset {
                return Err("nodes are not contiguous");
            }
            if node.size == 0 {
                return Err("zero-sized node");
            }
            if node.status == NodeStatus::Free {
                if prev_status == Some(NodeStatus::Free) {
                    return Err("adjacent free nodes were not coalesced");
                }
                free += node.size;
                free_nodes.push(index);
            }
            expected_offset += node.size;
            prev_status = Some(node.status);
            prev_index = Some(index);
            cursor = node.next;
        }
        if expected_offset != total {
            return Err("nodes do not span the heap");
        }
        if free != self.free_bytes {
            return Err("free byte counter is off");
        }
        if free_nodes != self.idle {
            return Err("idle list does not match free nodes");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Barrier};
    use std::thread;

    const KIB: u64 = 1024;
    const MIB: u64 = 1024 * KIB;

    fn heap() -> HeapSubAllocator {
        let base = DeviceAddress::new(0x4000_0000);
        HeapSubAllocator::new("test", base, MIB, 4 * KIB).unwrap()
    }

    #[test]
    fn sequential_free_leaves_one_spanning_node() {
        for (a, b) in [(4 * KIB, 8 * KIB), (512 * KIB, 512 * KIB), (1, MIB - 4 * KIB)] {
            let h = heap();
            let x = h.allocate(a, 1).unwrap();
            let y = h.allocate(b, 1).unwrap();
            h.check_invariants().unwrap();
            h.free(&x).unwrap();
            h.free(&y).unwrap();
            h.check_invariants().unwrap();
            assert_eq!(
                h.nodes(),
                vec![HeapNodeInfo {
                    offset: 0,
                    size: MIB,
                    status: NodeStatus::Free
                }]
            );
            assert_eq!(h.report_leaks(), 0);
        }
    }

    #[test]
    fn adjacent_frees_merge_between_used_blocks() {
        let h = heap();
        let blocks: Vec<_> = (0..4).map(|_| h.allocate(128 * KIB, 1).unwrap()).collect();
        h.free(&blocks[1]).unwrap();
        h.free(&blocks[2]).unwrap();
        h.check_invariants().unwrap();

        let nodes = h.nodes();
        assert_eq!(nodes.len(), 4);
        assert_eq!(nodes[0].status, NodeStatus::Used);
        assert_eq!(
            nodes[1],
            HeapNodeInfo {
                offset: 128 * KIB,
                size: 256 * KIB,
                status: NodeStatus::Free
            }
        );
        assert_eq!(nodes[2].status, NodeStatus::Used);
        assert_eq!(nodes[3].status, NodeStatus::Free);
        assert_eq!(nodes[3].size, 512 * KIB);
    }

    #[test]
    fn first_fit_reuses_the_lowest_hole() {
        let h = heap();
        let a = h.allocate(64 * KIB, 1).unwrap();
        let _b = h.allocate(64 * KIB, 1).unwrap();
        h.free(&a).unwrap();
        let c = h.allocate(16 * KIB, 1).unwrap();
        assert_eq!(c.offset(), 0);
        h.check_invariants().unwrap();
    }

    #[test]
    fn alignment_applies_to_device_address() {
        let h = HeapSubAllocator::new("t", DeviceAddress::new(0x1000), MIB, 4 * KIB)
            .unwrap();
        let a = h.allocate(4 * KIB, 1).unwrap();
        let b = h.allocate(4 * KIB, 64 * KIB).unwrap();
        assert_eq!(a.offset(), 0);
        assert_eq!(h.block_address(&b).as_u64() % (64 * KIB), 0);
        // The padding in front of `b` is a Free node.
        let nodes = h.nodes();
        assert_eq!(nodes[1].status, NodeStatus::Free);
        assert_eq!(nodes[1].offset, 4 * KIB);
        h.check_invariants().unwrap();
        h.free(&b).unwrap();
        h.free(&a).unwrap();
        assert_eq!(h.nodes().len(), 1);
    }

    #[test]
    fn rounds_to_granularity_and_counts_free_bytes() {
        let h = heap();
        let a = h.allocate(100, 1).unwrap();
        assert_eq!(a.size(), 4 * KIB);
        assert_eq!(h.stats().free, MIB - 4 * KIB);
        h.free(&a).unwrap();
        assert_eq!(h.stats().free, MIB);
    }

    #[test]
    fn exhaustion_and_bad_arguments() {
        let h = heap();
        assert_eq!(h.allocate(0, 1), Err(HeapError::InvalidSize));
        assert_eq!(h.allocate(4 * KIB, 3), Err(HeapError::InvalidAlignment));
        assert_eq!(h.allocate(2 * MIB, 1), Err(HeapError::Exhausted));
        assert_eq!(h.allocate(u64::MAX, 1), Err(HeapError::InvalidSize));
        let all = h.allocate(MIB, 1).unwrap();
        assert_eq!(h.allocate(4 * KIB, 1), Err(HeapError::Exhausted));
        h.free(&all).unwrap();
    }

    #[test]
    fn double_free_is_detected() {
        let h = heap();
        let a = h.allocate(8 * KIB, 1).unwrap();
        h.free(&a).unwrap();
        assert_eq!(h.free(&a), Err(HeapError::StaleBlock));
        // The slot gets reused; the old id must still be rejected.
        let b = h.allocate(8 * KIB, 1).unwrap();
        assert_eq!(h.free(&a), Err(HeapError::StaleBlock));
        h.free(&b).unwrap();
        h.check_invariants().unwrap();
    }

    #[test]
    fn stats_report_fragmentation() {
        let h = heap();
        let blocks: Vec<_> = (0..4).map(|_| h.allocate(256 * KIB, 1).unwrap()).collect();
        h.free(&blocks[0]).unwrap();
        h.free(&blocks[2]).unwrap();
        let s = h.stats();
        assert_eq!(s.free, 512 * KIB);
        assert_eq!(s.largest_free, 256 * KIB);
        assert_eq!(s.free_nodes, 2);
        assert_eq!(s.nodes, 4);
        assert_eq!(s.fragmentation_percent, 50);
        assert_eq!(h.report_leaks(), 2);
    }

    #[test]
    fn rejects_bad_geometry() {
        let base = DeviceAddress::new(0x1000);
        assert!(HeapSubAllocator::new("x", base, 0, 4 * KIB).is_err());
        assert!(HeapSubAllocator::new("x", base, MIB, 3).is_err());
        assert!(HeapSubAllocator::new("x", base, MIB, 64 * KIB).is_err());
        assert!(HeapSubAllocator::new("x", base, MIB + 1, 4 * KIB).is_err());
    }

    #[test]
    fn concurrent_alloc_free_keeps_invariants() {
        let threads = 8;
        let rounds = 200;
        let h = Arc::new(heap());
        let start = Arc::new(Barrier::new(threads));

        let handles: Vec<_> = (0..threads)
            .map(|t| {
                let h = Arc::clone(&h);
                let start = Arc::clone(&start);
                thread::spawn(move || {
                    start.wait();
                    let mut held = Vec::new();
                    for i in 0..rounds {
                        let size = ((t + i) % 4 + 1) as u64 * 4 * KIB;
                        if let Ok(b) = h.allocate(size, 1) {
                            held.push(b);
                        }
                        if i % 3 == 0
                            && let Some(b) = held.pop()
                        {
                            h.free(&b).unwrap();
                        }
                    }
                    for b in held {
                        h.free(&b).unwrap();
                    }
                })
            })
            .collect();
        for t in handles {
            t.join().unwrap();
        }

        h.check_invariants().unwrap();
        assert_eq!(h.nodes().len(), 1);
        assert_eq!(h.stats().free, MIB);
    }
}
