// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Physical frame pool: free list plus the clock-hand state
//! OWNERS: @kernel-vm-team
//! PUBLIC API: FramePool (pop_free/push_free/clock access)
//! DEPENDS_ON: nothing outside vm
//! INVARIANTS: Free frames form an acyclic list reachable from free_head;
//!             a non-free frame carries the reverse mapping of exactly the
//!             PTE that owns it

/// One physical frame record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct Frame {
    pub free: bool,
    pub next_free: Option<usize>,
    /// Owning PTE as (process slot, virtual page).
    pub reverse: Option<(usize, usize)>,
}

/// The frame array, doubling as a singly-linked free list.
pub(crate) struct FramePool {
    pub frames: Vec<Frame>,
    pub free_head: Option<usize>,
    pub clock_hand: usize,
}

impl FramePool {
    pub fn new(count: usize) -> Self {
        let frames = (0..count)
            .map(|i| Frame {
                free: true,
                next_free: if i + 1 < count { Some(i + 1) } else { None },
                reverse: None,
            })
            .collect();
        Self { frames, free_head: if count > 0 { Some(0) } else { None }, clock_hand: 0 }
    }

    /// Pops the free-list head, marking it in use.
    pub fn pop_free(&mut self) -> Option<usize> {
        let head = self.free_head?;
        self.free_head = self.frames[head].next_free;
        let frame = &mut self.frames[head];
        frame.next_free = None;
        frame.free = false;
        Some(head)
    }

    /// Returns a frame to the front of the free list and severs its
    /// reverse mapping.
    pub fn push_free(&mut self, index: usize) {
        let frame = &mut self.frames[index];
        debug_assert!(!frame.free, "double free of frame {index}");
        frame.free = true;
        frame.reverse = None;
        frame.next_free = self.free_head;
        self.free_head = Some(index);
    }

    /// Advances the clock hand one position, wrapping.
    pub fn advance_hand(&mut self) {
        self.clock_hand = (self.clock_hand + 1) % self.frames.len();
    }

    pub fn free_count(&self) -> usize {
        let mut count = 0;
        let mut at = self.free_head;
        while let Some(index) = at {
            count += 1;
            at = self.frames[index].next_free;
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_pool_links_every_frame() {
        let pool = FramePool::new(4);
        assert_eq!(pool.free_count(), 4);
        assert_eq!(pool.free_head, Some(0));
    }

    #[test]
    fn pop_then_push_round_trips() {
        let mut pool = FramePool::new(3);
        let a = pool.pop_free().unwrap();
        let b = pool.pop_free().unwrap();
        assert_ne!(a, b);
        assert_eq!(pool.free_count(), 1);
        pool.push_free(a);
        assert_eq!(pool.free_head, Some(a));
        assert_eq!(pool.free_count(), 2);
        assert!(pool.frames[a].reverse.is_none());
    }

    #[test]
    fn exhausted_pool_yields_none() {
        let mut pool = FramePool::new(2);
        assert!(pool.pop_free().is_some());
        assert!(pool.pop_free().is_some());
        assert_eq!(pool.pop_free(), None);
    }

    #[test]
    fn free_list_has_no_cycle_after_mixed_traffic() {
        let mut pool = FramePool::new(5);
        let mut held = Vec::new();
        for _ in 0..5 {
            held.push(pool.pop_free().unwrap());
        }
        for &f in held.iter().rev() {
            pool.push_free(f);
        }
        // free_count walks the list; a cycle would hang, a break would
        // miscount.
        assert_eq!(pool.free_count(), 5);
    }
}
