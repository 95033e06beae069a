// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Priority-banded FIFO queues for the ready and wait lists
//! OWNERS: @kernel-sched-team
//! PUBLIC API: PriorityQueues (push/pop_highest/remove/contains)
//! DEPENDS_ON: types::{Pid, Priority}
//! INVARIANTS: A pid appears at most once per queue set; FIFO within a band

use std::collections::VecDeque;

use crate::types::{Pid, Priority};

/// An array of FIFO queues indexed by priority band. Used both for the
/// ready list and the wait list.
#[derive(Debug, Default)]
pub struct PriorityQueues {
    bands: [VecDeque<Pid>; Priority::COUNT],
}

impl PriorityQueues {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `pid` to the tail of its priority band.
    pub fn push(&mut self, pid: Pid, priority: Priority) {
        debug_assert!(!self.contains(pid));
        self.bands[priority.index()].push_back(pid);
    }

    /// Pops the head of the highest non-empty band.
    pub fn pop_highest(&mut self) -> Option<Pid> {
        self.bands.iter_mut().find_map(|band| band.pop_front())
    }

    /// Head of the highest non-empty band without removing it.
    pub fn peek_highest(&self) -> Option<Pid> {
        self.bands.iter().find_map(|band| band.front().copied())
    }

    /// Removes `pid` from whatever band holds it. Returns whether it was
    /// queued at all.
    pub fn remove(&mut self, pid: Pid) -> bool {
        for band in &mut self.bands {
            if let Some(at) = band.iter().position(|&p| p == pid) {
                band.remove(at);
                return true;
            }
        }
        false
    }

    pub fn contains(&self, pid: Pid) -> bool {
        self.bands.iter().any(|band| band.iter().any(|&p| p == pid))
    }

    pub fn is_empty(&self) -> bool {
        self.bands.iter().all(VecDeque::is_empty)
    }

    /// Number of queued pids across all bands.
    pub fn len(&self) -> usize {
        self.bands.iter().map(VecDeque::len).sum()
    }

    /// All queued pids, highest band first, FIFO within a band.
    pub fn iter(&self) -> impl Iterator<Item = Pid> + '_ {
        self.bands.iter().flat_map(|band| band.iter().copied())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pid(raw: u16) -> Pid {
        Pid::from_raw(raw)
    }

    fn prio(raw: i32) -> Priority {
        match Priority::user(raw) {
            Some(p) => p,
            None => Priority::SENTINEL,
        }
    }

    #[test]
    fn pops_highest_band_first() {
        let mut q = PriorityQueues::new();
        q.push(pid(10), prio(3));
        q.push(pid(11), prio(1));
        q.push(pid(12), prio(5));
        assert_eq!(q.pop_highest(), Some(pid(11)));
        assert_eq!(q.pop_highest(), Some(pid(10)));
        assert_eq!(q.pop_highest(), Some(pid(12)));
        assert_eq!(q.pop_highest(), None);
    }

    #[test]
    fn fifo_within_a_band() {
        let mut q = PriorityQueues::new();
        q.push(pid(2), prio(3));
        q.push(pid(3), prio(3));
        q.push(pid(4), prio(3));
        assert_eq!(q.pop_highest(), Some(pid(2)));
        q.push(pid(2), prio(3));
        assert_eq!(q.pop_highest(), Some(pid(3)));
        assert_eq!(q.pop_highest(), Some(pid(4)));
        assert_eq!(q.pop_highest(), Some(pid(2)));
    }

    #[test]
    fn remove_targets_one_pid() {
        let mut q = PriorityQueues::new();
        q.push(pid(2), prio(2));
        q.push(pid(3), prio(2));
        assert!(q.remove(pid(2)));
        assert!(!q.remove(pid(2)));
        assert!(q.contains(pid(3)));
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn sentinel_band_is_last_resort() {
        let mut q = PriorityQueues::new();
        q.push(pid(1), Priority::SENTINEL);
        q.push(pid(7), prio(5));
        assert_eq!(q.pop_highest(), Some(pid(7)));
        assert_eq!(q.pop_highest(), Some(pid(1)));
    }
}
