// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Newtypes and compile-time tunables shared across the AXON kernel
//! OWNERS: @kernel-team
//! PUBLIC API: Pid, Priority, BoxId, configuration constants
//! DEPENDS_ON: nothing below hal
//! INVARIANTS: Pid 0 never exists; sentinel pid is 1; priorities stay in 1..=6

use static_assertions::const_assert;

/// Size of the process table.
pub const MAX_PROC: usize = 50;
/// Size of the mailbox table.
pub const MAX_MBOX: usize = 2000;
/// Size of the global message-slot pool shared by all mailboxes.
pub const MAX_SLOTS: usize = 2500;
/// Largest message a mailbox slot can carry, in bytes.
pub const MAX_MESSAGE: usize = 150;
/// Longest buffered terminal line, in bytes.
pub const MAX_LINE: usize = 80;
/// Terminal lines buffered between the receiver process and `term_read`.
pub const LINES_TO_BUFFER: usize = 10;
/// Upper bound on pager daemons.
pub const MAX_PAGERS: usize = 4;
/// Entries in the syscall vector.
pub const MAX_SYSCALLS: usize = 50;
/// Longest process name accepted by `fork`.
pub const MAX_NAME: usize = 50;
/// Longest argument string accepted by `fork`.
pub const MAX_ARG: usize = 100;

/// Block reasons below this value are reserved for the kernel.
pub const MIN_BLOCK_CODE: i32 = 10;
/// Block reason: blocked waiting for a zap target to quit.
pub const BLOCKED_ZAPPING: i32 = 20;
/// Block reason: blocked in `join` waiting for a child to quit.
pub const BLOCKED_JOIN: i32 = 21;
/// Block reason: blocked as a mailbox sender.
pub const BLOCKED_SEND: i32 = 51;
/// Block reason: blocked as a mailbox receiver.
pub const BLOCKED_RECV: i32 = 52;

// A fault record must fit a mailbox message (three encoded words).
const_assert!(MAX_MESSAGE >= 12);
// Block reason codes must stay in the unreserved range.
const_assert!(BLOCKED_SEND > MIN_BLOCK_CODE as i32);
const_assert!(BLOCKED_RECV > MIN_BLOCK_CODE as i32);

/// Process identifier.
///
/// **Ownership**: only the process table mints PIDs. The raw value is
/// 15-bit; 0 marks an empty table slot in dumps and is never a live pid.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Pid(u16);

impl Pid {
    /// Largest raw pid value (15-bit pid space).
    pub const MAX_RAW: u16 = 0x7fff;
    /// The sentinel's reserved pid.
    pub const SENTINEL: Self = Self(1);

    /// Creates a pid from a raw value (kernel-internal only).
    #[inline]
    pub const fn from_raw(raw: u16) -> Self {
        Self(raw)
    }

    /// Returns the raw pid value.
    #[inline]
    pub const fn raw(self) -> u16 {
        self.0
    }

    /// Maps the pid onto its process-table slot.
    #[inline]
    pub const fn slot(self) -> usize {
        self.0 as usize % MAX_PROC
    }
}

/// Scheduling priority band. 1 is highest, 5 is the lowest user band and
/// 6 is reserved for the sentinel.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Priority(u8);

impl Priority {
    pub const HIGHEST: Self = Self(1);
    pub const LOWEST: Self = Self(5);
    pub const SENTINEL: Self = Self(6);
    /// Number of priority bands (user bands plus the sentinel band).
    pub const COUNT: usize = 6;

    /// Validates a raw priority for `fork` (sentinel band excluded).
    #[inline]
    pub fn user(raw: i32) -> Option<Self> {
        if raw >= Self::HIGHEST.0 as i32 && raw <= Self::LOWEST.0 as i32 {
            Some(Self(raw as u8))
        } else {
            None
        }
    }

    /// Returns the raw band value.
    #[inline]
    pub const fn raw(self) -> u8 {
        self.0
    }

    /// Index of this band in the ready/wait queue arrays.
    #[inline]
    pub const fn index(self) -> usize {
        self.0 as usize - 1
    }
}

/// Mailbox identifier. Ids are non-negative and unique across the table
/// for the lifetime of a run; released ids are never reissued while any
/// box with a colliding id remains.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BoxId(i32);

impl BoxId {
    /// Creates a mailbox id from a raw value (kernel-internal only).
    #[inline]
    pub const fn from_raw(raw: i32) -> Self {
        Self(raw)
    }

    /// Returns the raw id value.
    #[inline]
    pub const fn raw(self) -> i32 {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pid_slot_wraps_table() {
        assert_eq!(Pid::from_raw(3).slot(), 3);
        assert_eq!(Pid::from_raw(MAX_PROC as u16 + 3).slot(), 3);
    }

    #[test]
    fn priority_user_range() {
        assert_eq!(Priority::user(0), None);
        assert_eq!(Priority::user(1), Some(Priority::HIGHEST));
        assert_eq!(Priority::user(5), Some(Priority::LOWEST));
        assert_eq!(Priority::user(6), None);
    }

    #[test]
    fn priority_band_indices_cover_queue_array() {
        assert_eq!(Priority::HIGHEST.index(), 0);
        assert_eq!(Priority::SENTINEL.index(), Priority::COUNT - 1);
    }
}
