// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Simulated-machine contract: devices, interrupts, PSR, MMU surface
//! OWNERS: @kernel-hal-team
//! PUBLIC API: Device, Psr, DeviceRequest, terminal word codecs, machine module
//! DEPENDS_ON: nothing above this layer
//! INVARIANTS: Word layouts for terminal control/status are fixed ABI

use bitflags::bitflags;

pub mod machine;

/// Number of interrupt-vector entries.
pub const NUM_INTS: usize = 6;

/// Device classes known to the machine; the discriminants index the
/// interrupt vector.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[repr(usize)]
pub enum Device {
    Clock = 0,
    Alarm = 1,
    Disk = 2,
    Term = 3,
    Mmu = 4,
    Syscall = 5,
}

impl Device {
    #[inline]
    pub const fn index(self) -> usize {
        self as usize
    }
}

/// Units per device class.
pub const CLOCK_UNITS: usize = 1;
pub const ALARM_UNITS: usize = 1;
pub const DISK_UNITS: usize = 2;
pub const TERM_UNITS: usize = 4;
/// Maximum unit count of any device class.
pub const MAX_UNITS: usize = 4;

/// Bytes per disk sector.
pub const DISK_SECTOR_SIZE: usize = 512;
/// Sectors per disk track.
pub const DISK_TRACK_SIZE: usize = 16;
/// Length of a clock tick in milliseconds.
pub const CLOCK_MS: u64 = 20;
/// Minimum process stack size accepted by the machine.
pub const MIN_STACK: usize = 8192;
/// Page size of the software MMU.
pub const MMU_PAGE_SIZE: usize = 4096;
/// Mapping tags supported by the MMU.
pub const MMU_MAX_TAGS: usize = 4;

bitflags! {
    /// Processor status register. On interrupt entry the machine copies the
    /// current fields into the previous fields and clears the current ones;
    /// returning from the handler restores them.
    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    pub struct Psr: u32 {
        const CUR_MODE = 1 << 0;
        const CUR_INT = 1 << 1;
        const PREV_MODE = 1 << 2;
        const PREV_INT = 1 << 3;
    }
}

/// Device status codes (also the terminal rx/tx sub-states).
pub const DEV_READY: i32 = 0;
pub const DEV_BUSY: i32 = 1;
pub const DEV_ERROR: i32 = 2;

/// Errors reported by `device_input` / `device_output`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DeviceError {
    /// Device type or unit does not exist.
    Invalid,
    /// Device is busy with a previous request.
    Busy,
    /// Device-level failure.
    Error,
}

/// A request for the disk device. Sector indices are track-relative; the
/// head stays on the seeked track until the next `Seek`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DiskRequest {
    Seek { track: usize },
    Read { sector: usize },
    Write { sector: usize, data: Box<[u8]> },
    Tracks,
}

/// Data handed back by a completed disk operation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DiskReply {
    Done,
    Sector(Box<[u8]>),
    Tracks(usize),
}

/// Terminal control word. Wire layout: bit 0 send-char, bit 1 recv-int
/// enable, bit 2 xmit-int enable, bits 8..=15 the outgoing character.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct TermControl {
    pub send_char: bool,
    pub recv_int: bool,
    pub xmit_int: bool,
    pub ch: u8,
}

impl TermControl {
    pub fn to_word(self) -> i32 {
        let mut word = 0i32;
        if self.send_char {
            word |= 1;
        }
        if self.recv_int {
            word |= 1 << 1;
        }
        if self.xmit_int {
            word |= 1 << 2;
        }
        word | ((self.ch as i32) << 8)
    }

    pub fn from_word(word: i32) -> Self {
        Self {
            send_char: word & 1 != 0,
            recv_int: word & (1 << 1) != 0,
            xmit_int: word & (1 << 2) != 0,
            ch: ((word >> 8) & 0xff) as u8,
        }
    }
}

/// A request for any simulated device.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DeviceRequest {
    Disk(DiskRequest),
    Term(TermControl),
}

/// Packs a terminal status word: rx state in bits 0..=1, tx state in
/// bits 2..=3, received character in bits 8..=15.
pub fn term_status_word(rx: i32, tx: i32, ch: u8) -> i32 {
    (rx & 0x3) | ((tx & 0x3) << 2) | ((ch as i32) << 8)
}

/// Received character, if any, from a terminal status word.
pub fn term_stat_char(status: i32) -> u8 {
    ((status >> 8) & 0xff) as u8
}

/// Transmit sub-status from a terminal status word.
pub fn term_stat_xmit(status: i32) -> i32 {
    (status >> 2) & 0x3
}

/// Receive sub-status from a terminal status word.
pub fn term_stat_recv(status: i32) -> i32 {
    status & 0x3
}

/// MMU fault causes.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(i32)]
pub enum MmuCause {
    None = 0,
    Fault = 1,
    Access = 2,
}

/// MMU page protections.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(i32)]
pub enum MmuProt {
    None = 0,
    Read = 1,
    Rw = 3,
}

/// Per-frame access bits maintained by the MMU on region accesses.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct MmuAccess {
    pub referenced: bool,
    pub dirty: bool,
}

/// Errors from MMU surface calls.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum MmuError {
    /// MMU not initialized, or already initialized.
    NotReady,
    /// Tag, page, or frame out of range.
    OutOfRange,
    /// Mapping budget exhausted or mapping already present.
    MapUnavailable,
    /// No mapping for the requested page.
    NoMapping,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn term_control_word_layout() {
        let ctrl = TermControl { send_char: true, recv_int: false, xmit_int: true, ch: b'A' };
        let word = ctrl.to_word();
        assert_eq!(word & 1, 1);
        assert_eq!(word & (1 << 1), 0);
        assert_eq!(word & (1 << 2), 1 << 2);
        assert_eq!((word >> 8) & 0xff, b'A' as i32);
        assert_eq!(TermControl::from_word(word), ctrl);
    }

    #[test]
    fn term_status_word_layout() {
        let status = term_status_word(DEV_BUSY, DEV_READY, b'x');
        assert_eq!(term_stat_recv(status), DEV_BUSY);
        assert_eq!(term_stat_xmit(status), DEV_READY);
        assert_eq!(term_stat_char(status), b'x');

        let status = term_status_word(DEV_READY, DEV_ERROR, 0);
        assert_eq!(term_stat_recv(status), DEV_READY);
        assert_eq!(term_stat_xmit(status), DEV_ERROR);
    }
}
