// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Device-driver shared state: request slots, queues, device boxes
//! OWNERS: @kernel-dev-team
//! PUBLIC API: DeviceOpError; sleep/disk_*/term_* live in the submodules
//! DEPENDS_ON: ipc mailboxes, proc table
//! INVARIANTS: Every process-table slot owns a private zero-slot mailbox;
//!             driver queues hold pids whose request slots are filled

use std::sync::Arc;

use crate::hal::Device;
use crate::ipc::IpcError;
use crate::kernel::Kernel;
use crate::types::{BoxId, Pid, MAX_PROC};

pub mod clock;
pub mod disk;
pub mod term;

/// Errors surfaced by the device-facing operations.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DeviceOpError {
    /// Argument out of range (unit, sector, length, negative time).
    BadInput,
    /// The caller was zapped while the request was in flight.
    Zapped,
    /// The device reported a failure; carries the status register value.
    Device(i32),
}

/// Disk operation kinds carried by a request slot.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DiskOp {
    Read,
    Write,
    Tracks,
}

/// A queued disk request, stored in the requester's process slot.
#[derive(Clone, Debug)]
pub(crate) struct DiskJob {
    pub op: DiskOp,
    pub track: usize,
    pub first: usize,
    pub sectors: usize,
    /// Write payload; `None` for reads and geometry queries.
    pub data: Option<Vec<u8>>,
}

/// Per-process device state, indexed by pid slot.
pub(crate) struct DevProcSlot {
    /// Private zero-slot mailbox for request rendezvous (also reused by the
    /// VM fault path).
    pub private_box: Option<BoxId>,
    /// Absolute wake time for a sleeping process.
    pub expiry_us: Option<u64>,
    pub disk_job: Option<DiskJob>,
    /// Read data produced by the disk driver.
    pub disk_data: Option<Vec<u8>>,
    /// Disk outcome: sector/track count on success.
    pub disk_result: Option<Result<i32, DeviceOpError>>,
    /// Byte count reported by the terminal transmitter.
    pub term_result: Option<usize>,
}

impl DevProcSlot {
    fn new() -> Self {
        Self {
            private_box: None,
            expiry_us: None,
            disk_job: None,
            disk_data: None,
            disk_result: None,
            term_result: None,
        }
    }
}

pub(crate) struct ClockInfo {
    pub mutex: Option<BoxId>,
    /// Sleepers in insertion order.
    pub sleepers: Vec<Pid>,
}

pub(crate) struct DiskInfo {
    pub wake_box: Option<BoxId>,
    pub mutex: Option<BoxId>,
    /// Request queue in arrival (age) order.
    pub queue: Vec<Pid>,
}

pub(crate) struct TermInfo {
    /// Interrupt listener -> receiver process (single characters).
    pub rx_box: Option<BoxId>,
    /// Receiver process -> term_read (buffered lines).
    pub rx_syscall_box: Option<BoxId>,
    /// Mutex guarding the transmit slot shared with the listener.
    pub tx_mutex: Option<BoxId>,
    /// term_write -> transmitter process (jobs).
    pub tx_syscall_box: Option<BoxId>,
    /// Transmit handshake slot.
    pub tx_valid: bool,
    pub tx_waiter: Option<Pid>,
}

/// Driver pids recorded for shutdown.
#[derive(Clone, Debug, Default)]
pub(crate) struct DriverPids {
    pub clock: Option<Pid>,
    pub disks: Vec<Pid>,
    /// Listener, receiver, transmitter per terminal unit.
    pub terms: Vec<(Pid, Pid, Pid)>,
}

/// All device-layer tables.
pub(crate) struct DevTables {
    pub proc: Vec<DevProcSlot>,
    pub clock: ClockInfo,
    pub disks: Vec<DiskInfo>,
    pub terms: Vec<TermInfo>,
    /// Zero-slot status boxes per `[device][unit]`.
    pub device_mbox: [[Option<BoxId>; crate::hal::MAX_UNITS]; 4],
    pub drivers: DriverPids,
    pub tick_count: u64,
    pub disk_units: usize,
    pub term_units: usize,
}

impl DevTables {
    pub fn new() -> Self {
        Self {
            proc: (0..MAX_PROC).map(|_| DevProcSlot::new()).collect(),
            clock: ClockInfo { mutex: None, sleepers: Vec::new() },
            disks: Vec::new(),
            terms: Vec::new(),
            device_mbox: [[None; crate::hal::MAX_UNITS]; 4],
            drivers: DriverPids::default(),
            tick_count: 0,
            disk_units: 0,
            term_units: 0,
        }
    }

    /// The status mailbox of `(device, unit)`, if the device exists.
    pub fn device_mbox(&self, device: Device, unit: usize) -> Option<BoxId> {
        let row = match device {
            Device::Clock => 0,
            Device::Alarm => 1,
            Device::Disk => 2,
            Device::Term => 3,
            _ => return None,
        };
        self.device_mbox[row].get(unit).copied().flatten()
    }

    pub fn set_device_mbox(&mut self, device: Device, unit: usize, id: BoxId) {
        let row = match device {
            Device::Clock => 0,
            Device::Alarm => 1,
            Device::Disk => 2,
            Device::Term => 3,
            _ => return,
        };
        self.device_mbox[row][unit] = Some(id);
    }

    /// Every created device mailbox (for the deadlock check).
    pub fn all_device_mboxes(&self) -> Vec<BoxId> {
        self.device_mbox
            .iter()
            .flat_map(|row| row.iter().copied().flatten())
            .collect()
    }
}

impl Kernel {
    /// Private rendezvous mailbox of `pid`'s slot.
    pub(crate) fn private_box(&self, pid: Pid) -> BoxId {
        let id = self.with_ints_disabled(|| self.dev.lock().proc[pid.slot()].private_box);
        match id {
            Some(id) => id,
            None => crate::fatal!(self.machine, "missing private mailbox for pid {}", pid.raw()),
        }
    }

    /// Acquires a one-slot mutex mailbox (send fills the single slot).
    pub(crate) fn mutex_acquire(self: &Arc<Self>, id: BoxId) -> Result<(), IpcError> {
        self.mbox_send(id, &0i32.to_le_bytes())
    }

    /// Releases a one-slot mutex mailbox (receive empties the slot).
    pub(crate) fn mutex_release(self: &Arc<Self>, id: BoxId) -> Result<(), IpcError> {
        let mut token = [0u8; 4];
        self.mbox_receive(id, &mut token).map(|_| ())
    }
}
