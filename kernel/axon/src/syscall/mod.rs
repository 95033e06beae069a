// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Syscall numbering, argument record, and the handler vector
//! OWNERS: @kernel-team
//! PUBLIC API: Syscall, SysArgs, Kernel::{syscall, install_syscall}
//! DEPENDS_ON: ipc, dev, vm operations
//! INVARIANTS: The numbering 1..=24 is a closed ABI; unset entries run
//!             nullsys, which is fatal

use std::sync::Arc;

use crate::kernel::Kernel;
use crate::types::{BoxId, MAX_SYSCALLS};

/// The closed syscall enumeration. Numbers are ABI.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(i32)]
pub enum Syscall {
    Spawn = 1,
    Wait = 2,
    Terminate = 3,
    SemCreate = 4,
    SemP = 5,
    SemV = 6,
    SemFree = 7,
    GetTimeOfDay = 8,
    CpuTime = 9,
    GetPid = 10,
    Sleep = 11,
    DiskRead = 12,
    DiskWrite = 13,
    DiskSize = 14,
    TermRead = 15,
    TermWrite = 16,
    MboxCreate = 17,
    MboxRelease = 18,
    MboxSend = 19,
    MboxReceive = 20,
    MboxCondSend = 21,
    MboxCondReceive = 22,
    VmInit = 23,
    VmCleanup = 24,
}

impl Syscall {
    pub fn from_number(number: i32) -> Option<Self> {
        Some(match number {
            1 => Self::Spawn,
            2 => Self::Wait,
            3 => Self::Terminate,
            4 => Self::SemCreate,
            5 => Self::SemP,
            6 => Self::SemV,
            7 => Self::SemFree,
            8 => Self::GetTimeOfDay,
            9 => Self::CpuTime,
            10 => Self::GetPid,
            11 => Self::Sleep,
            12 => Self::DiskRead,
            13 => Self::DiskWrite,
            14 => Self::DiskSize,
            15 => Self::TermRead,
            16 => Self::TermWrite,
            17 => Self::MboxCreate,
            18 => Self::MboxRelease,
            19 => Self::MboxSend,
            20 => Self::MboxReceive,
            21 => Self::MboxCondSend,
            22 => Self::MboxCondReceive,
            23 => Self::VmInit,
            24 => Self::VmCleanup,
            _ => return None,
        })
    }

    #[inline]
    pub const fn number(self) -> i32 {
        self as i32
    }
}

/// Syscall argument record: the opcode, five word-sized in/out arguments,
/// and an optional byte payload for the calls that carry data.
#[derive(Clone, Debug, Default)]
pub struct SysArgs {
    pub number: i32,
    pub arg: [i64; 5],
    pub data: Option<Vec<u8>>,
}

impl SysArgs {
    pub fn new(number: i32) -> Self {
        Self { number, arg: [0; 5], data: None }
    }
}

/// An installed syscall handler.
pub type SysHandler = Arc<dyn Fn(&Arc<Kernel>, &mut SysArgs) + Send + Sync>;

/// The handler vector; unset entries fall through to `nullsys`.
pub struct SysVec {
    handlers: Vec<Option<SysHandler>>,
}

impl SysVec {
    pub fn new() -> Self {
        Self { handlers: (0..MAX_SYSCALLS).map(|_| None).collect() }
    }

    pub fn set(&mut self, call: Syscall, handler: SysHandler) {
        self.handlers[call.number() as usize] = Some(handler);
    }

    pub fn get(&self, number: i32) -> Option<SysHandler> {
        if number < 0 || number as usize >= MAX_SYSCALLS {
            return None;
        }
        self.handlers[number as usize].clone()
    }
}

impl Kernel {
    /// Dispatches one syscall through the vector. Out-of-range numbers and
    /// unset entries are fatal, as in `nullsys`.
    pub fn syscall(self: &Arc<Self>, args: &mut SysArgs) {
        self.check_kernel_mode("syscall");
        if args.number < 0 || args.number as usize >= MAX_SYSCALLS {
            crate::fatal!(self.machine, "syscall number {} out of range", args.number);
        }
        let handler = self.with_ints_disabled(|| self.sys.lock().get(args.number));
        match handler {
            Some(handler) => handler(self, args),
            None => crate::fatal!(self.machine, "invalid syscall {}", args.number),
        }
    }

    /// Installs a handler; the phase-3 adapter layer uses this for the
    /// spawn/wait/terminate/semaphore entries it owns.
    pub fn install_syscall(&self, call: Syscall, handler: SysHandler) {
        self.with_ints_disabled(|| self.sys.lock().set(call, handler));
    }

    /// Installs the handlers for the calls the kernel itself implements.
    pub(crate) fn install_kernel_syscalls(self: &Arc<Self>) {
        self.install_syscall(Syscall::GetTimeOfDay, Arc::new(|k, args| {
            args.arg[0] = k.sys_clock() as i64;
        }));
        self.install_syscall(Syscall::CpuTime, Arc::new(|k, args| {
            args.arg[0] = k.readtime() as i64;
        }));
        self.install_syscall(Syscall::GetPid, Arc::new(|k, args| {
            args.arg[0] = k.getpid().raw() as i64;
        }));
        self.install_syscall(Syscall::Sleep, Arc::new(|k, args| {
            args.arg[3] = match k.sleep(args.arg[0] as i32) {
                Ok(()) => 0,
                Err(_) => -1,
            };
        }));
        self.install_syscall(Syscall::DiskRead, Arc::new(|k, args| {
            let unit = args.arg[4] as usize;
            let track = args.arg[2] as usize;
            let first = args.arg[3] as usize;
            let sectors = args.arg[1] as usize;
            let mut buf = vec![0u8; sectors * crate::hal::DISK_SECTOR_SIZE];
            match k.disk_read(unit, track, first, sectors, &mut buf) {
                Ok(()) => {
                    args.data = Some(buf);
                    args.arg[0] = 0;
                    args.arg[3] = 0;
                }
                Err(e) => report_device_error(args, e),
            }
        }));
        self.install_syscall(Syscall::DiskWrite, Arc::new(|k, args| {
            let unit = args.arg[4] as usize;
            let track = args.arg[2] as usize;
            let first = args.arg[3] as usize;
            let sectors = args.arg[1] as usize;
            let data = args.data.take().unwrap_or_default();
            match k.disk_write(unit, track, first, sectors, &data) {
                Ok(()) => {
                    args.arg[0] = 0;
                    args.arg[3] = 0;
                }
                Err(e) => report_device_error(args, e),
            }
        }));
        self.install_syscall(Syscall::DiskSize, Arc::new(|k, args| {
            match k.disk_size(args.arg[0] as usize) {
                Ok((sector, track, tracks)) => {
                    args.arg[0] = sector as i64;
                    args.arg[1] = track as i64;
                    args.arg[2] = tracks as i64;
                    args.arg[3] = 0;
                }
                Err(e) => report_device_error(args, e),
            }
        }));
        self.install_syscall(Syscall::TermRead, Arc::new(|k, args| {
            let unit = args.arg[2] as usize;
            let len = (args.arg[1] as usize).min(crate::types::MAX_LINE);
            let mut buf = vec![0u8; len.max(1)];
            match k.term_read(unit, &mut buf) {
                Ok(n) => {
                    buf.truncate(n);
                    args.data = Some(buf);
                    args.arg[1] = n as i64;
                    args.arg[3] = 0;
                }
                Err(e) => report_device_error(args, e),
            }
        }));
        self.install_syscall(Syscall::TermWrite, Arc::new(|k, args| {
            let unit = args.arg[2] as usize;
            let data = args.data.take().unwrap_or_default();
            match k.term_write(unit, &data) {
                Ok(n) => {
                    args.arg[1] = n as i64;
                    args.arg[3] = 0;
                }
                Err(e) => report_device_error(args, e),
            }
        }));
        self.install_syscall(Syscall::MboxCreate, Arc::new(|k, args| {
            match k.mbox_create(args.arg[0] as i32, args.arg[1] as i32) {
                Ok(id) => {
                    args.arg[3] = 0;
                    args.arg[0] = id.raw() as i64;
                }
                Err(_) => args.arg[3] = -1,
            }
        }));
        self.install_syscall(Syscall::MboxRelease, Arc::new(|k, args| {
            let id = BoxId::from_raw(args.arg[0] as i32);
            args.arg[3] = match k.mbox_release(id) {
                Ok(()) => 0,
                Err(_) => -1,
            };
        }));
        self.install_syscall(Syscall::MboxSend, Arc::new(|k, args| {
            let id = BoxId::from_raw(args.arg[0] as i32);
            let data = args.data.take().unwrap_or_default();
            args.arg[3] = match k.mbox_send(id, &data) {
                Ok(()) => 0,
                Err(_) => -1,
            };
        }));
        self.install_syscall(Syscall::MboxReceive, Arc::new(|k, args| {
            let id = BoxId::from_raw(args.arg[0] as i32);
            let len = (args.arg[1] as usize).min(crate::types::MAX_MESSAGE);
            let mut buf = vec![0u8; len];
            match k.mbox_receive(id, &mut buf) {
                Ok(n) => {
                    buf.truncate(n);
                    args.data = Some(buf);
                    args.arg[1] = n as i64;
                    args.arg[3] = 0;
                }
                Err(_) => args.arg[3] = -1,
            }
        }));
        self.install_syscall(Syscall::MboxCondSend, Arc::new(|k, args| {
            let id = BoxId::from_raw(args.arg[0] as i32);
            let data = args.data.take().unwrap_or_default();
            args.arg[3] = match k.mbox_cond_send(id, &data) {
                Ok(()) => 0,
                Err(crate::ipc::IpcError::WouldBlock) => 1,
                Err(_) => -1,
            };
        }));
        self.install_syscall(Syscall::MboxCondReceive, Arc::new(|k, args| {
            let id = BoxId::from_raw(args.arg[0] as i32);
            let len = (args.arg[1] as usize).min(crate::types::MAX_MESSAGE);
            let mut buf = vec![0u8; len];
            match k.mbox_cond_receive(id, &mut buf) {
                Ok(n) => {
                    buf.truncate(n);
                    args.data = Some(buf);
                    args.arg[1] = n as i64;
                    args.arg[3] = 0;
                }
                Err(crate::ipc::IpcError::WouldBlock) => args.arg[3] = 1,
                Err(_) => args.arg[3] = -1,
            }
        }));
        self.install_syscall(Syscall::VmInit, Arc::new(|k, args| {
            let result = k.vm_init(
                args.arg[0] as usize,
                args.arg[1] as usize,
                args.arg[2] as usize,
                args.arg[3] as usize,
            );
            args.arg[4] = match result {
                Ok(()) => 0,
                Err(_) => -1,
            };
        }));
        self.install_syscall(Syscall::VmCleanup, Arc::new(|k, args| {
            k.vm_cleanup();
            args.arg[4] = 0;
        }));
    }
}

fn report_device_error(args: &mut SysArgs, e: crate::dev::DeviceOpError) {
    use crate::dev::DeviceOpError;
    args.arg[3] = match e {
        DeviceOpError::BadInput => -1,
        DeviceOpError::Zapped => -2,
        DeviceOpError::Device(status) => -(status.abs().max(1)) as i64,
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numbering_is_the_closed_abi() {
        assert_eq!(Syscall::Spawn.number(), 1);
        assert_eq!(Syscall::GetTimeOfDay.number(), 8);
        assert_eq!(Syscall::Sleep.number(), 11);
        assert_eq!(Syscall::MboxCreate.number(), 17);
        assert_eq!(Syscall::VmCleanup.number(), 24);
    }

    #[test]
    fn from_number_round_trips_every_call() {
        for n in 1..=24 {
            let call = Syscall::from_number(n).unwrap();
            assert_eq!(call.number(), n);
        }
        assert_eq!(Syscall::from_number(0), None);
        assert_eq!(Syscall::from_number(25), None);
    }

    #[test]
    fn sysvec_defaults_to_unset() {
        let vec = SysVec::new();
        assert!(vec.get(Syscall::Spawn.number()).is_none());
        assert!(vec.get(-1).is_none());
        assert!(vec.get(MAX_SYSCALLS as i32).is_none());
    }
}
