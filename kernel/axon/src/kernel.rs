// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: The Kernel value: machine handle plus all subsystem state
//! OWNERS: @kernel-team
//! PUBLIC API: Kernel (accessors), ProcEntry
//! DEPENDS_ON: hal::Machine, proc, ipc, dev, vm, syscall
//! INVARIANTS: One Kernel per machine; subsystem state only mutated with
//!             machine interrupts disabled

use std::sync::Arc;

use crate::dev::DevTables;
use crate::hal::machine::Machine;
use crate::hal::Psr;
use crate::ipc::MailboxTable;
use crate::proc::ProcTable;
use crate::sync::IntLock;
use crate::syscall::SysVec;
use crate::vm::{VmState, VmStats};

/// Entry function of a kernel process. Receives the kernel handle and the
/// argument string passed to `fork`; the return value becomes the quit code.
pub type ProcEntry = Box<dyn FnOnce(&Arc<Kernel>, &str) -> i32 + Send>;

/// All kernel state, grouped into one value and shared by every machine
/// context. Public operations live in the subsystem modules as `impl
/// Kernel` blocks.
pub struct Kernel {
    pub(crate) machine: Arc<Machine>,
    pub(crate) proc: IntLock<ProcTable>,
    pub(crate) ipc: IntLock<MailboxTable>,
    pub(crate) dev: IntLock<DevTables>,
    pub(crate) vm: IntLock<VmState>,
    pub(crate) vm_stats: spin::Mutex<VmStats>,
    pub(crate) sys: IntLock<SysVec>,
}

impl Kernel {
    pub(crate) fn new(machine: Arc<Machine>) -> Arc<Self> {
        Arc::new(Self {
            proc: IntLock::new(Arc::clone(&machine), ProcTable::new()),
            ipc: IntLock::new(Arc::clone(&machine), MailboxTable::new()),
            dev: IntLock::new(Arc::clone(&machine), DevTables::new()),
            vm: IntLock::new(Arc::clone(&machine), VmState::new()),
            vm_stats: spin::Mutex::new(VmStats::default()),
            sys: IntLock::new(Arc::clone(&machine), SysVec::new()),
            machine,
        })
    }

    /// The simulated machine backing this kernel.
    pub fn machine(&self) -> &Arc<Machine> {
        &self.machine
    }

    /// Microseconds since boot.
    pub fn sys_clock(&self) -> u64 {
        self.machine.sys_clock()
    }

    /// Clears the PSR interrupt-enable bit.
    pub(crate) fn disable_interrupts(&self) {
        let psr = self.machine.psr_get();
        self.machine.psr_set(psr - Psr::CUR_INT);
    }

    /// Sets the PSR interrupt-enable bit; pending interrupts deliver here.
    pub(crate) fn enable_interrupts(&self) {
        let psr = self.machine.psr_get();
        self.machine.psr_set(psr | Psr::CUR_INT);
    }

    /// Halts on a user-mode call into a kernel entry point.
    pub(crate) fn check_kernel_mode(&self, what: &str) {
        if !self.machine.psr_get().contains(Psr::CUR_MODE) {
            crate::fatal!(self.machine, "{what} called outside kernel mode");
        }
    }

    /// Runs `f` with interrupts disabled, restoring the previous PSR
    /// interrupt state afterwards. Used by informational reads that must
    /// not disturb a caller's critical section.
    pub(crate) fn with_ints_disabled<R>(&self, f: impl FnOnce() -> R) -> R {
        let saved = self.machine.psr_get();
        self.machine.psr_set(saved - Psr::CUR_INT);
        let result = f();
        self.machine.psr_set(saved);
        result
    }
}
