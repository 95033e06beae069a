// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Debug-checked mutex for kernel state guarded by the interrupt discipline
//! OWNERS: @kernel-team
//! PUBLIC API: IntLock::new(), IntLock::lock()
//! DEPENDS_ON: spin::Mutex, hal::Machine (PSR state)
//! INVARIANTS: Interrupts are disabled whenever kernel state is locked (debug-only check)

use core::ops::{Deref, DerefMut};
use std::sync::Arc;

use crate::hal::machine::Machine;

/// A `spin::Mutex` wrapper that asserts the kernel's critical-section
/// discipline: machine interrupts must be disabled at lock time. The check
/// compiles out of release builds.
pub struct IntLock<T> {
    machine: Arc<Machine>,
    inner: spin::Mutex<T>,
}

impl<T> IntLock<T> {
    pub fn new(machine: Arc<Machine>, value: T) -> Self {
        Self { machine, inner: spin::Mutex::new(value) }
    }

    /// Locks the protected state, checking the interrupt discipline.
    pub fn lock(&self) -> IntLockGuard<'_, T> {
        #[cfg(debug_assertions)]
        if self.machine.interrupts_enabled() && !self.machine.halted() {
            panic!("kernel state locked with interrupts enabled");
        }
        IntLockGuard { guard: self.inner.lock() }
    }
}

pub struct IntLockGuard<'a, T> {
    guard: spin::MutexGuard<'a, T>,
}

impl<'a, T> Deref for IntLockGuard<'a, T> {
    type Target = T;
    fn deref(&self) -> &Self::Target {
        &self.guard
    }
}

impl<'a, T> DerefMut for IntLockGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.guard
    }
}
