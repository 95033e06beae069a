// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Clock driver process and the sleep operation
//! OWNERS: @kernel-dev-team
//! PUBLIC API: Kernel::sleep, clock_driver
//! DEPENDS_ON: wait_device, mailbox mutexes, dev tables
//! INVARIANTS: Sleeper list stays in insertion order; every sleeper is
//!             woken exactly once (expiry or driver shutdown)

use std::sync::Arc;

use crate::hal::Device;
use crate::kernel::Kernel;
use crate::log_warn;
use crate::types::Pid;

use super::DeviceOpError;

/// Runs until zapped: wakes on every fifth clock tick and releases
/// sleepers whose expiry has passed. Drains the list on shutdown.
pub fn clock_driver(kernel: &Arc<Kernel>, arg: &str) -> i32 {
    let unit: usize = arg.parse().unwrap_or(0);

    loop {
        match kernel.wait_device(Device::Clock, unit) {
            Ok(_) => check_for_expired(kernel, kernel.sys_clock()),
            Err(_) => break,
        }
        if kernel.is_zapped() {
            break;
        }
    }

    // Wake everybody still queued; sleepers are blocked receiving on their
    // private boxes, so a plain send pairs with them.
    loop {
        let next = kernel.with_ints_disabled(|| {
            let mut dev = kernel.dev.lock();
            if dev.clock.sleepers.is_empty() {
                None
            } else {
                let pid = dev.clock.sleepers.remove(0);
                dev.proc[pid.slot()].expiry_us = None;
                Some(pid)
            }
        });
        let Some(pid) = next else { break };
        let target = kernel.private_box(pid);
        if kernel.mbox_send(target, &[]).is_err() {
            log_warn!(target: "dev", "clock shutdown failed to wake pid {}", pid.raw());
        }
    }
    0
}

/// Scans the sleeper list under the clock mutex and wakes expired entries.
fn check_for_expired(kernel: &Arc<Kernel>, now: u64) {
    let Some(mutex) = kernel.with_ints_disabled(|| kernel.dev.lock().clock.mutex) else {
        return;
    };
    if kernel.mutex_acquire(mutex).is_err() {
        return;
    }

    let expired: Vec<Pid> = kernel.with_ints_disabled(|| {
        let mut dev = kernel.dev.lock();
        let dev = &mut *dev;
        let mut expired = Vec::new();
        let proc = &dev.proc;
        dev.clock.sleepers.retain(|&pid| {
            let done = proc[pid.slot()]
                .expiry_us
                .map(|at| now > at)
                .unwrap_or(true);
            if done {
                expired.push(pid);
            }
            !done
        });
        for &pid in &expired {
            dev.proc[pid.slot()].expiry_us = None;
        }
        expired
    });

    for pid in expired {
        let target = kernel.private_box(pid);
        // The sleeper is almost certainly blocked receiving; a conditional
        // send avoids wedging the driver if it is not yet.
        let _ = kernel.mbox_cond_send(target, &[]);
    }

    let _ = kernel.mutex_release(mutex);
}

impl Kernel {
    /// Blocks the caller for at least `seconds` seconds. Wakeups ride the
    /// clock driver's five-tick scan period.
    pub fn sleep(self: &Arc<Self>, seconds: i32) -> Result<(), DeviceOpError> {
        self.check_kernel_mode("sleep");
        if seconds < 0 {
            return Err(DeviceOpError::BadInput);
        }
        let me = self.getpid();
        let wake_at = self.sys_clock() + seconds as u64 * 1_000_000;

        let mutex = self.with_ints_disabled(|| self.dev.lock().clock.mutex);
        let Some(mutex) = mutex else {
            return Err(DeviceOpError::BadInput);
        };
        if self.mutex_acquire(mutex).is_err() {
            return Err(DeviceOpError::Zapped);
        }
        self.with_ints_disabled(|| {
            let mut dev = self.dev.lock();
            dev.proc[me.slot()].expiry_us = Some(wake_at);
            dev.clock.sleepers.push(me);
        });
        let _ = self.mutex_release(mutex);

        let private = self.private_box(me);
        let mut nothing = [0u8; 0];
        match self.mbox_receive(private, &mut nothing) {
            Ok(_) => Ok(()),
            Err(_) => Err(DeviceOpError::Zapped),
        }
    }
}
