// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Boot sequence: machine wiring, sentinel, driver bootstrap
//! OWNERS: @kernel-team
//! PUBLIC API: BootConfig, boot()
//! DEPENDS_ON: every subsystem; this is the composition root
//! INVARIANTS: The sentinel holds pid 1 and the lowest band; drivers run
//!             in band 2; the boot service joins every driver before it
//!             quits so the sentinel can declare the run complete

use std::sync::Arc;
use std::time::Duration;

use crate::dev::{clock, disk, term, DiskInfo, TermInfo};
use crate::hal::machine::{Machine, MachineConfig};
use crate::hal::{Device, DeviceError};
use crate::kernel::{Kernel, ProcEntry};
use crate::proc::JoinError;
use crate::types::{Priority, LINES_TO_BUFFER, MAX_LINE, MAX_MESSAGE, MAX_PROC};
use crate::{fatal, log_info};

/// Stack handed to driver processes.
const DRIVER_STACK: usize = 2 * crate::hal::MIN_STACK;
/// Priority band for driver processes.
const DRIVER_PRIO: i32 = 2;

/// Everything a boot needs: the machine shape plus the user entry point.
pub struct BootConfig {
    pub machine: MachineConfig,
    /// Name of the user entry process.
    pub entry_name: String,
    /// Priority band of the user entry process.
    pub entry_priority: i32,
    pub entry_stack: usize,
    /// Host-side deadline for the whole simulation (test harness guard).
    pub boot_deadline: Duration,
}

impl Default for BootConfig {
    fn default() -> Self {
        Self {
            machine: MachineConfig::default(),
            entry_name: "main".to_string(),
            entry_priority: 3,
            entry_stack: 4 * crate::hal::MIN_STACK,
            boot_deadline: Duration::from_secs(60),
        }
    }
}

/// Boots a fresh machine, runs `entry` under the full driver stack, and
/// returns the machine's halt code (0 for a clean, deadlock-free run).
pub fn boot(config: BootConfig, entry: ProcEntry) -> i32 {
    let machine = Machine::new(config.machine.clone());
    let kernel = Kernel::new(Arc::clone(&machine));

    #[cfg(feature = "boot_banner")]
    crate::hal::machine::console(format_args!("=== AXON (open-nexus-os) ===\n"));

    let disk_units = config.machine.disk_tracks.len().min(crate::hal::DISK_UNITS);
    install_interrupts(&kernel);
    kernel.install_kernel_syscalls();
    init_device_tables(&kernel, disk_units, crate::hal::TERM_UNITS);

    let service = make_service(
        entry,
        config.entry_name,
        config.entry_priority,
        config.entry_stack,
        disk_units,
        crate::hal::TERM_UNITS,
    );

    // Startup runs on its own thread: the second fork hands the machine to
    // the start service and never returns (the thread parks in the
    // dispatcher).
    let startup_kernel = Arc::clone(&kernel);
    let startup = std::thread::Builder::new()
        .name("startup".to_string())
        .spawn(move || {
            if startup_kernel
                .fork_internal(
                    "sentinel",
                    Box::new(sentinel),
                    None,
                    crate::hal::MIN_STACK,
                    Priority::SENTINEL,
                )
                .is_err()
            {
                fatal!(startup_kernel.machine(), "fork of sentinel failed");
            }
            if startup_kernel
                .fork_internal(
                    "start",
                    service,
                    None,
                    4 * crate::hal::MIN_STACK,
                    Priority::HIGHEST,
                )
                .is_err()
            {
                fatal!(startup_kernel.machine(), "fork of start service failed");
            }
        });
    if startup.is_err() {
        fatal!(machine, "startup thread failed to spawn");
    }

    machine.wait_halt(config.boot_deadline)
}

/// The sentinel: keeps the machine ticking while everything is blocked and
/// detects completion or deadlock.
fn sentinel(kernel: &Arc<Kernel>, _arg: &str) -> i32 {
    loop {
        kernel.check_deadlock();
        kernel.machine().wait_int();
    }
}

impl Kernel {
    /// Runs the sentinel's completion/deadlock evaluation.
    pub(crate) fn check_deadlock(&self) {
        let me = self.getpid();
        let (others, ready_waiting) = self.with_ints_disabled(|| {
            let pt = self.proc.lock();
            let others = pt
                .slots
                .iter()
                .flatten()
                .filter(|d| d.pid != me && d.state != crate::proc::ProcState::Quit)
                .count();
            (others, pt.ready.len() > 0)
        });
        if others == 0 {
            crate::hal::machine::console(format_args!("All processes completed.\n"));
            self.machine.halt(0);
        }
        if !ready_waiting && !self.check_io() {
            crate::hal::machine::console(format_args!(
                "deadlock: {others} processes remain with no I/O pending\n"
            ));
            self.machine.halt(1);
        }
    }
}

/// Builds the driver-bootstrap service: forks the drivers and the user
/// entry, reaps the user, then shuts the drivers down and joins them.
fn make_service(
    entry: ProcEntry,
    entry_name: String,
    entry_priority: i32,
    entry_stack: usize,
    disk_units: usize,
    term_units: usize,
) -> ProcEntry {
    Box::new(move |kernel: &Arc<Kernel>, _arg: &str| {
        let clock_pid = match kernel.fork(
            "clockd",
            Box::new(clock::clock_driver),
            Some("0"),
            DRIVER_STACK,
            DRIVER_PRIO,
        ) {
            Ok(pid) => pid,
            Err(e) => fatal!(kernel.machine(), "fork of clock driver failed: {e:?}"),
        };

        let mut disk_pids = Vec::new();
        for unit in 0..disk_units {
            let arg = unit.to_string();
            match kernel.fork(
                &format!("diskd{unit}"),
                Box::new(disk::disk_driver),
                Some(&arg),
                DRIVER_STACK,
                DRIVER_PRIO,
            ) {
                Ok(pid) => disk_pids.push(pid),
                Err(e) => fatal!(kernel.machine(), "fork of disk driver {unit} failed: {e:?}"),
            }
        }

        let mut term_pids = Vec::new();
        for unit in 0..term_units {
            let arg = unit.to_string();
            let listener = kernel.fork(
                &format!("term{unit}d"),
                Box::new(term::terminal_driver),
                Some(&arg),
                DRIVER_STACK,
                DRIVER_PRIO,
            );
            let receiver = kernel.fork(
                &format!("term{unit}rx"),
                Box::new(term::terminal_receiver),
                Some(&arg),
                DRIVER_STACK,
                DRIVER_PRIO,
            );
            let transmitter = kernel.fork(
                &format!("term{unit}tx"),
                Box::new(term::terminal_transmitter),
                Some(&arg),
                DRIVER_STACK,
                DRIVER_PRIO,
            );
            match (listener, receiver, transmitter) {
                (Ok(a), Ok(b), Ok(c)) => term_pids.push((a, b, c)),
                _ => fatal!(kernel.machine(), "fork of terminal drivers {unit} failed"),
            }
        }

        kernel.with_ints_disabled(|| {
            let mut dev = kernel.dev.lock();
            dev.drivers.clock = Some(clock_pid);
            dev.drivers.disks = disk_pids.clone();
            dev.drivers.terms = term_pids.clone();
        });

        let user_pid = match kernel.fork(&entry_name, entry, None, entry_stack, entry_priority) {
            Ok(pid) => pid,
            Err(e) => fatal!(kernel.machine(), "fork of {entry_name} failed: {e:?}"),
        };

        // Reap the user process (drivers do not quit on their own).
        let status = loop {
            match kernel.join() {
                Ok((pid, status)) if pid == user_pid => break status,
                Ok(_) => continue,
                Err(JoinError::Zapped { child, status }) if child == user_pid => break status,
                Err(JoinError::Zapped { .. }) => continue,
                Err(JoinError::NoChildren) => break -1,
            }
        };

        shutdown_drivers(kernel);
        log_info!(target: "boot", "run complete, user status {status}");
        status
    })
}

fn shutdown_drivers(kernel: &Arc<Kernel>) {
    let drivers = kernel.with_ints_disabled(|| kernel.dev.lock().drivers.clone());

    // The clock driver notices the zap at its next five-tick wakeup and
    // drains the sleeper list.
    if let Some(clock_pid) = drivers.clock {
        let _ = kernel.zap(clock_pid);
    }

    // Disk drivers interpret a wakeup with an empty queue as shutdown.
    for unit in 0..drivers.disks.len() {
        let wake = kernel.with_ints_disabled(|| kernel.dev.lock().disks[unit].wake_box);
        if let Some(wake) = wake {
            let _ = kernel.mbox_cond_send(wake, &[]);
        }
    }

    // Terminal processes fall out of their feed mailboxes; the listener
    // needs the zap flag plus one more terminal interrupt.
    for unit in 0..drivers.terms.len() {
        let boxes = kernel.with_ints_disabled(|| {
            let dev = kernel.dev.lock();
            let t = &dev.terms[unit];
            (t.rx_box, t.rx_syscall_box, t.tx_syscall_box, t.tx_mutex)
        });
        for id in [boxes.0, boxes.1, boxes.2, boxes.3].into_iter().flatten() {
            let _ = kernel.mbox_release(id);
        }
    }
    for &(listener, receiver, transmitter) in &drivers.terms {
        let _ = kernel.zap(listener);
        let _ = kernel.zap(receiver);
        let _ = kernel.zap(transmitter);
    }

    // Reap every remaining child (drivers, stray grandchildren).
    loop {
        match kernel.join() {
            Ok(_) | Err(JoinError::Zapped { .. }) => continue,
            Err(JoinError::NoChildren) => break,
        }
    }
}

/// Creates the private per-slot mailboxes and the per-device plumbing.
fn init_device_tables(kernel: &Arc<Kernel>, disk_units: usize, term_units: usize) {
    for slot in 0..MAX_PROC {
        let private = match kernel.mbox_create(0, MAX_MESSAGE as i32) {
            Ok(id) => id,
            Err(e) => fatal!(kernel.machine(), "private mailbox for slot {slot}: {e:?}"),
        };
        kernel.with_ints_disabled(|| {
            kernel.dev.lock().proc[slot].private_box = Some(private);
        });
    }

    let clock_box = match kernel.mbox_create(0, MAX_MESSAGE as i32) {
        Ok(id) => id,
        Err(e) => fatal!(kernel.machine(), "clock device mailbox: {e:?}"),
    };
    let clock_mutex = match kernel.mbox_create(1, 4) {
        Ok(id) => id,
        Err(e) => fatal!(kernel.machine(), "clock mutex mailbox: {e:?}"),
    };
    kernel.with_ints_disabled(|| {
        let mut dev = kernel.dev.lock();
        dev.set_device_mbox(Device::Clock, 0, clock_box);
        dev.clock.mutex = Some(clock_mutex);
        dev.disk_units = disk_units;
        dev.term_units = term_units;
    });

    for unit in 0..disk_units {
        let device_box = match kernel.mbox_create(0, MAX_MESSAGE as i32) {
            Ok(id) => id,
            Err(e) => fatal!(kernel.machine(), "disk {unit} device mailbox: {e:?}"),
        };
        let wake_box = match kernel.mbox_create(0, 0) {
            Ok(id) => id,
            Err(e) => fatal!(kernel.machine(), "disk {unit} wake mailbox: {e:?}"),
        };
        let mutex = match kernel.mbox_create(1, 4) {
            Ok(id) => id,
            Err(e) => fatal!(kernel.machine(), "disk {unit} mutex mailbox: {e:?}"),
        };
        kernel.with_ints_disabled(|| {
            let mut dev = kernel.dev.lock();
            dev.set_device_mbox(Device::Disk, unit, device_box);
            dev.disks.push(DiskInfo {
                wake_box: Some(wake_box),
                mutex: Some(mutex),
                queue: Vec::new(),
            });
        });
    }

    for unit in 0..term_units {
        let device_box = match kernel.mbox_create(0, MAX_MESSAGE as i32) {
            Ok(id) => id,
            Err(e) => fatal!(kernel.machine(), "term {unit} device mailbox: {e:?}"),
        };
        let rx_box = match kernel.mbox_create(10, 1) {
            Ok(id) => id,
            Err(e) => fatal!(kernel.machine(), "term {unit} rx mailbox: {e:?}"),
        };
        let rx_syscall_box = match kernel.mbox_create(LINES_TO_BUFFER as i32, MAX_LINE as i32) {
            Ok(id) => id,
            Err(e) => fatal!(kernel.machine(), "term {unit} line mailbox: {e:?}"),
        };
        let tx_mutex = match kernel.mbox_create(1, 4) {
            Ok(id) => id,
            Err(e) => fatal!(kernel.machine(), "term {unit} tx mutex: {e:?}"),
        };
        let tx_syscall_box = match kernel.mbox_create(1, MAX_MESSAGE as i32) {
            Ok(id) => id,
            Err(e) => fatal!(kernel.machine(), "term {unit} tx mailbox: {e:?}"),
        };
        kernel.with_ints_disabled(|| {
            let mut dev = kernel.dev.lock();
            dev.set_device_mbox(Device::Term, unit, device_box);
            dev.terms.push(TermInfo {
                rx_box: Some(rx_box),
                rx_syscall_box: Some(rx_syscall_box),
                tx_mutex: Some(tx_mutex),
                tx_syscall_box: Some(tx_syscall_box),
                tx_valid: false,
                tx_waiter: None,
            });
        });
    }
}

/// Wires the interrupt vector: clock batching, device status forwarding,
/// the MMU fault path, and fatal stubs for alarm/syscall.
fn install_interrupts(kernel: &Arc<Kernel>) {
    let machine = Arc::clone(kernel.machine());

    let k = Arc::clone(kernel);
    machine.set_int_handler(
        Device::Clock,
        Arc::new(move |_, _| {
            k.clock_interrupt();
        }),
    );

    let k = Arc::clone(kernel);
    machine.set_int_handler(
        Device::Disk,
        Arc::new(move |_, unit| {
            k.device_interrupt(Device::Disk, unit as usize);
        }),
    );

    let k = Arc::clone(kernel);
    machine.set_int_handler(
        Device::Term,
        Arc::new(move |_, unit| {
            k.device_interrupt(Device::Term, unit as usize);
        }),
    );

    let k = Arc::clone(kernel);
    machine.set_int_handler(
        Device::Mmu,
        Arc::new(move |_, offset| {
            k.mmu_fault(offset);
        }),
    );

    let k = Arc::clone(kernel);
    machine.set_int_handler(
        Device::Alarm,
        Arc::new(move |dev, unit| {
            fatal!(k.machine(), "unexpected interrupt from {dev:?} unit {unit}");
        }),
    );

    let k = Arc::clone(kernel);
    machine.set_int_handler(
        Device::Syscall,
        Arc::new(move |dev, unit| {
            fatal!(k.machine(), "unexpected interrupt from {dev:?} unit {unit}");
        }),
    );
}

impl Kernel {
    /// Clock interrupt body: batch a status message to the clock driver
    /// every fifth tick, then run the timeslice check.
    pub(crate) fn clock_interrupt(self: &Arc<Self>) {
        let target = self.with_ints_disabled(|| {
            let mut dev = self.dev.lock();
            let due = dev.tick_count % 5 == 0;
            dev.tick_count += 1;
            if due {
                dev.device_mbox(Device::Clock, 0)
            } else {
                None
            }
        });
        if let Some(target) = target {
            let now = self.sys_clock() as i32;
            let _ = self.mbox_cond_send(target, &now.to_le_bytes());
        }
        self.time_slice();
    }

    /// Disk/terminal interrupt body: read the status register and forward
    /// it to the unit's device mailbox.
    pub(crate) fn device_interrupt(self: &Arc<Self>, device: Device, unit: usize) {
        let status = match self.machine.device_input(device, unit) {
            Ok(status) => status,
            Err(DeviceError::Invalid) => {
                fatal!(self.machine, "interrupt from invalid {device:?} unit {unit}")
            }
            Err(_) => return,
        };
        let target = self.with_ints_disabled(|| self.dev.lock().device_mbox(device, unit));
        if let Some(target) = target {
            let _ = self.mbox_cond_send(target, &status.to_le_bytes());
        }
    }
}
