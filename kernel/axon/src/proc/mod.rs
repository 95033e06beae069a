// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Process table and lifecycle: fork/join/quit/zap, blocking, dispatch
//! OWNERS: @kernel-sched-team
//! PUBLIC API: fork/join/quit/zap/is_zapped/block_me/unblock_proc/time_slice,
//!             getpid/readtime/read_cur_start_time/dump_processes
//! DEPENDS_ON: sched::PriorityQueues, hal::Machine contexts, vm hooks
//! INVARIANTS: One RUNNING descriptor between dispatches; state agrees with
//!             queue membership; child lists keep unquit children in fork
//!             order followed by quit children in quit order

use std::sync::Arc;

use crate::hal::machine::CtxId;
use crate::log_debug;
use crate::hal::{Psr, CLOCK_MS, MIN_STACK};
use crate::kernel::{Kernel, ProcEntry};
use crate::sched::PriorityQueues;
use crate::types::{
    Pid, Priority, BLOCKED_JOIN, BLOCKED_ZAPPING, MAX_ARG, MAX_NAME, MAX_PROC, MIN_BLOCK_CODE,
};

/// Status value of a descriptor that is neither blocked nor quit.
pub(crate) const CLEARED_CODE: i32 = 0;

/// Timeslice length in microseconds (four clock ticks).
const TIME_SLICE_US: u64 = 4 * CLOCK_MS * 1000;

/// Lifecycle state of a process.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ProcState {
    Ready,
    Running,
    Blocked,
    Quit,
}

/// Errors returned by `fork`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ForkError {
    /// Priority outside the user range.
    InvalidPriority,
    /// Stack below the machine minimum.
    StackTooSmall,
    /// Process table exhausted.
    NoSlots,
    /// Every 15-bit pid collides with a live process.
    NoPids,
    /// Oversize name or argument.
    BadArg,
}

/// Errors returned by `join`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum JoinError {
    /// The caller has no children.
    NoChildren,
    /// The caller was zapped while joining; the child's exit code is still
    /// reported.
    Zapped { child: Pid, status: i32 },
}

/// The caller (or target) was zapped while blocked.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Zapped;

/// Errors returned by `unblock_proc`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum UnblockError {
    /// No such process, not blocked, self-unblock, or a reserved reason.
    BadPid,
    /// The caller was zapped.
    Zapped,
}

/// One process descriptor. Slot index is `pid % MAX_PROC`.
pub(crate) struct Descriptor {
    pub pid: Pid,
    pub name: String,
    pub arg: String,
    pub priority: Priority,
    pub state: ProcState,
    /// Block reason while blocked, exit code once quit.
    pub status: i32,
    pub exec_time_us: u64,
    pub slice_start_us: u64,
    pub zapped: bool,
    /// Process this one is currently zapping, if any.
    pub zappee: Option<Pid>,
    pub parent: Option<Pid>,
    /// Unquit children in fork order, then quit children in quit order.
    pub children: Vec<Pid>,
    pub ctx: CtxId,
    pub stack_size: usize,
}

/// The process table plus the ready and wait lists.
pub(crate) struct ProcTable {
    pub slots: Vec<Option<Descriptor>>,
    pub ready: PriorityQueues,
    pub wait: PriorityQueues,
    pub current: Option<Pid>,
    next_pid: u16,
}

impl ProcTable {
    pub fn new() -> Self {
        Self {
            slots: (0..MAX_PROC).map(|_| None).collect(),
            ready: PriorityQueues::new(),
            wait: PriorityQueues::new(),
            current: None,
            next_pid: Pid::SENTINEL.raw(),
        }
    }

    pub fn descriptor(&self, pid: Pid) -> Option<&Descriptor> {
        self.slots[pid.slot()].as_ref().filter(|d| d.pid == pid)
    }

    pub fn descriptor_mut(&mut self, pid: Pid) -> Option<&mut Descriptor> {
        self.slots[pid.slot()].as_mut().filter(|d| d.pid == pid)
    }

    pub fn live_count(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }

    /// Picks the next pid whose table slot is free, advancing the rolling
    /// cursor. Pid 0 never exists and the sentinel pid stays reserved.
    pub fn take_pid(&mut self) -> Result<Pid, ForkError> {
        if self.live_count() == MAX_PROC {
            return Err(ForkError::NoSlots);
        }
        let start = self.next_pid;
        let mut candidate = start;
        loop {
            candidate = if candidate >= Pid::MAX_RAW { 1 } else { candidate + 1 };
            if candidate == 0 || candidate == Pid::SENTINEL.raw() {
                candidate = Pid::SENTINEL.raw() + 1;
            }
            let pid = Pid::from_raw(candidate);
            if self.slots[pid.slot()].is_none() {
                self.next_pid = candidate;
                return Ok(pid);
            }
            if candidate == start {
                return Err(ForkError::NoPids);
            }
        }
    }

    /// First child of `parent` that has quit, in child-list order (which is
    /// quit order for quit children).
    pub fn first_quit_child(&self, parent: Pid) -> Option<Pid> {
        let desc = self.descriptor(parent)?;
        desc.children
            .iter()
            .copied()
            .find(|&kid| {
                self.descriptor(kid)
                    .map(|d| d.state == ProcState::Quit)
                    .unwrap_or(false)
            })
    }

    pub fn unquit_children(&self, parent: Pid) -> usize {
        match self.descriptor(parent) {
            Some(desc) => desc
                .children
                .iter()
                .filter(|&&kid| {
                    self.descriptor(kid)
                        .map(|d| d.state != ProcState::Quit)
                        .unwrap_or(false)
                })
                .count(),
            None => 0,
        }
    }

    /// Moves a blocked process to the ready list and clears its reason.
    pub fn make_ready(&mut self, pid: Pid) {
        let Some(desc) = self.descriptor_mut(pid) else {
            return;
        };
        let priority = desc.priority;
        desc.status = CLEARED_CODE;
        desc.state = ProcState::Ready;
        self.wait.remove(pid);
        self.ready.push(pid, priority);
    }
}

impl Kernel {
    /// Creates a process and schedules it. The dispatcher may switch to the
    /// child immediately when its priority beats the caller's.
    pub fn fork(
        self: &Arc<Self>,
        name: &str,
        entry: ProcEntry,
        arg: Option<&str>,
        stack_size: usize,
        priority: i32,
    ) -> Result<Pid, ForkError> {
        let priority = Priority::user(priority).ok_or(ForkError::InvalidPriority)?;
        self.fork_internal(name, entry, arg, stack_size, priority)
    }

    pub(crate) fn fork_internal(
        self: &Arc<Self>,
        name: &str,
        entry: ProcEntry,
        arg: Option<&str>,
        stack_size: usize,
        priority: Priority,
    ) -> Result<Pid, ForkError> {
        self.check_kernel_mode("fork");
        if name.len() > MAX_NAME - 1 {
            return Err(ForkError::BadArg);
        }
        if stack_size < MIN_STACK {
            return Err(ForkError::StackTooSmall);
        }
        let arg = arg.unwrap_or("");
        if arg.len() > MAX_ARG - 1 {
            return Err(ForkError::BadArg);
        }

        self.disable_interrupts();
        let (pid, parent) = {
            let mut pt = self.proc.lock();
            let pid = if priority == Priority::SENTINEL {
                Pid::SENTINEL
            } else {
                match pt.take_pid() {
                    Ok(pid) => pid,
                    Err(e) => {
                        let has_current = pt.current.is_some();
                        drop(pt);
                        if has_current {
                            self.enable_interrupts();
                        }
                        return Err(e);
                    }
                }
            };
            (pid, pt.current)
        };

        // The machine context starts with interrupts disabled; the launch
        // trampoline enables them before entering the user function.
        let kernel = Arc::clone(self);
        let arg_owned = arg.to_string();
        let ctx = self.machine.context_init(
            Psr::CUR_MODE,
            stack_size,
            Box::new(move || launch(kernel, arg_owned, entry)),
        );

        {
            let mut pt = self.proc.lock();
            let slot = pid.slot();
            pt.slots[slot] = Some(Descriptor {
                pid,
                name: name.to_string(),
                arg: arg.to_string(),
                priority,
                state: ProcState::Ready,
                status: CLEARED_CODE,
                exec_time_us: 0,
                slice_start_us: 0,
                zapped: false,
                zappee: None,
                parent,
                children: Vec::new(),
                ctx,
                stack_size,
            });
            if let Some(parent) = parent {
                if let Some(desc) = pt.descriptor_mut(parent) {
                    desc.children.push(pid);
                }
            }
            pt.ready.push(pid, priority);
        }

        self.vm_fork_hook(pid);

        log_debug!(target: "proc", "forked '{name}' pid {}", pid.raw());

        self.dispatcher();
        let has_current = self.proc.lock().current.is_some();
        if has_current {
            self.enable_interrupts();
        }
        Ok(pid)
    }

    /// Waits for a child to quit; children are observed in quit order.
    pub fn join(self: &Arc<Self>) -> Result<(Pid, i32), JoinError> {
        self.check_kernel_mode("join");
        let me = self.getpid();

        let kid = loop {
            self.disable_interrupts();
            let found = {
                let pt = self.proc.lock();
                if pt
                    .descriptor(me)
                    .map(|d| d.children.is_empty())
                    .unwrap_or(true)
                {
                    None
                } else {
                    Some(pt.first_quit_child(me))
                }
            };
            match found {
                None => {
                    self.enable_interrupts();
                    return Err(JoinError::NoChildren);
                }
                Some(Some(kid)) => break kid,
                Some(None) => {
                    self.enable_interrupts();
                    // Unblocked by the child's quit; zap state is checked
                    // once a quit child is in hand.
                    let _ = self.block_me(BLOCKED_JOIN);
                }
            }
        };

        // Interrupts are disabled here.
        let (status, zapped) = {
            let mut pt = self.proc.lock();
            let status = pt
                .descriptor(kid)
                .map(|d| d.status)
                .unwrap_or(CLEARED_CODE);
            if let Some(desc) = pt.descriptor_mut(me) {
                desc.children.retain(|&c| c != kid);
            }
            pt.slots[kid.slot()] = None;
            let zapped = pt.descriptor(me).map(|d| d.zapped).unwrap_or(false);
            (status, zapped)
        };
        self.enable_interrupts();
        if zapped {
            Err(JoinError::Zapped { child: kid, status })
        } else {
            Ok((kid, status))
        }
    }

    /// Terminates the calling process with `code`. Fatal if unquit children
    /// remain. Never returns.
    pub fn quit(self: &Arc<Self>, code: i32) -> ! {
        self.check_kernel_mode("quit");
        let me = self.getpid();

        self.disable_interrupts();
        {
            let mut pt = self.proc.lock();
            if pt.unquit_children(me) > 0 {
                let n = pt.unquit_children(me);
                drop(pt);
                crate::fatal!(self.machine, "pid {} quit with {n} unquit children", me.raw());
            }
            let now = self.machine.sys_clock();
            let parent = {
                let Some(desc) = pt.descriptor_mut(me) else {
                    drop(pt);
                    crate::fatal!(self.machine, "quit with no descriptor");
                };
                desc.exec_time_us += now.saturating_sub(desc.slice_start_us);
                desc.parent
            };

            if let Some(parent) = parent {
                // Quit children move to the tail so joins observe quit order.
                let (blocked_join, missing_list) = match pt.descriptor_mut(parent) {
                    Some(p) => {
                        if p.children.is_empty() {
                            (false, true)
                        } else {
                            p.children.retain(|&c| c != me);
                            p.children.push(me);
                            (p.state == ProcState::Blocked && p.status == BLOCKED_JOIN, false)
                        }
                    }
                    None => (false, true),
                };
                if missing_list {
                    drop(pt);
                    crate::fatal!(
                        self.machine,
                        "pid {} has parent {} but parent has no child list",
                        me.raw(),
                        parent.raw()
                    );
                }
                if blocked_join {
                    pt.make_ready(parent);
                }
            }

            // Wake every process blocked zapping us.
            let is_zapped = pt.descriptor(me).map(|d| d.zapped).unwrap_or(false);
            if is_zapped {
                let zappers: Vec<Pid> = pt
                    .slots
                    .iter()
                    .flatten()
                    .filter(|d| {
                        d.state == ProcState::Blocked
                            && d.status == BLOCKED_ZAPPING
                            && d.zappee == Some(me)
                    })
                    .map(|d| d.pid)
                    .collect();
                for zapper in zappers {
                    pt.make_ready(zapper);
                }
            }

            if let Some(desc) = pt.descriptor_mut(me) {
                desc.state = ProcState::Quit;
                desc.status = code;
            }
        }

        self.vm_quit_hook(me);
        log_debug!(target: "proc", "pid {} quit with code {code}", me.raw());
        self.dispatcher();
        crate::fatal!(self.machine, "quit process rescheduled");
    }

    /// Marks `pid` zapped and waits for it to quit. Self-zap and zapping a
    /// nonexistent pid are fatal.
    pub fn zap(self: &Arc<Self>, pid: Pid) -> Result<(), Zapped> {
        self.check_kernel_mode("zap");
        let me = self.getpid();
        if pid == me {
            crate::fatal!(self.machine, "pid {} attempted to zap itself", me.raw());
        }

        self.disable_interrupts();
        let must_wait = {
            let mut pt = self.proc.lock();
            let Some(target) = pt.descriptor_mut(pid) else {
                drop(pt);
                crate::fatal!(
                    self.machine,
                    "pid {} zapping nonexistent pid {}",
                    me.raw(),
                    pid.raw()
                );
            };
            target.zapped = true;
            let wait = target.state != ProcState::Quit;
            if wait {
                if let Some(desc) = pt.descriptor_mut(me) {
                    desc.zappee = Some(pid);
                }
            }
            wait
        };

        if must_wait {
            self.enable_interrupts();
            let blocked = self.block_me(BLOCKED_ZAPPING);
            self.disable_interrupts();
            if let Some(desc) = self.proc.lock().descriptor_mut(me) {
                desc.zappee = None;
            }
            self.enable_interrupts();
            blocked
        } else {
            self.enable_interrupts();
            Ok(())
        }
    }

    /// Whether the current process has been zapped.
    pub fn is_zapped(&self) -> bool {
        self.check_kernel_mode("is_zapped");
        let me = self.getpid();
        self.with_ints_disabled(|| {
            self.proc
                .lock()
                .descriptor(me)
                .map(|d| d.zapped)
                .unwrap_or(false)
        })
    }

    /// Pid of the current process. Fatal when called with no process
    /// running (a kernel bug).
    pub fn getpid(&self) -> Pid {
        let current = self.with_ints_disabled(|| self.proc.lock().current);
        match current {
            Some(pid) => pid,
            None => crate::fatal!(self.machine, "getpid with no current process"),
        }
    }

    /// Blocks the caller with `reason` (must be outside the reserved range).
    pub fn block_me(self: &Arc<Self>, reason: i32) -> Result<(), Zapped> {
        self.check_kernel_mode("block_me");
        if reason < MIN_BLOCK_CODE {
            crate::fatal!(self.machine, "invalid block code {reason}");
        }
        let me = self.getpid();

        self.disable_interrupts();
        {
            let mut pt = self.proc.lock();
            let now = self.machine.sys_clock();
            let priority = {
                let Some(desc) = pt.descriptor_mut(me) else {
                    drop(pt);
                    crate::fatal!(self.machine, "block_me with no descriptor");
                };
                desc.exec_time_us += now.saturating_sub(desc.slice_start_us);
                desc.status = reason;
                desc.state = ProcState::Blocked;
                desc.priority
            };
            pt.wait.push(me, priority);
        }
        self.dispatcher();

        // Resumed.
        let zapped = self
            .proc
            .lock()
            .descriptor(me)
            .map(|d| d.zapped)
            .unwrap_or(false);
        self.enable_interrupts();
        if zapped {
            Err(Zapped)
        } else {
            Ok(())
        }
    }

    /// Moves a blocked process back to its ready queue and dispatches.
    pub fn unblock_proc(self: &Arc<Self>, pid: Pid) -> Result<(), UnblockError> {
        self.check_kernel_mode("unblock_proc");
        self.disable_interrupts();
        {
            let mut pt = self.proc.lock();
            let me = pt.current;
            let ok = match pt.descriptor(pid) {
                Some(desc) => {
                    Some(pid) != me
                        && desc.state == ProcState::Blocked
                        && desc.status > MIN_BLOCK_CODE
                        // Join and zap wakeups are managed by quit.
                        && desc.status != BLOCKED_JOIN
                        && desc.status != BLOCKED_ZAPPING
                }
                None => false,
            };
            if !ok {
                drop(pt);
                self.enable_interrupts();
                return Err(UnblockError::BadPid);
            }
            let caller_zapped = me
                .and_then(|me| pt.descriptor(me))
                .map(|d| d.zapped)
                .unwrap_or(false);
            if caller_zapped {
                drop(pt);
                self.enable_interrupts();
                return Err(UnblockError::Zapped);
            }
            pt.make_ready(pid);
        }
        self.dispatcher();
        self.enable_interrupts();
        Ok(())
    }

    /// Called from the clock interrupt: dispatches once the running process
    /// has used up its four-tick slice.
    pub fn time_slice(self: &Arc<Self>) {
        let expired = self.with_ints_disabled(|| {
            let pt = self.proc.lock();
            match pt.current.and_then(|pid| pt.descriptor(pid)) {
                Some(desc) => {
                    self.machine.sys_clock().saturating_sub(desc.slice_start_us) > TIME_SLICE_US
                }
                None => false,
            }
        });
        if expired {
            self.dispatcher();
        }
    }

    /// Microsecond timestamp at which the current process started its slice.
    pub fn read_cur_start_time(&self) -> u64 {
        let me = self.getpid();
        self.with_ints_disabled(|| {
            self.proc
                .lock()
                .descriptor(me)
                .map(|d| d.slice_start_us)
                .unwrap_or(0)
        })
    }

    /// Milliseconds of CPU consumed by the current process.
    pub fn readtime(&self) -> u64 {
        let me = self.getpid();
        self.with_ints_disabled(|| {
            self.proc
                .lock()
                .descriptor(me)
                .map(|d| d.exec_time_us / 1000)
                .unwrap_or(0)
        })
    }

    /// Prints one line per process-table slot on the simulator console.
    pub fn dump_processes(&self) {
        self.disable_interrupts();
        {
            let pt = self.proc.lock();
            crate::hal::machine::console(format_args!(
                "  Pid  PPid  Prio            Status             #Kids     CPU (us)      Name\n\
                 --------------------------------------------------------------------------------\n"
            ));
            for slot in pt.slots.iter() {
                match slot {
                    Some(d) => {
                        let ppid = d.parent.map(|p| p.raw()).unwrap_or(0);
                        let status = status_label(d);
                        crate::hal::machine::console(format_args!(
                            "{:5} {:5} {:5} {:>17} {:6} {:12} {:>12}\n",
                            d.pid.raw(),
                            ppid,
                            d.priority.raw(),
                            status,
                            d.children.len(),
                            d.exec_time_us,
                            d.name
                        ));
                    }
                    None => {
                        crate::hal::machine::console(format_args!(
                            "{:5} {:5} {:5} {:>17} {:6} {:12} {:>12}\n",
                            0, 0, 0, "empty", 0, 0, "-"
                        ));
                    }
                }
            }
            crate::hal::machine::console(format_args!(
                "--------------------------------------------------------------------------------\n"
            ));
        }
        self.enable_interrupts();
    }

    /// Picks the next process to run. Callers hold no kernel locks. The
    /// selection and the context-switch pair run with interrupts disabled;
    /// the caller's interrupt state is restored when it is resumed.
    pub(crate) fn dispatcher(self: &Arc<Self>) {
        let saved_psr = self.machine.psr_get();
        self.disable_interrupts();
        let action = {
            let mut pt = self.proc.lock();

            if let Some(cur) = pt.current {
                let demote = pt
                    .descriptor(cur)
                    .map(|d| d.state == ProcState::Running)
                    .unwrap_or(false);
                if demote {
                    if let Some(desc) = pt.descriptor_mut(cur) {
                        desc.state = ProcState::Ready;
                    }
                    let priority = match pt.descriptor(cur) {
                        Some(d) => d.priority,
                        None => Priority::SENTINEL,
                    };
                    pt.ready.push(cur, priority);
                }
            }

            let Some(next) = pt.ready.pop_highest() else {
                drop(pt);
                crate::fatal!(self.machine, "dispatcher found no runnable process");
            };

            match pt.current {
                None if next == Pid::SENTINEL => {
                    // Bring-up: the sentinel stays queued until a real
                    // process exists to run first.
                    pt.ready.push(next, Priority::SENTINEL);
                    None
                }
                None => {
                    let now = self.machine.sys_clock();
                    pt.current = Some(next);
                    let ctx = match pt.descriptor_mut(next) {
                        Some(d) => {
                            d.state = ProcState::Running;
                            d.slice_start_us = now;
                            d.ctx
                        }
                        None => {
                            drop(pt);
                            crate::fatal!(self.machine, "dispatcher lost descriptor");
                        }
                    };
                    Some((None, next, None, ctx))
                }
                Some(cur) if cur == next => {
                    let now = self.machine.sys_clock();
                    if let Some(desc) = pt.descriptor_mut(cur) {
                        desc.exec_time_us += now.saturating_sub(desc.slice_start_us);
                        desc.slice_start_us = now;
                        desc.state = ProcState::Running;
                    }
                    None
                }
                Some(cur) => {
                    let now = self.machine.sys_clock();
                    let old_ctx = match pt.descriptor_mut(cur) {
                        Some(d) => {
                            d.exec_time_us += now.saturating_sub(d.slice_start_us);
                            Some(d.ctx)
                        }
                        None => None,
                    };
                    pt.current = Some(next);
                    let ctx = match pt.descriptor_mut(next) {
                        Some(d) => {
                            d.state = ProcState::Running;
                            d.slice_start_us = now;
                            d.ctx
                        }
                        None => {
                            drop(pt);
                            crate::fatal!(self.machine, "dispatcher lost descriptor");
                        }
                    };
                    Some((Some(cur), next, old_ctx, ctx))
                }
            }
        };

        if let Some((old_pid, new_pid, old_ctx, new_ctx)) = action {
            self.vm_switch_hook(old_pid, new_pid);
            let handing_over = old_ctx.is_none();
            self.machine.context_switch(old_ctx, new_ctx);
            if handing_over {
                // Bring-up path: the machine now belongs to the first
                // process; the startup thread retires here.
                loop {
                    std::thread::park();
                }
            }
        }
        self.machine.psr_set(saved_psr);
    }
}

/// Launch trampoline: enables interrupts, runs the user entry, feeds the
/// return value to quit.
fn launch(kernel: Arc<Kernel>, arg: String, entry: ProcEntry) {
    kernel.enable_interrupts();
    let result = entry(&kernel, &arg);
    kernel.quit(result);
}

fn status_label(d: &Descriptor) -> String {
    match d.state {
        ProcState::Running => "running".to_string(),
        ProcState::Ready => "ready".to_string(),
        ProcState::Blocked => match d.status {
            BLOCKED_JOIN => "blocked(join)".to_string(),
            BLOCKED_ZAPPING => "blocked(zap)".to_string(),
            code => format!("blocked({code})"),
        },
        ProcState::Quit => format!("quit({})", d.status),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(pid: Pid, priority: Priority) -> Descriptor {
        Descriptor {
            pid,
            name: format!("p{}", pid.raw()),
            arg: String::new(),
            priority,
            state: ProcState::Ready,
            status: CLEARED_CODE,
            exec_time_us: 0,
            slice_start_us: 0,
            zapped: false,
            zappee: None,
            parent: None,
            children: Vec::new(),
            ctx: 0,
            stack_size: MIN_STACK,
        }
    }

    fn insert(pt: &mut ProcTable, pid: Pid, priority: Priority) {
        pt.slots[pid.slot()] = Some(descriptor(pid, priority));
    }

    #[test]
    fn take_pid_skips_zero_and_sentinel() {
        let mut pt = ProcTable::new();
        let first = pt.take_pid().unwrap();
        assert_eq!(first.raw(), 2);
    }

    #[test]
    fn take_pid_skips_occupied_slots() {
        let mut pt = ProcTable::new();
        let a = pt.take_pid().unwrap();
        insert(&mut pt, a, Priority::LOWEST);
        let b = pt.take_pid().unwrap();
        assert_ne!(a, b);
        assert_ne!(a.slot(), b.slot());
    }

    #[test]
    fn take_pid_reports_full_table() {
        let mut pt = ProcTable::new();
        for slot in 0..MAX_PROC {
            let pid = Pid::from_raw(slot as u16 + MAX_PROC as u16);
            pt.slots[pid.slot()] = Some(descriptor(pid, Priority::LOWEST));
        }
        assert_eq!(pt.take_pid(), Err(ForkError::NoSlots));
    }

    #[test]
    fn pid_reuse_never_collides_with_live_pid() {
        let mut pt = ProcTable::new();
        let mut live = Vec::new();
        for _ in 0..10 {
            let pid = pt.take_pid().unwrap();
            insert(&mut pt, pid, Priority::LOWEST);
            live.push(pid);
        }
        // Free one slot and mint many more pids; none may collide.
        pt.slots[live[3].slot()] = None;
        for _ in 0..5 {
            let pid = pt.take_pid().unwrap();
            assert!(pt.descriptor(pid).is_none());
            insert(&mut pt, pid, Priority::LOWEST);
            pt.slots[pid.slot()] = None;
        }
    }

    #[test]
    fn first_quit_child_observes_quit_order() {
        let mut pt = ProcTable::new();
        let parent = Pid::from_raw(2);
        let kid_a = Pid::from_raw(3);
        let kid_b = Pid::from_raw(4);
        insert(&mut pt, parent, Priority::HIGHEST);
        insert(&mut pt, kid_a, Priority::LOWEST);
        insert(&mut pt, kid_b, Priority::LOWEST);
        if let Some(desc) = pt.descriptor_mut(parent) {
            desc.children = vec![kid_a, kid_b];
        }
        assert_eq!(pt.first_quit_child(parent), None);

        // kid_b quits first: moves to the tail, which is where it already
        // is, and becomes the first quit child found.
        if let Some(desc) = pt.descriptor_mut(kid_b) {
            desc.state = ProcState::Quit;
            desc.status = 7;
        }
        if let Some(desc) = pt.descriptor_mut(parent) {
            desc.children.retain(|&c| c != kid_b);
            desc.children.push(kid_b);
        }
        assert_eq!(pt.first_quit_child(parent), Some(kid_b));
        assert_eq!(pt.unquit_children(parent), 1);
    }

    #[test]
    fn make_ready_moves_between_queues() {
        let mut pt = ProcTable::new();
        let pid = Pid::from_raw(2);
        insert(&mut pt, pid, Priority::LOWEST);
        if let Some(desc) = pt.descriptor_mut(pid) {
            desc.state = ProcState::Blocked;
            desc.status = 42;
        }
        pt.wait.push(pid, Priority::LOWEST);
        pt.make_ready(pid);
        assert!(!pt.wait.contains(pid));
        assert!(pt.ready.contains(pid));
        let desc = pt.descriptor(pid).unwrap();
        assert_eq!(desc.state, ProcState::Ready);
        assert_eq!(desc.status, CLEARED_CODE);
    }
}
