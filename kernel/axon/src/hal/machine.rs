// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: The simulated machine: contexts, clock, devices, software MMU
//! OWNERS: @kernel-hal-team
//! PUBLIC API: Machine (context_*, device_*, wait_int, mmu_*, halt), console
//! DEPENDS_ON: hal contract types
//! INVARIANTS: Exactly one context runs at a time; simulated time only
//!             advances in wait_int (or the explicit test hook); interrupt
//!             delivery happens only at machine call boundaries while the
//!             PSR interrupt bit is set

use std::cmp::Reverse;
use std::collections::{BinaryHeap, VecDeque};
use std::io::Write as _;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use super::{
    term_status_word, Device, DeviceError, DeviceRequest, DiskReply, DiskRequest, MmuAccess,
    MmuCause, MmuError, MmuProt, Psr, CLOCK_MS, DEV_BUSY, DEV_ERROR, DEV_READY, DISK_SECTOR_SIZE,
    DISK_TRACK_SIZE, DISK_UNITS, MMU_MAX_TAGS, MMU_PAGE_SIZE, NUM_INTS, TERM_UNITS,
};

/// Microseconds per clock tick.
pub const TICK_US: u64 = CLOCK_MS * 1000;
/// Simulated cost of one PSR write or clock read. Gives CPU-bound code a
/// notion of elapsing time so the timeslice can expire under busy loops.
const CPU_STEP_US: u64 = 1;
/// Simulated latency of one disk operation.
const DISK_OP_US: u64 = 100;
/// Simulated terminal character period (both directions).
const TERM_PERIOD_US: u64 = 5_000;
/// Host stack floor for context threads.
const CONTEXT_STACK_FLOOR: usize = 256 * 1024;

/// Identifier of a machine context.
pub type CtxId = usize;

/// An installed interrupt handler. Handlers receive the device class and a
/// unit number (the region offset for the MMU).
pub type IntHandler = Arc<dyn Fn(Device, i32) + Send + Sync>;

/// Writes a line to the simulator console.
pub fn console(args: core::fmt::Arguments<'_>) {
    let stderr = std::io::stderr();
    let mut out = stderr.lock();
    let _ = out.write_fmt(args);
}

/// Build-time machine description.
#[derive(Clone, Debug)]
pub struct MachineConfig {
    /// Tracks per disk unit; the vector length fixes the unit count
    /// (at most [`DISK_UNITS`]).
    pub disk_tracks: Vec<usize>,
    /// Seeded terminal input per unit (at most [`TERM_UNITS`] units).
    pub term_input: Vec<Vec<u8>>,
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self { disk_tracks: vec![32; DISK_UNITS], term_input: vec![Vec::new(); TERM_UNITS] }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
enum EventKind {
    DiskDone { unit: usize },
    TermTick { unit: usize },
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
struct Event {
    at: u64,
    seq: u64,
    kind: EventKind,
}

impl Ord for Event {
    fn cmp(&self, other: &Self) -> core::cmp::Ordering {
        (self.at, self.seq, self.kind).cmp(&(other.at, other.seq, other.kind))
    }
}

impl PartialOrd for Event {
    fn partial_cmp(&self, other: &Self) -> Option<core::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

struct Context {
    psr: Psr,
}

struct Disk {
    tracks: usize,
    storage: Vec<u8>,
    current_track: usize,
    busy: bool,
    status: i32,
    in_flight: Option<DiskRequest>,
    reply: Option<DiskReply>,
}

struct Term {
    input: VecDeque<u8>,
    output: Vec<u8>,
    recv_int: bool,
    xmit_int: bool,
    rx_char: Option<u8>,
    tx_pending: Option<u8>,
    tick_scheduled: bool,
}

struct Mmu {
    pages: usize,
    frames: usize,
    max_maps: usize,
    map_count: usize,
    tag: usize,
    maps: Vec<Vec<Option<(usize, MmuProt)>>>,
    mem: Vec<u8>,
    access: Vec<MmuAccess>,
    cause: MmuCause,
}

struct State {
    now: u64,
    next_tick: u64,
    seq: u64,
    events: BinaryHeap<Reverse<Event>>,
    pending_ints: VecDeque<(Device, i32)>,
    psr: Psr,
    contexts: Vec<Context>,
    current: Option<CtxId>,
    halted: Option<i32>,
    disks: Vec<Disk>,
    terms: Vec<Term>,
    mmu: Option<Mmu>,
}

/// The simulated machine. One instance backs one kernel boot.
pub struct Machine {
    state: Mutex<State>,
    switch_cv: Condvar,
    halt_cv: Condvar,
    handlers: spin::RwLock<[Option<IntHandler>; NUM_INTS]>,
}

impl Machine {
    pub fn new(config: MachineConfig) -> Arc<Self> {
        let disks = config
            .disk_tracks
            .iter()
            .take(DISK_UNITS)
            .map(|&tracks| Disk {
                tracks,
                storage: vec![0; tracks * DISK_TRACK_SIZE * DISK_SECTOR_SIZE],
                current_track: 0,
                busy: false,
                status: DEV_READY,
                in_flight: None,
                reply: None,
            })
            .collect();
        let mut terms: Vec<Term> = config
            .term_input
            .into_iter()
            .take(TERM_UNITS)
            .map(|input| Term {
                input: input.into(),
                output: Vec::new(),
                recv_int: false,
                xmit_int: false,
                rx_char: None,
                tx_pending: None,
                tick_scheduled: false,
            })
            .collect();
        while terms.len() < TERM_UNITS {
            terms.push(Term {
                input: VecDeque::new(),
                output: Vec::new(),
                recv_int: false,
                xmit_int: false,
                rx_char: None,
                tx_pending: None,
                tick_scheduled: false,
            });
        }
        Arc::new(Self {
            state: Mutex::new(State {
                now: 0,
                next_tick: TICK_US,
                seq: 0,
                events: BinaryHeap::new(),
                pending_ints: VecDeque::new(),
                psr: Psr::CUR_MODE,
                contexts: Vec::new(),
                current: None,
                halted: None,
                disks,
                terms,
                mmu: None,
            }),
            switch_cv: Condvar::new(),
            halt_cv: Condvar::new(),
            handlers: spin::RwLock::new([None, None, None, None, None, None]),
        })
    }

    fn st(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Installs the handler for one interrupt-vector entry.
    pub fn set_int_handler(&self, dev: Device, handler: IntHandler) {
        self.handlers.write()[dev.index()] = Some(handler);
    }

    // ——— PSR ———

    pub fn psr_get(&self) -> Psr {
        self.st().psr
    }

    pub fn psr_set(self: &Arc<Self>, psr: Psr) {
        {
            let mut st = self.st();
            st.now += CPU_STEP_US;
            st.psr = psr;
            collect_due(&mut st);
        }
        self.deliver_pending();
    }

    pub fn interrupts_enabled(&self) -> bool {
        self.st().psr.contains(Psr::CUR_INT)
    }

    pub fn halted(&self) -> bool {
        self.st().halted.is_some()
    }

    // ——— Contexts ———

    /// Registers a machine context backed by a host thread. The context does
    /// not run until the first `context_switch` to it.
    pub fn context_init(
        self: &Arc<Self>,
        psr: Psr,
        stack_size: usize,
        entry: Box<dyn FnOnce() + Send>,
    ) -> CtxId {
        let id = {
            let mut st = self.st();
            st.contexts.push(Context { psr });
            st.contexts.len() - 1
        };
        let machine = Arc::clone(self);
        let builder = std::thread::Builder::new()
            .name(format!("ctx-{id}"))
            .stack_size(stack_size.max(CONTEXT_STACK_FLOOR));
        let spawned = builder.spawn(move || {
            IS_CONTEXT.with(|flag| flag.set(true));
            {
                let mut st = machine.st();
                while st.current != Some(id) && st.halted.is_none() {
                    st = machine
                        .switch_cv
                        .wait(st)
                        .unwrap_or_else(PoisonError::into_inner);
                }
                if st.halted.is_some() {
                    drop(st);
                    park_forever();
                }
            }
            entry();
            // The kernel retires contexts through quit(); falling off the
            // entry means the context is dead either way.
            park_forever();
        });
        if spawned.is_err() {
            console(format_args!("machine: context thread spawn failed\n"));
            self.halt(1);
        }
        id
    }

    /// Suspends `old` (if any) and resumes `new`. The caller's saved PSR is
    /// restored when it is eventually switched back in.
    pub fn context_switch(&self, old: Option<CtxId>, new: CtxId) {
        let mut st = self.st();
        if st.halted.is_some() {
            drop(st);
            retire_thread();
        }
        let psr = st.psr;
        if let Some(o) = old {
            st.contexts[o].psr = psr;
        }
        st.psr = st.contexts[new].psr;
        st.current = Some(new);
        self.switch_cv.notify_all();
        if let Some(o) = old {
            while st.current != Some(o) && st.halted.is_none() {
                st = self
                    .switch_cv
                    .wait(st)
                    .unwrap_or_else(PoisonError::into_inner);
            }
            if st.halted.is_some() {
                drop(st);
                retire_thread();
            }
        }
    }

    /// Stops the simulation with `code`. Parks the calling machine context;
    /// on a host (non-context) thread this panics instead so a fatal error
    /// during bring-up fails loudly rather than hanging the harness.
    pub fn halt(&self, code: i32) -> ! {
        {
            let mut st = self.st();
            if st.halted.is_none() {
                st.halted = Some(code);
            }
            self.halt_cv.notify_all();
            self.switch_cv.notify_all();
        }
        if IS_CONTEXT.with(|flag| flag.get()) {
            park_forever();
        }
        panic!("machine halted ({code}) on a host thread")
    }

    /// Blocks the calling (non-context) thread until the machine halts.
    /// Panics if the deadline passes first; a hung simulation is a test bug.
    pub fn wait_halt(&self, deadline: Duration) -> i32 {
        let start = Instant::now();
        let mut st = self.st();
        loop {
            if let Some(code) = st.halted {
                return code;
            }
            let elapsed = start.elapsed();
            if elapsed >= deadline {
                panic!("machine did not halt within {deadline:?}");
            }
            let (guard, _timeout) = self
                .halt_cv
                .wait_timeout(st, deadline - elapsed)
                .unwrap_or_else(PoisonError::into_inner);
            st = guard;
        }
    }

    // ——— Clock ———

    /// Microseconds since boot. Reading the clock costs one CPU step.
    pub fn sys_clock(&self) -> u64 {
        let mut st = self.st();
        st.now += CPU_STEP_US;
        collect_due(&mut st);
        st.now
    }

    /// Advances simulated time without waiting for events. Test support.
    pub fn debug_advance_clock(&self, us: u64) {
        let mut st = self.st();
        st.now += us;
        collect_due(&mut st);
    }

    /// Waits for the next interrupt: advances simulated time to the next
    /// pending event (clock tick, device completion) and delivers it.
    pub fn wait_int(self: &Arc<Self>) {
        {
            let mut st = self.st();
            if st.halted.is_some() {
                drop(st);
                park_forever();
            }
            collect_due(&mut st);
            if st.pending_ints.is_empty() {
                let next_event_at = st.events.peek().map(|Reverse(ev)| ev.at);
                let target = match next_event_at {
                    Some(at) if at < st.next_tick => at,
                    _ => st.next_tick,
                };
                if st.now < target {
                    st.now = target;
                }
                collect_due(&mut st);
            }
        }
        self.deliver_pending();
    }

    fn schedule(st: &mut State, delay: u64, kind: EventKind) {
        let at = st.now + delay;
        st.seq += 1;
        let seq = st.seq;
        st.events.push(Reverse(Event { at, seq, kind }));
    }

    /// Delivers queued interrupts while the PSR interrupt bit allows.
    fn deliver_pending(self: &Arc<Self>) {
        loop {
            let work = {
                let mut st = self.st();
                if st.halted.is_some() || !st.psr.contains(Psr::CUR_INT) {
                    None
                } else {
                    st.pending_ints.pop_front().map(|(dev, unit)| {
                        mask_for_interrupt(&mut st);
                        (dev, unit)
                    })
                }
            };
            match work {
                Some((dev, unit)) => {
                    self.run_vectored(dev, unit);
                    let mut st = self.st();
                    unmask_after_interrupt(&mut st);
                }
                None => break,
            }
        }
    }

    fn run_vectored(self: &Arc<Self>, dev: Device, unit: i32) {
        let handler = self.handlers.read()[dev.index()].clone();
        match handler {
            Some(handler) => handler(dev, unit),
            None => {
                console(format_args!("machine: unvectored interrupt {dev:?} unit {unit}\n"));
                self.halt(1);
            }
        }
    }

    // ——— Devices ———

    /// Reads a device status register.
    pub fn device_input(&self, dev: Device, unit: usize) -> Result<i32, DeviceError> {
        let mut st = self.st();
        match dev {
            Device::Clock => {
                if unit != 0 {
                    return Err(DeviceError::Invalid);
                }
                Ok(st.now as i32)
            }
            Device::Disk => {
                let disk = st.disks.get(unit).ok_or(DeviceError::Invalid)?;
                Ok(if disk.busy { DEV_BUSY } else { disk.status })
            }
            Device::Term => {
                let term = st.terms.get_mut(unit).ok_or(DeviceError::Invalid)?;
                let rx = if term.rx_char.is_some() { DEV_BUSY } else { DEV_READY };
                let tx = if term.tx_pending.is_some() { DEV_BUSY } else { DEV_READY };
                let ch = term.rx_char.take().unwrap_or(0);
                Ok(term_status_word(rx, tx, ch))
            }
            _ => Err(DeviceError::Invalid),
        }
    }

    /// Issues a device request. Completion raises the device's interrupt.
    pub fn device_output(
        self: &Arc<Self>,
        dev: Device,
        unit: usize,
        request: DeviceRequest,
    ) -> Result<(), DeviceError> {
        {
            let mut st = self.st();
            match (dev, request) {
                (Device::Disk, DeviceRequest::Disk(req)) => {
                    let disk = st.disks.get(unit).ok_or(DeviceError::Invalid)?;
                    if disk.busy {
                        return Err(DeviceError::Busy);
                    }
                    match &req {
                        DiskRequest::Read { sector } | DiskRequest::Write { sector, .. } => {
                            if *sector >= DISK_TRACK_SIZE {
                                return Err(DeviceError::Invalid);
                            }
                        }
                        DiskRequest::Seek { .. } | DiskRequest::Tracks => {}
                    }
                    let disk = &mut st.disks[unit];
                    disk.busy = true;
                    disk.in_flight = Some(req);
                    Self::schedule(&mut st, DISK_OP_US, EventKind::DiskDone { unit });
                }
                (Device::Term, DeviceRequest::Term(ctrl)) => {
                    let term = st.terms.get_mut(unit).ok_or(DeviceError::Invalid)?;
                    term.recv_int = ctrl.recv_int;
                    term.xmit_int = ctrl.xmit_int;
                    if ctrl.send_char {
                        if term.tx_pending.is_some() {
                            return Err(DeviceError::Busy);
                        }
                        term.tx_pending = Some(ctrl.ch);
                    }
                    let wants_tick = term.recv_int || term.xmit_int || term.tx_pending.is_some();
                    if wants_tick && !term.tick_scheduled {
                        st.terms[unit].tick_scheduled = true;
                        Self::schedule(&mut st, TERM_PERIOD_US, EventKind::TermTick { unit });
                    }
                }
                _ => return Err(DeviceError::Invalid),
            }
        }
        self.deliver_pending();
        Ok(())
    }

    /// Takes the data produced by the last completed disk operation.
    pub fn disk_take_reply(&self, unit: usize) -> Option<DiskReply> {
        self.st().disks.get_mut(unit).and_then(|d| d.reply.take())
    }

    /// Terminal output captured so far (test inspection).
    pub fn term_output(&self, unit: usize) -> Vec<u8> {
        self.st().terms.get(unit).map(|t| t.output.clone()).unwrap_or_default()
    }

    // ——— MMU ———

    pub fn mmu_init(&self, maps: usize, pages: usize, frames: usize) -> Result<(), MmuError> {
        let mut st = self.st();
        if st.mmu.is_some() {
            return Err(MmuError::NotReady);
        }
        if maps == 0 || pages == 0 || frames == 0 {
            return Err(MmuError::OutOfRange);
        }
        st.mmu = Some(Mmu {
            pages,
            frames,
            max_maps: maps,
            map_count: 0,
            tag: 0,
            maps: vec![vec![None; pages]; MMU_MAX_TAGS],
            mem: vec![0; frames * MMU_PAGE_SIZE],
            access: vec![MmuAccess::default(); frames],
            cause: MmuCause::None,
        });
        Ok(())
    }

    pub fn mmu_done(&self) -> Result<(), MmuError> {
        let mut st = self.st();
        if st.mmu.take().is_none() {
            return Err(MmuError::NotReady);
        }
        Ok(())
    }

    /// Page count of the MMU region, if the MMU is initialized.
    pub fn mmu_region_pages(&self) -> Option<usize> {
        self.st().mmu.as_ref().map(|m| m.pages)
    }

    pub fn mmu_page_size(&self) -> usize {
        MMU_PAGE_SIZE
    }

    pub fn mmu_set_tag(&self, tag: usize) -> Result<(), MmuError> {
        let mut st = self.st();
        let mmu = st.mmu.as_mut().ok_or(MmuError::NotReady)?;
        if tag >= MMU_MAX_TAGS {
            return Err(MmuError::OutOfRange);
        }
        mmu.tag = tag;
        Ok(())
    }

    pub fn mmu_map(
        &self,
        tag: usize,
        page: usize,
        frame: usize,
        prot: MmuProt,
    ) -> Result<(), MmuError> {
        let mut st = self.st();
        let mmu = st.mmu.as_mut().ok_or(MmuError::NotReady)?;
        if tag >= MMU_MAX_TAGS || page >= mmu.pages || frame >= mmu.frames {
            return Err(MmuError::OutOfRange);
        }
        if mmu.maps[tag][page].is_some() || mmu.map_count == mmu.max_maps {
            return Err(MmuError::MapUnavailable);
        }
        mmu.maps[tag][page] = Some((frame, prot));
        mmu.map_count += 1;
        Ok(())
    }

    pub fn mmu_unmap(&self, tag: usize, page: usize) -> Result<(), MmuError> {
        let mut st = self.st();
        let mmu = st.mmu.as_mut().ok_or(MmuError::NotReady)?;
        if tag >= MMU_MAX_TAGS || page >= mmu.pages {
            return Err(MmuError::OutOfRange);
        }
        if mmu.maps[tag][page].take().is_none() {
            return Err(MmuError::NoMapping);
        }
        mmu.map_count -= 1;
        Ok(())
    }

    pub fn mmu_get_map(&self, tag: usize, page: usize) -> Result<(usize, MmuProt), MmuError> {
        let st = self.st();
        let mmu = st.mmu.as_ref().ok_or(MmuError::NotReady)?;
        if tag >= MMU_MAX_TAGS || page >= mmu.pages {
            return Err(MmuError::OutOfRange);
        }
        mmu.maps[tag][page].ok_or(MmuError::NoMapping)
    }

    pub fn mmu_get_cause(&self) -> MmuCause {
        self.st().mmu.as_ref().map(|m| m.cause).unwrap_or(MmuCause::None)
    }

    pub fn mmu_get_access(&self, frame: usize) -> Result<MmuAccess, MmuError> {
        let st = self.st();
        let mmu = st.mmu.as_ref().ok_or(MmuError::NotReady)?;
        mmu.access.get(frame).copied().ok_or(MmuError::OutOfRange)
    }

    pub fn mmu_set_access(&self, frame: usize, access: MmuAccess) -> Result<(), MmuError> {
        let mut st = self.st();
        let mmu = st.mmu.as_mut().ok_or(MmuError::NotReady)?;
        let slot = mmu.access.get_mut(frame).ok_or(MmuError::OutOfRange)?;
        *slot = access;
        Ok(())
    }

    /// Reads bytes from the VM region, faulting unmapped pages in.
    pub fn mmu_read(self: &Arc<Self>, offset: usize, buf: &mut [u8]) {
        self.mmu_access(offset, buf.len(), false, |mem, range, cursor| {
            buf[cursor..cursor + range.len()].copy_from_slice(&mem[range]);
        });
    }

    /// Writes bytes into the VM region, faulting unmapped pages in.
    pub fn mmu_write(self: &Arc<Self>, offset: usize, data: &[u8]) {
        self.mmu_access(offset, data.len(), true, |mem, range, cursor| {
            mem[range.clone()].copy_from_slice(&data[cursor..cursor + range.len()]);
        });
    }

    fn mmu_access(
        self: &Arc<Self>,
        offset: usize,
        len: usize,
        write: bool,
        mut copy: impl FnMut(&mut [u8], core::ops::Range<usize>, usize),
    ) {
        enum Step {
            Hit,
            Miss,
            Offline,
            OutOfRange,
        }
        let mut cursor = 0;
        while cursor < len {
            let at = offset + cursor;
            let page = at / MMU_PAGE_SIZE;
            let in_page = at % MMU_PAGE_SIZE;
            let chunk = (MMU_PAGE_SIZE - in_page).min(len - cursor);
            let mut faulted = false;
            loop {
                let step = {
                    let mut st = self.st();
                    match st.mmu.as_mut() {
                        None => Step::Offline,
                        Some(mmu) if page >= mmu.pages => Step::OutOfRange,
                        Some(mmu) => {
                            let tag = mmu.tag;
                            match mmu.maps[tag][page] {
                                Some((_, prot)) if write && prot != MmuProt::Rw => {
                                    mmu.cause = MmuCause::Access;
                                    Step::Miss
                                }
                                Some((frame, _)) => {
                                    let base = frame * MMU_PAGE_SIZE + in_page;
                                    let bits = &mut mmu.access[frame];
                                    bits.referenced = true;
                                    if write {
                                        bits.dirty = true;
                                    }
                                    copy(&mut mmu.mem, base..base + chunk, cursor);
                                    Step::Hit
                                }
                                None => {
                                    mmu.cause = MmuCause::Fault;
                                    Step::Miss
                                }
                            }
                        }
                    }
                };
                match step {
                    Step::Hit => break,
                    Step::Offline => {
                        console(format_args!("machine: region access with MMU offline\n"));
                        self.halt(1);
                    }
                    Step::OutOfRange => {
                        console(format_args!("machine: region access beyond page {page}\n"));
                        self.halt(1);
                    }
                    Step::Miss if faulted => {
                        console(format_args!(
                            "machine: unresolved MMU fault at offset {at:#x}\n"
                        ));
                        self.halt(1);
                    }
                    Step::Miss => {
                        faulted = true;
                        self.trap_mmu(at as i32);
                    }
                }
            }
            cursor += chunk;
        }
    }

    /// Raises the MMU interrupt synchronously in the calling context.
    fn trap_mmu(self: &Arc<Self>, offset: i32) {
        {
            let mut st = self.st();
            mask_for_interrupt(&mut st);
        }
        self.run_vectored(Device::Mmu, offset);
        let mut st = self.st();
        unmask_after_interrupt(&mut st);
    }

    /// Copies a physical frame out of memory (frames live at
    /// `frame * page_size`).
    pub fn frame_read(&self, frame: usize, buf: &mut [u8]) -> Result<(), MmuError> {
        let st = self.st();
        let mmu = st.mmu.as_ref().ok_or(MmuError::NotReady)?;
        if frame >= mmu.frames || buf.len() > MMU_PAGE_SIZE {
            return Err(MmuError::OutOfRange);
        }
        let base = frame * MMU_PAGE_SIZE;
        buf.copy_from_slice(&mmu.mem[base..base + buf.len()]);
        Ok(())
    }

    /// Copies bytes into a physical frame.
    pub fn frame_write(&self, frame: usize, data: &[u8]) -> Result<(), MmuError> {
        let mut st = self.st();
        let mmu = st.mmu.as_mut().ok_or(MmuError::NotReady)?;
        if frame >= mmu.frames || data.len() > MMU_PAGE_SIZE {
            return Err(MmuError::OutOfRange);
        }
        let base = frame * MMU_PAGE_SIZE;
        mmu.mem[base..base + data.len()].copy_from_slice(data);
        Ok(())
    }
}

/// Moves every tick and device completion whose time has come onto the
/// pending-interrupt queue.
fn collect_due(st: &mut State) {
    while st.next_tick <= st.now {
        st.pending_ints.push_back((Device::Clock, 0));
        st.next_tick += TICK_US;
    }
    while st
        .events
        .peek()
        .map(|Reverse(ev)| ev.at <= st.now)
        .unwrap_or(false)
    {
        if let Some(Reverse(ev)) = st.events.pop() {
            fire_event(st, ev.kind);
        }
    }
}

/// Interrupt entry: current mode/int copy into previous, current clears
/// (mode stays kernel for the handler).
fn mask_for_interrupt(st: &mut State) {
    let saved = st.psr;
    let mut masked = Psr::CUR_MODE;
    if saved.contains(Psr::CUR_MODE) {
        masked |= Psr::PREV_MODE;
    }
    if saved.contains(Psr::CUR_INT) {
        masked |= Psr::PREV_INT;
    }
    st.psr = masked;
}

/// Interrupt return: previous mode/int restore into current.
fn unmask_after_interrupt(st: &mut State) {
    let saved = st.psr;
    let mut restored = Psr::empty();
    if saved.contains(Psr::PREV_MODE) {
        restored |= Psr::CUR_MODE;
    }
    if saved.contains(Psr::PREV_INT) {
        restored |= Psr::CUR_INT;
    }
    st.psr = restored;
}

fn fire_event(st: &mut State, kind: EventKind) {
    match kind {
        EventKind::DiskDone { unit } => {
            let disk = &mut st.disks[unit];
            disk.busy = false;
            disk.status = DEV_READY;
            match disk.in_flight.take() {
                Some(DiskRequest::Seek { track }) => {
                    if track < disk.tracks {
                        disk.current_track = track;
                        disk.reply = Some(DiskReply::Done);
                    } else {
                        disk.status = DEV_ERROR;
                    }
                }
                Some(DiskRequest::Read { sector }) => {
                    let base =
                        (disk.current_track * DISK_TRACK_SIZE + sector) * DISK_SECTOR_SIZE;
                    let data = disk.storage[base..base + DISK_SECTOR_SIZE].to_vec();
                    disk.reply = Some(DiskReply::Sector(data.into_boxed_slice()));
                }
                Some(DiskRequest::Write { sector, data }) => {
                    let base =
                        (disk.current_track * DISK_TRACK_SIZE + sector) * DISK_SECTOR_SIZE;
                    let len = data.len().min(DISK_SECTOR_SIZE);
                    disk.storage[base..base + len].copy_from_slice(&data[..len]);
                    disk.reply = Some(DiskReply::Done);
                }
                Some(DiskRequest::Tracks) => {
                    disk.reply = Some(DiskReply::Tracks(disk.tracks));
                }
                None => {}
            }
            st.pending_ints.push_back((Device::Disk, unit as i32));
        }
        EventKind::TermTick { unit } => {
            let term = &mut st.terms[unit];
            if let Some(ch) = term.tx_pending.take() {
                term.output.push(ch);
            }
            if term.recv_int && term.rx_char.is_none() {
                term.rx_char = term.input.pop_front();
            }
            let keep_ticking = term.recv_int || term.xmit_int || term.tx_pending.is_some();
            term.tick_scheduled = keep_ticking;
            if term.recv_int || term.xmit_int {
                st.pending_ints.push_back((Device::Term, unit as i32));
            }
            if keep_ticking {
                st.seq += 1;
                let seq = st.seq;
                let at = st.now + TERM_PERIOD_US;
                st.events.push(Reverse(Event { at, seq, kind: EventKind::TermTick { unit } }));
            }
        }
    }
}

fn park_forever() -> ! {
    loop {
        std::thread::park();
    }
}

/// Ends the calling thread after a halt: contexts park, host threads panic
/// so a hung bring-up fails loudly.
fn retire_thread() -> ! {
    if IS_CONTEXT.with(|flag| flag.get()) {
        park_forever();
    }
    panic!("machine halted while a host thread was switching contexts")
}

std::thread_local! {
    static IS_CONTEXT: core::cell::Cell<bool> = const { core::cell::Cell::new(false) };
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn clock_interrupt_fires_on_wait_int() {
        let machine = Machine::new(MachineConfig::default());
        let hits = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&hits);
        machine.set_int_handler(
            Device::Clock,
            Arc::new(move |dev, _unit| {
                assert_eq!(dev, Device::Clock);
                seen.fetch_add(1, Ordering::SeqCst);
            }),
        );
        machine.psr_set(Psr::CUR_MODE | Psr::CUR_INT);
        machine.wait_int();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        let now = machine.sys_clock();
        assert!((TICK_US..2 * TICK_US).contains(&now));
        machine.wait_int();
        assert_eq!(hits.load(Ordering::SeqCst), 2);
        assert!(machine.sys_clock() >= 2 * TICK_US);
    }

    #[test]
    fn masked_interrupts_defer_until_enable() {
        let machine = Machine::new(MachineConfig::default());
        let hits = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&hits);
        machine.set_int_handler(
            Device::Disk,
            Arc::new(move |_, _| {
                seen.fetch_add(1, Ordering::SeqCst);
            }),
        );
        machine.psr_set(Psr::CUR_MODE | Psr::CUR_INT);
        machine
            .device_output(Device::Disk, 0, DeviceRequest::Disk(DiskRequest::Tracks))
            .unwrap();
        // Mask, let the completion land, and confirm delivery waits.
        machine.psr_set(Psr::CUR_MODE);
        machine.debug_advance_clock(DISK_OP_US);
        {
            let mut st = machine.st();
            if let Some(Reverse(ev)) = st.events.pop() {
                fire_event(&mut st, ev.kind);
            }
        }
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        machine.psr_set(Psr::CUR_MODE | Psr::CUR_INT);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(matches!(machine.disk_take_reply(0), Some(DiskReply::Tracks(32))));
    }

    #[test]
    fn disk_round_trip_preserves_sector_bytes() {
        let machine = Machine::new(MachineConfig::default());
        machine.set_int_handler(Device::Disk, Arc::new(|_, _| {}));
        machine.psr_set(Psr::CUR_MODE | Psr::CUR_INT);
        let payload = vec![0xabu8; DISK_SECTOR_SIZE].into_boxed_slice();
        machine
            .device_output(
                Device::Disk,
                0,
                DeviceRequest::Disk(DiskRequest::Write { sector: 3, data: payload.clone() }),
            )
            .unwrap();
        machine.wait_int();
        assert!(matches!(machine.disk_take_reply(0), Some(DiskReply::Done)));
        machine
            .device_output(Device::Disk, 0, DeviceRequest::Disk(DiskRequest::Read { sector: 3 }))
            .unwrap();
        machine.wait_int();
        match machine.disk_take_reply(0) {
            Some(DiskReply::Sector(data)) => assert_eq!(data, payload),
            other => panic!("unexpected reply {other:?}"),
        }
    }

    #[test]
    fn context_handoff_runs_exactly_one_side() {
        let machine = Machine::new(MachineConfig::default());
        let m1 = Arc::clone(&machine);
        let first = machine.context_init(
            Psr::CUR_MODE,
            MIN_STACK_TEST,
            Box::new(move || {
                // Runs once we are switched in, then hands the machine back.
                m1.halt(42);
            }),
        );
        machine.context_switch(None, first);
        assert_eq!(machine.wait_halt(Duration::from_secs(10)), 42);
    }

    const MIN_STACK_TEST: usize = 16 * 1024;

    #[test]
    fn mmu_fault_handler_resolves_access() {
        let machine = Machine::new(MachineConfig::default());
        machine.mmu_init(4, 4, 2).unwrap();
        let m = Arc::clone(&machine);
        let faults = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&faults);
        machine.set_int_handler(
            Device::Mmu,
            Arc::new(move |_, offset| {
                seen.fetch_add(1, Ordering::SeqCst);
                let page = offset as usize / MMU_PAGE_SIZE;
                m.mmu_map(0, page, page % 2, MmuProt::Rw).unwrap();
            }),
        );
        machine.mmu_write(10, &[1, 2, 3]);
        let mut back = [0u8; 3];
        machine.mmu_read(10, &mut back);
        assert_eq!(back, [1, 2, 3]);
        assert_eq!(faults.load(Ordering::SeqCst), 1);
        let access = machine.mmu_get_access(0).unwrap();
        assert!(access.referenced && access.dirty);
    }

    #[test]
    fn frame_accessors_reach_physical_memory() {
        let machine = Machine::new(MachineConfig::default());
        machine.mmu_init(4, 2, 2).unwrap();
        machine.frame_write(1, &[9u8; 16]).unwrap();
        let mut buf = [0u8; 16];
        machine.frame_read(1, &mut buf).unwrap();
        assert_eq!(buf, [9u8; 16]);
    }
}
