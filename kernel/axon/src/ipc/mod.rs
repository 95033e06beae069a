// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Slot-based mailboxes: fixed slot pool, rendezvous, release
//! OWNERS: @kernel-ipc-team
//! PUBLIC API: mbox_create/send/receive, conditional variants, mbox_release,
//!             wait_device; MailboxTable (pure state machine)
//! DEPENDS_ON: proc blocking primitives, types tunables
//! INVARIANTS: slots_in_use equals the sum of queued slots across live
//!             boxes; waiter queues are FIFO and single-polarity; wake
//!             outcomes are recorded before the waiter is made ready

use std::collections::VecDeque;
use std::sync::Arc;

use crate::kernel::Kernel;
use crate::proc::Zapped;
use crate::types::{BoxId, Pid, BLOCKED_RECV, BLOCKED_SEND, MAX_MBOX, MAX_MESSAGE, MAX_PROC, MAX_SLOTS};

mod tests_prop;

/// Errors surfaced by mailbox operations.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum IpcError {
    /// No mailbox with that id.
    BadBox,
    /// Message longer than the box's slot size (or an oversize receive
    /// buffer).
    MsgSize,
    /// Stored message does not fit the receive buffer, or an invalid slot
    /// size at create.
    SlotSize,
    /// Mailbox id space exhausted.
    NoIds,
    /// Mailbox table full.
    NoBox,
    /// Global slot pool exhausted.
    NoSlots,
    /// Conditional operation would have blocked.
    WouldBlock,
    /// The mailbox was released while the caller was blocked on it.
    BoxReleased,
    /// The caller was zapped while blocked.
    Zapped,
}

/// Result recorded for a waiter before it is woken.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WakeOutcome {
    /// A blocked sender's message was consumed.
    Sent,
    /// A blocked receiver was handed these bytes.
    Delivered(Vec<u8>),
    /// The mailbox went away.
    Released,
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum WaiterKind {
    Sender { data: Vec<u8> },
    Receiver { max_len: usize },
}

#[derive(Clone, Debug, PartialEq, Eq)]
struct Waiter {
    pid: Pid,
    kind: WaiterKind,
}

#[derive(Debug)]
struct Mailbox {
    id: BoxId,
    max_slots: usize,
    slot_size: usize,
    slots: VecDeque<Vec<u8>>,
    queue: VecDeque<Waiter>,
}

/// Outcome of a non-erroring send attempt.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum SendStep {
    /// Message stored in a slot (or nothing further to do).
    Done,
    /// A blocked receiver was satisfied; wake it.
    Wake(Pid),
    /// The caller was enqueued as a sender and must block.
    MustBlock,
}

/// Outcome of a non-erroring receive attempt.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum RecvStep {
    /// Bytes are available now; optionally a blocked sender to wake.
    Data { bytes: Vec<u8>, wake: Option<Pid> },
    /// The caller was enqueued as a receiver and must block.
    MustBlock,
}

/// The mailbox table: box array, global slot pool accounting, and the
/// per-process wake-outcome cells. Pure state machine; blocking is layered
/// on top by the kernel operations below.
pub struct MailboxTable {
    boxes: Vec<Option<Mailbox>>,
    next_id: i32,
    boxes_in_use: usize,
    slots_in_use: usize,
    outcomes: Vec<Option<WakeOutcome>>,
}

impl MailboxTable {
    pub fn new() -> Self {
        Self {
            boxes: (0..MAX_MBOX).map(|_| None).collect(),
            next_id: 0,
            boxes_in_use: 0,
            slots_in_use: 0,
            outcomes: (0..MAX_PROC).map(|_| None).collect(),
        }
    }

    fn next_free_id(&mut self) -> Result<BoxId, IpcError> {
        let start = self.next_id;
        let mut candidate = start;
        loop {
            let collides = self
                .boxes
                .iter()
                .flatten()
                .any(|b| b.id.raw() == candidate);
            if !collides {
                self.next_id = if candidate == i32::MAX { 0 } else { candidate + 1 };
                return Ok(BoxId::from_raw(candidate));
            }
            candidate = if candidate == i32::MAX { 0 } else { candidate + 1 };
            if candidate == start {
                return Err(IpcError::NoIds);
            }
        }
    }

    fn index_of(&self, id: BoxId) -> Result<usize, IpcError> {
        self.boxes
            .iter()
            .position(|slot| slot.as_ref().map(|b| b.id == id).unwrap_or(false))
            .ok_or(IpcError::BadBox)
    }

    /// Creates a mailbox. Zero slots makes a rendezvous box.
    pub fn create(&mut self, num_slots: i32, slot_size: i32) -> Result<BoxId, IpcError> {
        let id = self.next_free_id()?;
        if self.boxes_in_use == MAX_MBOX {
            return Err(IpcError::NoBox);
        }
        if slot_size < 0 || slot_size as usize > MAX_MESSAGE || num_slots < 0 {
            return Err(IpcError::SlotSize);
        }
        let at = self
            .boxes
            .iter()
            .position(Option::is_none)
            .ok_or(IpcError::NoBox)?;
        self.boxes[at] = Some(Mailbox {
            id,
            max_slots: num_slots as usize,
            slot_size: slot_size as usize,
            slots: VecDeque::new(),
            queue: VecDeque::new(),
        });
        self.boxes_in_use += 1;
        Ok(id)
    }

    /// One send attempt. With `block`, a would-block caller is enqueued as
    /// a sender; without, the conditional error is returned instead.
    pub(crate) fn try_send(
        &mut self,
        id: BoxId,
        pid: Option<Pid>,
        data: &[u8],
        block: bool,
    ) -> Result<SendStep, IpcError> {
        let at = self.index_of(id)?;
        let slots_in_use = self.slots_in_use;
        let Some(mbox) = self.boxes[at].as_mut() else {
            return Err(IpcError::BadBox);
        };
        if data.len() > mbox.slot_size {
            return Err(IpcError::MsgSize);
        }

        // A queued receiver is always served first; no slot is consumed.
        let front_is_receiver =
            matches!(mbox.queue.front(), Some(Waiter { kind: WaiterKind::Receiver { .. }, .. }));
        if front_is_receiver {
            let Some(Waiter { pid: peer, kind: WaiterKind::Receiver { max_len } }) =
                mbox.queue.pop_front()
            else {
                return Err(IpcError::BadBox);
            };
            let n = data.len().min(max_len);
            self.outcomes[peer.slot()] = Some(WakeOutcome::Delivered(data[..n].to_vec()));
            return Ok(SendStep::Wake(peer));
        }

        if mbox.max_slots == 0 {
            // Rendezvous with no peer (or only fellow senders) queued.
            if !block {
                return Err(IpcError::WouldBlock);
            }
            let pid = pid.ok_or(IpcError::WouldBlock)?;
            mbox.queue.push_back(Waiter { pid, kind: WaiterKind::Sender { data: data.to_vec() } });
            return Ok(SendStep::MustBlock);
        }

        if mbox.slots.len() == mbox.max_slots {
            if !block {
                return Err(IpcError::WouldBlock);
            }
            let pid = pid.ok_or(IpcError::WouldBlock)?;
            mbox.queue.push_back(Waiter { pid, kind: WaiterKind::Sender { data: data.to_vec() } });
            return Ok(SendStep::MustBlock);
        }

        if slots_in_use == MAX_SLOTS {
            return Err(IpcError::NoSlots);
        }
        mbox.slots.push_back(data.to_vec());
        self.slots_in_use += 1;
        Ok(SendStep::Done)
    }

    /// One receive attempt; symmetric with `try_send`.
    pub(crate) fn try_receive(
        &mut self,
        id: BoxId,
        pid: Option<Pid>,
        max_len: usize,
        block: bool,
    ) -> Result<RecvStep, IpcError> {
        let at = self.index_of(id)?;
        if max_len > MAX_MESSAGE {
            return Err(IpcError::MsgSize);
        }
        let Some(mbox) = self.boxes[at].as_mut() else {
            return Err(IpcError::BadBox);
        };

        if mbox.max_slots == 0 {
            let front_is_sender =
                matches!(mbox.queue.front(), Some(Waiter { kind: WaiterKind::Sender { .. }, .. }));
            if front_is_sender {
                let Some(Waiter { pid: peer, kind: WaiterKind::Sender { data } }) =
                    mbox.queue.pop_front()
                else {
                    return Err(IpcError::BadBox);
                };
                let n = data.len().min(max_len);
                self.outcomes[peer.slot()] = Some(WakeOutcome::Sent);
                return Ok(RecvStep::Data { bytes: data[..n].to_vec(), wake: Some(peer) });
            }
            if !block {
                return Err(IpcError::WouldBlock);
            }
            let pid = pid.ok_or(IpcError::WouldBlock)?;
            mbox.queue.push_back(Waiter { pid, kind: WaiterKind::Receiver { max_len } });
            return Ok(RecvStep::MustBlock);
        }

        if let Some(front) = mbox.slots.front() {
            if front.len() > max_len {
                return Err(IpcError::SlotSize);
            }
            let bytes = match mbox.slots.pop_front() {
                Some(bytes) => bytes,
                None => return Err(IpcError::BadBox),
            };
            self.slots_in_use -= 1;
            // The freed slot immediately absorbs the oldest blocked sender.
            let front_is_sender =
                matches!(mbox.queue.front(), Some(Waiter { kind: WaiterKind::Sender { .. }, .. }));
            let wake = if front_is_sender {
                match mbox.queue.pop_front() {
                    Some(Waiter { pid: peer, kind: WaiterKind::Sender { data } }) => {
                        mbox.slots.push_back(data);
                        self.slots_in_use += 1;
                        self.outcomes[peer.slot()] = Some(WakeOutcome::Sent);
                        Some(peer)
                    }
                    _ => None,
                }
            } else {
                None
            };
            return Ok(RecvStep::Data { bytes, wake });
        }

        if !block {
            return Err(IpcError::WouldBlock);
        }
        let pid = pid.ok_or(IpcError::WouldBlock)?;
        mbox.queue.push_back(Waiter { pid, kind: WaiterKind::Receiver { max_len } });
        Ok(RecvStep::MustBlock)
    }

    /// Removes the box, returns its slots to the pool, and records a
    /// `Released` outcome for every waiter. Returns the waiters in FIFO
    /// order so the caller can wake them.
    pub fn release(&mut self, id: BoxId) -> Result<Vec<Pid>, IpcError> {
        let at = self.index_of(id)?;
        let Some(mbox) = self.boxes[at].take() else {
            return Err(IpcError::BadBox);
        };
        self.boxes_in_use -= 1;
        self.slots_in_use -= mbox.slots.len();
        let mut woken = Vec::with_capacity(mbox.queue.len());
        for waiter in mbox.queue {
            self.outcomes[waiter.pid.slot()] = Some(WakeOutcome::Released);
            woken.push(waiter.pid);
        }
        Ok(woken)
    }

    /// Takes the wake outcome recorded for `pid`, if any.
    pub fn take_outcome(&mut self, pid: Pid) -> Option<WakeOutcome> {
        self.outcomes[pid.slot()].take()
    }

    /// Drops any waiter record `pid` still holds on `id` (a process woken
    /// by something other than the mailbox protocol).
    fn scrub_waiter(&mut self, id: BoxId, pid: Pid) {
        if let Ok(at) = self.index_of(id) {
            if let Some(mbox) = self.boxes[at].as_mut() {
                mbox.queue.retain(|w| w.pid != pid);
            }
        }
    }

    /// Whether any process is queued on `id` (used by the deadlock check).
    pub fn has_waiters(&self, id: BoxId) -> bool {
        self.index_of(id)
            .ok()
            .and_then(|at| self.boxes[at].as_ref())
            .map(|b| !b.queue.is_empty())
            .unwrap_or(false)
    }

    #[cfg(test)]
    pub(crate) fn assert_invariants(&self) {
        let queued: usize = self
            .boxes
            .iter()
            .flatten()
            .map(|b| b.slots.len())
            .sum();
        assert_eq!(queued, self.slots_in_use, "slot pool accounting mismatch");
        assert!(self.slots_in_use <= MAX_SLOTS);
        for mbox in self.boxes.iter().flatten() {
            assert!(mbox.slots.len() <= mbox.max_slots.max(0));
            for slot in &mbox.slots {
                assert!(slot.len() <= mbox.slot_size);
            }
            // Waiter queues stay single-polarity.
            let senders = mbox
                .queue
                .iter()
                .filter(|w| matches!(w.kind, WaiterKind::Sender { .. }))
                .count();
            assert!(senders == 0 || senders == mbox.queue.len(), "mixed waiter queue");
        }
    }
}

impl Default for MailboxTable {
    fn default() -> Self {
        Self::new()
    }
}

impl Kernel {
    /// Creates a mailbox with `num_slots` slots of `slot_size` bytes.
    pub fn mbox_create(&self, num_slots: i32, slot_size: i32) -> Result<BoxId, IpcError> {
        self.check_kernel_mode("mbox_create");
        self.with_ints_disabled(|| self.ipc.lock().create(num_slots, slot_size))
    }

    /// Sends `data`, blocking while the box is full (or no receiver has
    /// arrived at a rendezvous box).
    pub fn mbox_send(self: &Arc<Self>, id: BoxId, data: &[u8]) -> Result<(), IpcError> {
        self.check_kernel_mode("mbox_send");
        self.send_inner(id, data, true)
    }

    /// Non-blocking send: `WouldBlock` instead of waiting.
    pub fn mbox_cond_send(self: &Arc<Self>, id: BoxId, data: &[u8]) -> Result<(), IpcError> {
        self.check_kernel_mode("mbox_cond_send");
        self.send_inner(id, data, false)
    }

    fn send_inner(self: &Arc<Self>, id: BoxId, data: &[u8], block: bool) -> Result<(), IpcError> {
        self.disable_interrupts();
        let me = self.proc.lock().current;
        let step = self.ipc.lock().try_send(id, me, data, block);
        match step {
            Err(e) => {
                self.enable_interrupts();
                Err(e)
            }
            Ok(SendStep::Done) => {
                self.enable_interrupts();
                Ok(())
            }
            Ok(SendStep::Wake(peer)) => {
                self.proc.lock().make_ready(peer);
                self.dispatcher();
                self.enable_interrupts();
                Ok(())
            }
            Ok(SendStep::MustBlock) => {
                let Some(me) = me else {
                    crate::fatal!(self.machine, "blocking send with no current process");
                };
                let blocked = self.block_me(BLOCKED_SEND);
                self.disable_interrupts();
                let outcome = self.ipc.lock().take_outcome(me);
                if outcome.is_none() {
                    self.ipc.lock().scrub_waiter(id, me);
                }
                self.enable_interrupts();
                if blocked.is_err() {
                    return Err(IpcError::Zapped);
                }
                match outcome {
                    Some(WakeOutcome::Released) => Err(IpcError::BoxReleased),
                    _ => Ok(()),
                }
            }
        }
    }

    /// Receives into `buf`, blocking while the box is empty. Returns the
    /// byte count copied.
    pub fn mbox_receive(self: &Arc<Self>, id: BoxId, buf: &mut [u8]) -> Result<usize, IpcError> {
        self.check_kernel_mode("mbox_receive");
        self.receive_inner(id, buf, true)
    }

    /// Non-blocking receive: `WouldBlock` instead of waiting.
    pub fn mbox_cond_receive(
        self: &Arc<Self>,
        id: BoxId,
        buf: &mut [u8],
    ) -> Result<usize, IpcError> {
        self.check_kernel_mode("mbox_cond_receive");
        self.receive_inner(id, buf, false)
    }

    fn receive_inner(
        self: &Arc<Self>,
        id: BoxId,
        buf: &mut [u8],
        block: bool,
    ) -> Result<usize, IpcError> {
        self.disable_interrupts();
        let me = self.proc.lock().current;
        let step = self.ipc.lock().try_receive(id, me, buf.len(), block);
        match step {
            Err(e) => {
                self.enable_interrupts();
                Err(e)
            }
            Ok(RecvStep::Data { bytes, wake }) => {
                buf[..bytes.len()].copy_from_slice(&bytes);
                if let Some(peer) = wake {
                    self.proc.lock().make_ready(peer);
                    self.dispatcher();
                }
                self.enable_interrupts();
                Ok(bytes.len())
            }
            Ok(RecvStep::MustBlock) => {
                let Some(me) = me else {
                    crate::fatal!(self.machine, "blocking receive with no current process");
                };
                let blocked = self.block_me(BLOCKED_RECV);
                self.disable_interrupts();
                let outcome = self.ipc.lock().take_outcome(me);
                if outcome.is_none() {
                    self.ipc.lock().scrub_waiter(id, me);
                }
                self.enable_interrupts();
                if blocked.is_err() {
                    return Err(IpcError::Zapped);
                }
                match outcome {
                    Some(WakeOutcome::Released) => Err(IpcError::BoxReleased),
                    Some(WakeOutcome::Delivered(bytes)) => {
                        let n = bytes.len().min(buf.len());
                        buf[..n].copy_from_slice(&bytes[..n]);
                        Ok(n)
                    }
                    _ => Ok(0),
                }
            }
        }
    }

    /// Invalidates the box and wakes every blocked sender and receiver;
    /// their calls return `BoxReleased`.
    pub fn mbox_release(self: &Arc<Self>, id: BoxId) -> Result<(), IpcError> {
        self.check_kernel_mode("mbox_release");
        self.disable_interrupts();
        let woken = match self.ipc.lock().release(id) {
            Ok(woken) => woken,
            Err(e) => {
                self.enable_interrupts();
                return Err(e);
            }
        };
        for pid in woken {
            self.proc.lock().make_ready(pid);
            self.dispatcher();
        }
        let me = self.proc.lock().current;
        let zapped = me
            .map(|me| {
                self.proc
                    .lock()
                    .descriptor(me)
                    .map(|d| d.zapped)
                    .unwrap_or(false)
            })
            .unwrap_or(false);
        self.enable_interrupts();
        if zapped {
            Err(IpcError::Zapped)
        } else {
            Ok(())
        }
    }

    /// Blocks until the device raises its next interrupt; returns the
    /// status word forwarded by the interrupt handler.
    pub fn wait_device(
        self: &Arc<Self>,
        device: crate::hal::Device,
        unit: usize,
    ) -> Result<i32, Zapped> {
        self.check_kernel_mode("wait_device");
        let id = {
            let dev = self.with_ints_disabled(|| {
                self.dev.lock().device_mbox(device, unit)
            });
            match dev {
                Some(id) => id,
                None => crate::fatal!(
                    self.machine,
                    "wait_device on invalid device {device:?} unit {unit}"
                ),
            }
        };
        let mut buf = [0u8; 4];
        match self.mbox_receive(id, &mut buf) {
            Ok(4) => Ok(i32::from_le_bytes(buf)),
            Ok(_) => Ok(0),
            Err(IpcError::Zapped) => Err(Zapped),
            Err(_) => Err(Zapped),
        }
    }

    /// Whether any process is blocked on a device mailbox (the sentinel's
    /// I/O-pending test).
    pub fn check_io(&self) -> bool {
        self.with_ints_disabled(|| {
            let ids = self.dev.lock().all_device_mboxes();
            let ipc = self.ipc.lock();
            ids.into_iter().any(|id| ipc.has_waiters(id))
        })
    }
}
