// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Demand paging: page tables, fault handling, init/cleanup, stats
//! OWNERS: @kernel-vm-team
//! PUBLIC API: Kernel::{vm_init, vm_cleanup, vm_read, vm_write, vm_stats}
//! DEPENDS_ON: hal MMU surface, ipc mailboxes, dev disk operations
//! INVARIANTS: A resident PTE and its frame point at each other; a paged
//!             out PTE carries a swap block; PRESENT is set at table init
//!             and page-in and cleared by eviction

use bitflags::bitflags;
use std::sync::Arc;

use crate::dev::DeviceOpError;
use crate::hal::{MmuCause, MmuError, MmuProt};
use crate::ipc::IpcError;
use crate::kernel::Kernel;
use crate::log_warn;
use crate::types::{BoxId, Pid, MAX_PAGERS, MAX_PROC};

pub(crate) mod frame;
mod pager;
pub(crate) mod swap;

use frame::FramePool;
use swap::SwapMap;

/// Disk unit backing the swap store.
pub const SWAP_DISK_UNIT: usize = 1;
/// Encoded size of a fault record on the fault mailbox.
pub(crate) const FAULT_MSG_LEN: usize = 12;
/// Stack given to pager daemons.
const PAGER_STACK: usize = 2 * crate::hal::MIN_STACK;
/// Priority band for pager daemons (the driver band).
const PAGER_PRIO: i32 = 2;

bitflags! {
    /// Per-PTE flags. Permission bits sit low, usage bits high.
    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    pub struct PteFlags: u32 {
        const READABLE = 1 << 0;
        const WRITABLE = 1 << 1;
        const PRESENT = 1 << 3;
        const REFERENCED = 1 << 30;
        const DIRTY = 1 << 31;
    }
}

/// One page-table entry.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) struct Pte {
    pub frame: Option<usize>,
    pub disk_block: Option<usize>,
    pub flags: PteFlags,
}

impl Pte {
    fn fresh() -> Self {
        Self {
            frame: None,
            disk_block: None,
            flags: PteFlags::READABLE | PteFlags::WRITABLE | PteFlags::PRESENT,
        }
    }
}

/// A fault record sent to the pager daemons.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) struct FaultMsg {
    pub pid: Pid,
    pub cause: MmuCause,
    pub offset: usize,
}

impl FaultMsg {
    pub fn encode(self) -> [u8; FAULT_MSG_LEN] {
        let mut out = [0u8; FAULT_MSG_LEN];
        out[0..4].copy_from_slice(&(self.pid.raw() as i32).to_le_bytes());
        out[4..8].copy_from_slice(&(self.cause as i32).to_le_bytes());
        out[8..12].copy_from_slice(&(self.offset as i32).to_le_bytes());
        out
    }

    pub fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != FAULT_MSG_LEN {
            return None;
        }
        let pid = i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        let cause = i32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        let offset = i32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]);
        let cause = match cause {
            1 => MmuCause::Fault,
            2 => MmuCause::Access,
            _ => MmuCause::None,
        };
        Some(Self { pid: Pid::from_raw(pid as u16), cause, offset: offset as usize })
    }
}

/// VM subsystem counters, readable by user code at any time.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct VmStats {
    pub pages: usize,
    pub frames: usize,
    pub blocks: usize,
    pub free_frames: usize,
    pub free_blocks: usize,
    pub switches: u64,
    pub faults: u64,
    pub new: u64,
    pub page_ins: u64,
    pub page_outs: u64,
    pub replaced: u64,
}

/// Errors from `vm_init`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum VmInitError {
    AlreadyInitialized,
    /// Mapping count must equal the page count; pager count must stay in
    /// range; no dimension may be zero.
    BadArgs,
    Mmu(MmuError),
    Ipc(IpcError),
    Disk(DeviceOpError),
}

pub(crate) struct Vm {
    pub pages: usize,
    pub page_size: usize,
    pub tables: Vec<Option<Vec<Pte>>>,
    pub pool: FramePool,
    pub pool_mutex: BoxId,
    pub mmu_mutex: BoxId,
    pub fault_box: BoxId,
    pub swap: SwapMap,
    pub disk_buffer: Vec<u8>,
    pub pager_pids: Vec<Pid>,
}

/// VM subsystem state; empty until `vm_init`.
pub struct VmState {
    pub(crate) active: Option<Vm>,
}

impl VmState {
    pub fn new() -> Self {
        Self { active: None }
    }
}

impl Kernel {
    /// Brings up demand paging: installs the frame pool, fault queue, swap
    /// map, and `pager_count` pager daemons.
    pub fn vm_init(
        self: &Arc<Self>,
        maps: usize,
        virt_pages: usize,
        phys_frames: usize,
        pager_count: usize,
    ) -> Result<(), VmInitError> {
        self.check_kernel_mode("vm_init");
        if self.with_ints_disabled(|| self.vm.lock().active.is_some()) {
            return Err(VmInitError::AlreadyInitialized);
        }
        if maps != virt_pages
            || virt_pages == 0
            || phys_frames == 0
            || pager_count == 0
            || pager_count > MAX_PAGERS
        {
            return Err(VmInitError::BadArgs);
        }

        self.machine
            .mmu_init(maps, virt_pages, phys_frames)
            .map_err(VmInitError::Mmu)?;
        let page_size = self.machine.mmu_page_size();

        let fault_box = self
            .mbox_create(MAX_PROC as i32, FAULT_MSG_LEN as i32)
            .map_err(VmInitError::Ipc)?;
        let mmu_mutex = self.mbox_create(1, 4).map_err(VmInitError::Ipc)?;
        let pool_mutex = self.mbox_create(1, 4).map_err(VmInitError::Ipc)?;

        let (sector_size, track_size, tracks) =
            self.disk_size(SWAP_DISK_UNIT).map_err(VmInitError::Disk)?;
        let swap = SwapMap::new(page_size, sector_size, track_size, tracks);

        {
            let mut stats = self.vm_stats.lock();
            *stats = VmStats {
                pages: virt_pages,
                frames: phys_frames,
                blocks: swap.blocks,
                free_frames: phys_frames,
                free_blocks: swap.blocks,
                ..VmStats::default()
            };
        }

        self.with_ints_disabled(|| {
            self.vm.lock().active = Some(Vm {
                pages: virt_pages,
                page_size,
                tables: (0..MAX_PROC).map(|_| None).collect(),
                pool: FramePool::new(phys_frames),
                pool_mutex,
                mmu_mutex,
                fault_box,
                swap,
                disk_buffer: vec![0; page_size],
                pager_pids: Vec::new(),
            });
        });

        for i in 0..pager_count {
            let name = format!("pagerd{i}");
            let arg = i.to_string();
            let pid = self
                .fork(
                    &name,
                    Box::new(pager::pager_daemon),
                    Some(&arg),
                    PAGER_STACK,
                    PAGER_PRIO,
                )
                .map_err(|_| VmInitError::BadArgs)?;
            self.with_ints_disabled(|| {
                if let Some(vm) = self.vm.lock().active.as_mut() {
                    vm.pager_pids.push(pid);
                }
            });
        }
        Ok(())
    }

    /// Tears paging down: releases the fault queue (retiring the pagers),
    /// joins them, stops the MMU, and frees the VM structures.
    pub fn vm_cleanup(self: &Arc<Self>) {
        self.check_kernel_mode("vm_cleanup");
        let state = self.with_ints_disabled(|| {
            self.vm
                .lock()
                .active
                .as_ref()
                .map(|vm| (vm.fault_box, vm.mmu_mutex, vm.pool_mutex, vm.pager_pids.clone()))
        });
        let Some((fault_box, mmu_mutex, pool_mutex, mut pagers)) = state else {
            return;
        };

        let _ = self.mbox_release(fault_box);
        while !pagers.is_empty() {
            match self.join() {
                Ok((pid, _)) | Err(crate::proc::JoinError::Zapped { child: pid, .. }) => {
                    pagers.retain(|&p| p != pid);
                }
                Err(crate::proc::JoinError::NoChildren) => break,
            }
        }

        if self.machine.mmu_done().is_err() {
            log_warn!(target: "vm", "mmu shutdown reported an error");
        }
        let _ = self.mbox_release(pool_mutex);
        let _ = self.mbox_release(mmu_mutex);
        self.with_ints_disabled(|| {
            self.vm.lock().active = None;
        });
        self.print_vm_stats();
    }

    /// Current counters, copied out.
    pub fn vm_stats(&self) -> VmStats {
        *self.vm_stats.lock()
    }

    /// Prints the counters on the simulator console.
    pub fn print_vm_stats(&self) {
        let stats = self.vm_stats();
        crate::hal::machine::console(format_args!(
            "VmStats\npages:\t\t{}\nframes:\t\t{}\nblocks:\t\t{}\nfreeFrames:\t{}\n\
             freeBlocks:\t{}\nswitches:\t{}\nfaults:\t\t{}\nnew:\t\t{}\npageIns:\t{}\n\
             pageOuts:\t{}\nreplaced:\t{}\n",
            stats.pages,
            stats.frames,
            stats.blocks,
            stats.free_frames,
            stats.free_blocks,
            stats.switches,
            stats.faults,
            stats.new,
            stats.page_ins,
            stats.page_outs,
            stats.replaced,
        ));
    }

    /// Reads from the paged region (faults resolve transparently).
    pub fn vm_read(self: &Arc<Self>, offset: usize, buf: &mut [u8]) {
        self.machine.mmu_read(offset, buf);
    }

    /// Writes into the paged region (faults resolve transparently).
    pub fn vm_write(self: &Arc<Self>, offset: usize, data: &[u8]) {
        self.machine.mmu_write(offset, data);
    }

    // ——— Hooks from the process kernel ———

    /// `fork` hook: processes created after `vm_init` get a page table.
    pub(crate) fn vm_fork_hook(&self, pid: Pid) {
        let mut vm = self.vm.lock();
        let Some(vm) = vm.active.as_mut() else {
            return;
        };
        let pages = vm.pages;
        vm.tables[pid.slot()] = Some(vec![Pte::fresh(); pages]);
    }

    /// Dispatch hook: swaps the MMU mappings from `old` to `new`.
    pub(crate) fn vm_switch_hook(&self, old: Option<Pid>, new: Pid) {
        let mut vm = self.vm.lock();
        let Some(vm) = vm.active.as_mut() else {
            return;
        };
        self.vm_stats.lock().switches += 1;

        if let Some(old) = old {
            if let Some(table) = vm.tables[old.slot()].as_ref() {
                for (page, pte) in table.iter().enumerate() {
                    if pte.frame.is_some() && self.machine.mmu_unmap(0, page).is_err() {
                        log_warn!(target: "vm", "unmap of page {page} failed on switch");
                    }
                }
            }
        }
        if let Some(table) = vm.tables[new.slot()].as_ref() {
            for (page, pte) in table.iter().enumerate() {
                if let Some(frame) = pte.frame {
                    if self.machine.mmu_map(0, page, frame, MmuProt::Rw).is_err() {
                        log_warn!(target: "vm", "map of page {page} failed on switch");
                    }
                }
            }
        }
    }

    /// `quit` hook: unmaps and frees the table, returning frames and swap
    /// blocks to their pools.
    pub(crate) fn vm_quit_hook(&self, pid: Pid) {
        let mut vm = self.vm.lock();
        let Some(vm) = vm.active.as_mut() else {
            return;
        };
        let Some(table) = vm.tables[pid.slot()].take() else {
            return;
        };
        let mut freed_frames = 0usize;
        let mut freed_blocks = 0usize;
        for (page, pte) in table.iter().enumerate() {
            if let Some(frame) = pte.frame {
                let _ = self.machine.mmu_unmap(0, page);
                vm.pool.push_free(frame);
                freed_frames += 1;
            }
            if let Some(block) = pte.disk_block {
                vm.swap.free(block);
                freed_blocks += 1;
            }
        }
        let mut stats = self.vm_stats.lock();
        stats.free_frames += freed_frames;
        stats.free_blocks += freed_blocks;
    }

    /// MMU interrupt entry, running in the faulting process's context:
    /// queues a fault record and blocks until a pager hands back a frame,
    /// then installs the mapping and fills the page.
    pub(crate) fn mmu_fault(self: &Arc<Self>, offset: i32) {
        let cause = self.machine.mmu_get_cause();
        if cause != MmuCause::Fault {
            crate::fatal!(self.machine, "unhandled MMU cause {cause:?} at {offset:#x}");
        }
        let me = self.getpid();
        let offset = offset as usize;

        let (fault_box, page_size, mmu_mutex) = {
            let state = self.with_ints_disabled(|| {
                self.vm
                    .lock()
                    .active
                    .as_ref()
                    .map(|vm| (vm.fault_box, vm.page_size, vm.mmu_mutex))
            });
            match state {
                Some(t) => t,
                None => crate::fatal!(self.machine, "MMU fault with paging offline"),
            }
        };
        self.vm_stats.lock().faults += 1;

        let msg = FaultMsg { pid: me, cause, offset }.encode();
        if self.mbox_send(fault_box, &msg).is_err() {
            crate::fatal!(self.machine, "fault queue send failed");
        }

        let mut reply = [0u8; 4];
        let frame = match self.mbox_receive(self.private_box(me), &mut reply) {
            Ok(4) => i32::from_le_bytes(reply) as usize,
            _ => crate::fatal!(self.machine, "fault reply lost for pid {}", me.raw()),
        };

        // Only the faulting process's tag governs its address space, so the
        // mapping is installed here rather than in the pager.
        let vpage = offset / page_size;
        if self.mutex_acquire(mmu_mutex).is_ok() {
            match self.machine.mmu_map(0, vpage, frame, MmuProt::Rw) {
                Ok(()) | Err(MmuError::MapUnavailable) => {}
                Err(e) => {
                    log_warn!(target: "vm", "fault map of page {vpage} failed: {e:?}");
                }
            }
            let _ = self.mutex_release(mmu_mutex);
        }

        let pte = self.with_ints_disabled(|| {
            self.vm.lock().active.as_ref().and_then(|vm| {
                vm.tables[me.slot()]
                    .as_ref()
                    .and_then(|t| t.get(vpage).copied())
            })
        });
        let Some(pte) = pte else {
            crate::fatal!(self.machine, "fault on pid {} without a page table", me.raw());
        };

        if pte.flags.contains(PteFlags::PRESENT) {
            // Fresh page: zero-fill.
            let zeros = vec![0u8; page_size];
            if self.machine.frame_write(frame, &zeros).is_err() {
                crate::fatal!(self.machine, "zero fill of frame {frame} failed");
            }
            self.update_pte(me, vpage, |pte| {
                pte.flags |= PteFlags::REFERENCED | PteFlags::DIRTY;
            });
        } else {
            let Some(block) = pte.disk_block else {
                crate::fatal!(
                    self.machine,
                    "paged-out PTE without a swap block (pid {} page {vpage})",
                    me.raw()
                );
            };
            let (track, first, count) = self.with_ints_disabled(|| {
                self.vm
                    .lock()
                    .active
                    .as_ref()
                    .map(|vm| vm.swap.geometry(block))
                    .unwrap_or((0, 0, 0))
            });
            let mut buffer = vec![0u8; page_size];
            if self
                .disk_read(SWAP_DISK_UNIT, track, first, count, &mut buffer)
                .is_err()
            {
                crate::fatal!(self.machine, "swap read of block {block} failed");
            }
            if self.machine.frame_write(frame, &buffer).is_err() {
                crate::fatal!(self.machine, "page-in copy to frame {frame} failed");
            }
            self.update_pte(me, vpage, |pte| {
                pte.flags |= PteFlags::REFERENCED | PteFlags::PRESENT;
            });
            self.vm_stats.lock().page_ins += 1;
        }
    }

    pub(crate) fn update_pte(&self, pid: Pid, vpage: usize, f: impl FnOnce(&mut Pte)) {
        self.with_ints_disabled(|| {
            let mut vm = self.vm.lock();
            if let Some(vm) = vm.active.as_mut() {
                if let Some(table) = vm.tables[pid.slot()].as_mut() {
                    if let Some(pte) = table.get_mut(vpage) {
                        f(pte);
                    }
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fault_msg_round_trips() {
        let msg = FaultMsg { pid: Pid::from_raw(12), cause: MmuCause::Fault, offset: 0x3004 };
        let bytes = msg.encode();
        assert_eq!(FaultMsg::decode(&bytes), Some(msg));
    }

    #[test]
    fn fault_msg_rejects_wrong_length() {
        assert_eq!(FaultMsg::decode(&[0u8; 5]), None);
    }

    #[test]
    fn fresh_pte_is_writable_and_present() {
        let pte = Pte::fresh();
        assert!(pte.flags.contains(PteFlags::PRESENT));
        assert!(pte.flags.contains(PteFlags::READABLE | PteFlags::WRITABLE));
        assert_eq!(pte.frame, None);
        assert_eq!(pte.disk_block, None);
    }
}
