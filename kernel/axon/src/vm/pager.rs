// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Pager daemons: fault queue service and frame reclamation
//! OWNERS: @kernel-vm-team
//! PUBLIC API: pager_daemon (forked by vm_init)
//! DEPENDS_ON: frame pool, swap map, disk driver, fault mailbox
//! INVARIANTS: Eviction runs under the pool mutex; a victim PTE loses its
//!             frame and PRESENT bit before the write-back I/O starts

use std::sync::Arc;

use crate::hal::MmuAccess;
use crate::kernel::Kernel;
use crate::log_debug;

use super::{FaultMsg, PteFlags, FAULT_MSG_LEN, SWAP_DISK_UNIT};

/// Loops on the fault mailbox until it is released at cleanup. Each fault
/// gets a frame (free list first, clock eviction otherwise) and a reply on
/// the faulter's private mailbox.
pub fn pager_daemon(kernel: &Arc<Kernel>, arg: &str) -> i32 {
    log_debug!(target: "vm", "pager {arg} started");

    let fault_box = kernel.with_ints_disabled(|| {
        kernel.vm.lock().active.as_ref().map(|vm| vm.fault_box)
    });
    let Some(fault_box) = fault_box else {
        return 0;
    };

    loop {
        let mut msg = [0u8; FAULT_MSG_LEN];
        let n = match kernel.mbox_receive(fault_box, &mut msg) {
            Ok(n) => n,
            Err(_) => break,
        };
        let Some(fault) = FaultMsg::decode(&msg[..n]) else {
            continue;
        };

        let page_size = kernel.with_ints_disabled(|| {
            kernel.vm.lock().active.as_ref().map(|vm| vm.page_size)
        });
        let Some(page_size) = page_size else {
            break;
        };
        let vpage = fault.offset / page_size;

        let Some(frame) = find_free_frame(kernel) else {
            break;
        };

        kernel.with_ints_disabled(|| {
            let mut vm = kernel.vm.lock();
            if let Some(vm) = vm.active.as_mut() {
                if let Some(table) = vm.tables[fault.pid.slot()].as_mut() {
                    if let Some(pte) = table.get_mut(vpage) {
                        pte.frame = Some(frame);
                    }
                }
                vm.pool.frames[frame].reverse = Some((fault.pid.slot(), vpage));
            }
        });

        let target = kernel.private_box(fault.pid);
        if kernel
            .mbox_send(target, &(frame as i32).to_le_bytes())
            .is_err()
        {
            break;
        }
    }

    log_debug!(target: "vm", "pager {arg} retiring");
    0
}

/// Takes the pool mutex and produces a free frame: the free-list head when
/// one exists, otherwise the second-chance (clock) victim after any needed
/// write-back. Returns `None` only when the VM subsystem is gone.
fn find_free_frame(kernel: &Arc<Kernel>) -> Option<usize> {
    let pool_mutex = kernel.with_ints_disabled(|| {
        kernel.vm.lock().active.as_ref().map(|vm| vm.pool_mutex)
    })?;
    if kernel.mutex_acquire(pool_mutex).is_err() {
        return None;
    }

    let frame = allocate_frame(kernel);

    let _ = kernel.mutex_release(pool_mutex);
    frame
}

fn allocate_frame(kernel: &Arc<Kernel>) -> Option<usize> {
    // Fast path: free list.
    let free = kernel.with_ints_disabled(|| {
        let mut vm = kernel.vm.lock();
        let vm = vm.active.as_mut()?;
        let popped = vm.pool.pop_free();
        if popped.is_some() {
            kernel.vm_stats.lock().free_frames -= 1;
        }
        popped
    });
    if free.is_some() {
        return free;
    }

    // Clock scan: skip referenced frames once, select the first quiet one.
    let victim = kernel.with_ints_disabled(|| {
        let mut vm = kernel.vm.lock();
        let vm = vm.active.as_mut()?;
        loop {
            let hand = vm.pool.clock_hand;
            let Some((slot, vpage)) = vm.pool.frames[hand].reverse else {
                // Untracked frame: reclaimable immediately.
                vm.pool.advance_hand();
                return Some((hand, None));
            };
            let hw = kernel
                .machine
                .mmu_get_access(hand)
                .unwrap_or(MmuAccess::default());
            let pte = vm.tables[slot].as_ref().and_then(|t| t.get(vpage).copied());
            let Some(pte) = pte else {
                vm.pool.advance_hand();
                return Some((hand, None));
            };
            if pte.flags.contains(PteFlags::REFERENCED) || hw.referenced {
                // Second chance: clear and move on.
                if let Some(table) = vm.tables[slot].as_mut() {
                    if let Some(p) = table.get_mut(vpage) {
                        p.flags.remove(PteFlags::REFERENCED);
                    }
                }
                let _ = kernel.machine.mmu_set_access(
                    hand,
                    MmuAccess { referenced: false, dirty: hw.dirty },
                );
                vm.pool.advance_hand();
                continue;
            }

            // Victim found: detach the PTE now so a context switch during
            // the write-back cannot remap the frame.
            let dirty = pte.flags.contains(PteFlags::DIRTY) || hw.dirty;
            let need_block = pte.disk_block.is_none();
            let block = if dirty || need_block {
                match pte.disk_block {
                    Some(block) => Some(block),
                    None => {
                        let Some(block) = vm.swap.alloc() else {
                            drop(vm);
                            crate::fatal!(kernel.machine, "swap disk is full");
                        };
                        kernel.vm_stats.lock().free_blocks -= 1;
                        kernel.vm_stats.lock().new += 1;
                        Some(block)
                    }
                }
            } else {
                pte.disk_block
            };
            if let Some(table) = vm.tables[slot].as_mut() {
                if let Some(p) = table.get_mut(vpage) {
                    p.frame = None;
                    p.disk_block = block;
                    p.flags.remove(PteFlags::PRESENT);
                }
            }
            vm.pool.advance_hand();
            let write = dirty || need_block;
            return Some((hand, write.then_some((slot, vpage, block))));
        }
    })?;

    let (frame, write_back) = victim;
    if let Some((slot, vpage, block)) = write_back {
        let Some(block) = block else {
            crate::fatal!(kernel.machine, "write-back selected without a swap block");
        };
        write_out_frame(kernel, frame, block);
        kernel.with_ints_disabled(|| {
            let mut vm = kernel.vm.lock();
            if let Some(vm) = vm.active.as_mut() {
                if let Some(table) = vm.tables[slot].as_mut() {
                    if let Some(p) = table.get_mut(vpage) {
                        p.flags.remove(PteFlags::DIRTY);
                    }
                }
            }
        });
        kernel.vm_stats.lock().page_outs += 1;
    }

    // Recycle through the free list so the accounting invariant holds
    // (push to the head, then take it straight back for the caller).
    kernel.with_ints_disabled(|| {
        let mut vm = kernel.vm.lock();
        if let Some(vm) = vm.active.as_mut() {
            vm.pool.push_free(frame);
            let _ = kernel.machine.mmu_set_access(frame, MmuAccess::default());
            let _ = vm.pool.pop_free();
        }
    });
    kernel.vm_stats.lock().replaced += 1;
    Some(frame)
}

/// Copies the frame through the scratch page and writes it to its swap
/// block via the disk driver.
fn write_out_frame(kernel: &Arc<Kernel>, frame: usize, block: usize) {
    let (geometry, mut buffer) = match kernel.with_ints_disabled(|| {
        let mut vm = kernel.vm.lock();
        let vm = vm.active.as_mut()?;
        let geometry = vm.swap.geometry(block);
        Some((geometry, core::mem::take(&mut vm.disk_buffer)))
    }) {
        Some(pair) => pair,
        None => return,
    };
    let (track, first, count) = geometry;

    if kernel.machine.frame_read(frame, &mut buffer).is_err() {
        crate::fatal!(kernel.machine, "frame {frame} read failed during write-back");
    }
    if kernel
        .disk_write(SWAP_DISK_UNIT, track, first, count, &buffer)
        .is_err()
    {
        crate::fatal!(kernel.machine, "swap write of block {block} failed");
    }

    kernel.with_ints_disabled(|| {
        let mut vm = kernel.vm.lock();
        if let Some(vm) = vm.active.as_mut() {
            vm.disk_buffer = buffer;
        }
    });
}
