// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Disk driver process: SCAN scheduling, per-sector transfers
//! OWNERS: @kernel-dev-team
//! PUBLIC API: Kernel::{disk_read, disk_write, disk_size}, disk_driver
//! DEPENDS_ON: device mailboxes, request slots in dev tables
//! INVARIANTS: Requests complete in SCAN order (outward from the head,
//!             wrap to track 0); the requester's slot holds the result
//!             before its private box is signalled

use std::sync::Arc;

use crate::hal::{
    Device, DeviceRequest, DiskReply, DiskRequest, DISK_SECTOR_SIZE, DISK_TRACK_SIZE,
};
use crate::kernel::Kernel;
use crate::log_debug;
use crate::types::Pid;

use super::{DeviceOpError, DiskJob, DiskOp};

/// SCAN (elevator) selection: among requests at or beyond the current
/// track pick the lowest track (ties to the oldest); with none outward,
/// restart from track zero.
pub(crate) fn scan_pick(entries: &[(Pid, usize)], current_track: usize) -> Option<usize> {
    let mut outward: Option<(usize, usize)> = None;
    for (at, &(_, track)) in entries.iter().enumerate() {
        if track >= current_track && outward.map(|(_, best)| track < best).unwrap_or(true) {
            outward = Some((at, track));
        }
    }
    if let Some((at, _)) = outward {
        return Some(at);
    }
    let mut lowest: Option<(usize, usize)> = None;
    for (at, &(_, track)) in entries.iter().enumerate() {
        if lowest.map(|(_, best)| track < best).unwrap_or(true) {
            lowest = Some((at, track));
        }
    }
    lowest.map(|(at, _)| at)
}

/// Services one disk unit until zapped. Learns the geometry up front,
/// sleeps on the wake box while the queue is empty, and completes queued
/// requests in SCAN order.
pub fn disk_driver(kernel: &Arc<Kernel>, arg: &str) -> i32 {
    let unit: usize = arg.parse().unwrap_or(0);
    // The head position is unknown until the first seek.
    let mut current_track = usize::MAX;

    let machine = Arc::clone(kernel.machine());
    if machine
        .device_output(Device::Disk, unit, DeviceRequest::Disk(DiskRequest::Tracks))
        .is_err()
    {
        crate::fatal!(machine, "disk {unit}: geometry request rejected");
    }
    if kernel.wait_device(Device::Disk, unit).is_err() {
        return 0;
    }
    let tracks = match machine.disk_take_reply(unit) {
        Some(DiskReply::Tracks(tracks)) => tracks,
        _ => crate::fatal!(machine, "disk {unit}: no geometry reply"),
    };
    log_debug!(target: "dev", "disk {unit} has {tracks} tracks");

    let (wake_box, mutex) = kernel.with_ints_disabled(|| {
        let dev = kernel.dev.lock();
        (dev.disks[unit].wake_box, dev.disks[unit].mutex)
    });
    let (Some(wake_box), Some(mutex)) = (wake_box, mutex) else {
        crate::fatal!(machine, "disk {unit}: driver boxes missing");
    };

    loop {
        let empty = kernel.with_ints_disabled(|| kernel.dev.lock().disks[unit].queue.is_empty());
        if empty {
            let mut nothing = [0u8; 0];
            if kernel.mbox_receive(wake_box, &mut nothing).is_err() {
                break;
            }
            // Woken with nothing queued: shutdown kick.
            let still_empty =
                kernel.with_ints_disabled(|| kernel.dev.lock().disks[unit].queue.is_empty());
            if still_empty {
                break;
            }
        }

        if kernel.mutex_acquire(mutex).is_err() {
            break;
        }
        let picked = kernel.with_ints_disabled(|| {
            let mut dev = kernel.dev.lock();
            let entries: Vec<(Pid, usize)> = dev.disks[unit]
                .queue
                .iter()
                .map(|&pid| {
                    let track = dev.proc[pid.slot()]
                        .disk_job
                        .as_ref()
                        .map(|job| job.track)
                        .unwrap_or(0);
                    (pid, track)
                })
                .collect();
            let pick_track = if current_track == usize::MAX { 0 } else { current_track };
            scan_pick(&entries, pick_track).map(|at| dev.disks[unit].queue.remove(at))
        });
        let _ = kernel.mutex_release(mutex);
        let Some(pid) = picked else { continue };

        let job = kernel.with_ints_disabled(|| kernel.dev.lock().proc[pid.slot()].disk_job.take());
        let Some(job) = job else { continue };

        let outcome = match job.op {
            DiskOp::Tracks => Ok(tracks as i32),
            DiskOp::Read | DiskOp::Write => {
                handle_read_or_write(kernel, unit, tracks, &mut current_track, pid, &job)
            }
        };
        kernel.with_ints_disabled(|| {
            kernel.dev.lock().proc[pid.slot()].disk_result = Some(outcome);
        });

        let target = kernel.private_box(pid);
        if kernel.mbox_send(target, &[]).is_err() {
            break;
        }
        if kernel.is_zapped() {
            break;
        }
    }

    // Shutdown: fail whatever is still queued, then drop the driver boxes.
    loop {
        let next = kernel.with_ints_disabled(|| {
            let mut dev = kernel.dev.lock();
            if dev.disks[unit].queue.is_empty() {
                None
            } else {
                Some(dev.disks[unit].queue.remove(0))
            }
        });
        let Some(pid) = next else { break };
        kernel.with_ints_disabled(|| {
            let mut dev = kernel.dev.lock();
            dev.proc[pid.slot()].disk_job = None;
            dev.proc[pid.slot()].disk_result = Some(Err(DeviceOpError::Zapped));
        });
        let target = kernel.private_box(pid);
        let _ = kernel.mbox_send(target, &[]);
    }
    let _ = kernel.mbox_release(wake_box);
    let _ = kernel.mbox_release(mutex);
    0
}

/// Seeks as needed and moves one sector per device operation, walking
/// across track boundaries. Returns the request outcome.
fn handle_read_or_write(
    kernel: &Arc<Kernel>,
    unit: usize,
    tracks: usize,
    current_track: &mut usize,
    pid: Pid,
    job: &DiskJob,
) -> Result<i32, DeviceOpError> {
    let machine = Arc::clone(kernel.machine());
    let ending_sector = job.track * DISK_TRACK_SIZE + job.first + job.sectors;
    if ending_sector > tracks * DISK_TRACK_SIZE {
        return Err(DeviceOpError::BadInput);
    }

    // A start of DISK_TRACK_SIZE means the first sector of the next track.
    let mut track = job.track + job.first / DISK_TRACK_SIZE;
    let mut sector = job.first % DISK_TRACK_SIZE;
    let mut read_back = Vec::with_capacity(job.sectors * DISK_SECTOR_SIZE);

    for i in 0..job.sectors {
        if track != *current_track {
            if machine
                .device_output(Device::Disk, unit, DeviceRequest::Disk(DiskRequest::Seek { track }))
                .is_err()
            {
                return Err(DeviceOpError::Device(crate::hal::DEV_ERROR));
            }
            let status = kernel
                .wait_device(Device::Disk, unit)
                .map_err(|_| DeviceOpError::Zapped)?;
            if status != crate::hal::DEV_READY {
                return Err(DeviceOpError::Device(status));
            }
            let _ = machine.disk_take_reply(unit);
            *current_track = track;
        }

        let request = match job.op {
            DiskOp::Read => DiskRequest::Read { sector },
            DiskOp::Write => {
                let base = i * DISK_SECTOR_SIZE;
                let data = job
                    .data
                    .as_ref()
                    .map(|d| d[base..base + DISK_SECTOR_SIZE].to_vec().into_boxed_slice())
                    .ok_or(DeviceOpError::BadInput)?;
                DiskRequest::Write { sector, data }
            }
            DiskOp::Tracks => return Err(DeviceOpError::BadInput),
        };
        if machine
            .device_output(Device::Disk, unit, DeviceRequest::Disk(request))
            .is_err()
        {
            return Err(DeviceOpError::Device(crate::hal::DEV_ERROR));
        }
        let status = kernel
            .wait_device(Device::Disk, unit)
            .map_err(|_| DeviceOpError::Zapped)?;
        if status != crate::hal::DEV_READY {
            return Err(DeviceOpError::Device(status));
        }
        match machine.disk_take_reply(unit) {
            Some(DiskReply::Sector(data)) => read_back.extend_from_slice(&data),
            Some(_) | None => {}
        }

        sector += 1;
        if sector == DISK_TRACK_SIZE {
            track += 1;
            sector = 0;
        }
    }

    if job.op == DiskOp::Read {
        kernel.with_ints_disabled(|| {
            kernel.dev.lock().proc[pid.slot()].disk_data = Some(read_back);
        });
    }
    Ok(0)
}

impl Kernel {
    fn enqueue_disk_job(self: &Arc<Self>, unit: usize, job: DiskJob) -> Result<(), DeviceOpError> {
        let me = self.getpid();
        let (mutex, wake_box) = self.with_ints_disabled(|| {
            let dev = self.dev.lock();
            match dev.disks.get(unit) {
                Some(disk) => (disk.mutex, disk.wake_box),
                None => (None, None),
            }
        });
        let (Some(mutex), Some(wake_box)) = (mutex, wake_box) else {
            return Err(DeviceOpError::BadInput);
        };

        if self.mutex_acquire(mutex).is_err() {
            return Err(DeviceOpError::Zapped);
        }
        self.with_ints_disabled(|| {
            let mut dev = self.dev.lock();
            dev.proc[me.slot()].disk_job = Some(job);
            dev.proc[me.slot()].disk_result = None;
            dev.disks[unit].queue.push(me);
        });
        let _ = self.mutex_release(mutex);

        // Kick the driver awake; WouldBlock means it is already busy.
        let _ = self.mbox_cond_send(wake_box, &[]);

        let private = self.private_box(me);
        let mut nothing = [0u8; 0];
        if self.mbox_receive(private, &mut nothing).is_err() {
            return Err(DeviceOpError::Zapped);
        }
        Ok(())
    }

    fn take_disk_result(&self, pid: Pid) -> Result<i32, DeviceOpError> {
        self.with_ints_disabled(|| self.dev.lock().proc[pid.slot()].disk_result.take())
            .unwrap_or(Err(DeviceOpError::Zapped))
    }

    /// Reads `sectors` sectors starting at (`track`, `first`) into `buf`.
    pub fn disk_read(
        self: &Arc<Self>,
        unit: usize,
        track: usize,
        first: usize,
        sectors: usize,
        buf: &mut [u8],
    ) -> Result<(), DeviceOpError> {
        self.check_kernel_mode("disk_read");
        validate_transfer(self, unit, first, sectors, buf.len())?;
        let me = self.getpid();
        self.enqueue_disk_job(
            unit,
            DiskJob { op: DiskOp::Read, track, first, sectors, data: None },
        )?;
        self.take_disk_result(me)?;
        let data = self.with_ints_disabled(|| self.dev.lock().proc[me.slot()].disk_data.take());
        match data {
            Some(data) => {
                let n = data.len().min(buf.len());
                buf[..n].copy_from_slice(&data[..n]);
                Ok(())
            }
            None => Err(DeviceOpError::Device(crate::hal::DEV_ERROR)),
        }
    }

    /// Writes `sectors` sectors from `data` starting at (`track`, `first`).
    pub fn disk_write(
        self: &Arc<Self>,
        unit: usize,
        track: usize,
        first: usize,
        sectors: usize,
        data: &[u8],
    ) -> Result<(), DeviceOpError> {
        self.check_kernel_mode("disk_write");
        validate_transfer(self, unit, first, sectors, data.len())?;
        let me = self.getpid();
        self.enqueue_disk_job(
            unit,
            DiskJob {
                op: DiskOp::Write,
                track,
                first,
                sectors,
                data: Some(data.to_vec()),
            },
        )?;
        self.take_disk_result(me).map(|_| ())
    }

    /// Disk geometry: (sector bytes, sectors per track, track count).
    pub fn disk_size(self: &Arc<Self>, unit: usize) -> Result<(usize, usize, usize), DeviceOpError> {
        self.check_kernel_mode("disk_size");
        let units = self.with_ints_disabled(|| self.dev.lock().disk_units);
        if unit >= units {
            return Err(DeviceOpError::BadInput);
        }
        let me = self.getpid();
        self.enqueue_disk_job(
            unit,
            DiskJob { op: DiskOp::Tracks, track: 0, first: 0, sectors: 0, data: None },
        )?;
        let tracks = self.take_disk_result(me)?;
        Ok((DISK_SECTOR_SIZE, DISK_TRACK_SIZE, tracks as usize))
    }
}

fn validate_transfer(
    kernel: &Kernel,
    unit: usize,
    first: usize,
    sectors: usize,
    len: usize,
) -> Result<(), DeviceOpError> {
    let units = kernel.with_ints_disabled(|| kernel.dev.lock().disk_units);
    // The starting sector range is the closed interval [0, DISK_TRACK_SIZE];
    // a zero-sector transfer is a legal no-op.
    if unit >= units || first > DISK_TRACK_SIZE {
        return Err(DeviceOpError::BadInput);
    }
    if len < sectors * DISK_SECTOR_SIZE {
        return Err(DeviceOpError::BadInput);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pid(raw: u16) -> Pid {
        Pid::from_raw(raw)
    }

    #[test]
    fn scan_prefers_outward_requests() {
        let entries = [(pid(2), 9), (pid(3), 4), (pid(4), 6)];
        // Head at 5: candidates are 9 and 6; 6 wins.
        assert_eq!(scan_pick(&entries, 5), Some(2));
    }

    #[test]
    fn scan_breaks_ties_by_age() {
        let entries = [(pid(2), 7), (pid(3), 7), (pid(4), 7)];
        assert_eq!(scan_pick(&entries, 0), Some(0));
    }

    #[test]
    fn scan_wraps_to_lowest_track() {
        let entries = [(pid(2), 3), (pid(3), 1)];
        // Head beyond both: restart at track 0 and take the lowest.
        assert_eq!(scan_pick(&entries, 8), Some(1));
    }

    #[test]
    fn scan_empty_queue_yields_none() {
        assert_eq!(scan_pick(&[], 0), None);
    }

    #[test]
    fn scan_exact_head_position_counts_as_outward() {
        let entries = [(pid(2), 5), (pid(3), 2)];
        assert_eq!(scan_pick(&entries, 5), Some(0));
    }
}
