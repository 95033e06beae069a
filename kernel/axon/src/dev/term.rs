// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Terminal pipeline: interrupt listener, line receiver, transmitter
//! OWNERS: @kernel-dev-team
//! PUBLIC API: Kernel::{term_read, term_write}; the three driver processes
//! DEPENDS_ON: device mailboxes, tx handshake slot in dev tables
//! INVARIANTS: Lines never exceed MAX_LINE; a full line buffer drops the
//!             oldest line; each transmitted byte is acked through the
//!             listener before the next one is issued

use std::sync::Arc;

use crate::hal::{
    term_stat_char, term_stat_recv, term_stat_xmit, Device, DeviceRequest, TermControl, DEV_BUSY,
    DEV_ERROR, DEV_READY,
};
use crate::ipc::IpcError;
use crate::kernel::Kernel;
use crate::types::{Pid, MAX_LINE};

use super::DeviceOpError;

/// Transmit job encoding on the tx syscall mailbox: requester pid (two
/// bytes little-endian), byte count, then the line bytes.
fn encode_job(pid: Pid, data: &[u8]) -> Vec<u8> {
    let mut msg = Vec::with_capacity(3 + data.len());
    msg.extend_from_slice(&pid.raw().to_le_bytes());
    msg.push(data.len() as u8);
    msg.extend_from_slice(data);
    msg
}

fn decode_job(msg: &[u8]) -> Option<(Pid, Vec<u8>)> {
    if msg.len() < 3 {
        return None;
    }
    let pid = Pid::from_raw(u16::from_le_bytes([msg[0], msg[1]]));
    let count = msg[2] as usize;
    if msg.len() < 3 + count {
        return None;
    }
    Some((pid, msg[3..3 + count].to_vec()))
}

/// Interrupt listener: decomposes each status word, forwards received
/// characters to the line receiver, and acks the transmitter when the
/// transmit side reports ready.
pub fn terminal_driver(kernel: &Arc<Kernel>, arg: &str) -> i32 {
    let unit: usize = arg.parse().unwrap_or(0);
    let machine = Arc::clone(kernel.machine());

    // Receive interrupts stay enabled for the lifetime of the driver.
    let _ = machine.device_output(
        Device::Term,
        unit,
        DeviceRequest::Term(TermControl { recv_int: true, ..TermControl::default() }),
    );

    let (rx_box, tx_mutex) = kernel.with_ints_disabled(|| {
        let dev = kernel.dev.lock();
        (dev.terms[unit].rx_box, dev.terms[unit].tx_mutex)
    });
    let (Some(rx_box), Some(tx_mutex)) = (rx_box, tx_mutex) else {
        crate::fatal!(machine, "term {unit}: listener boxes missing");
    };

    loop {
        let status = match kernel.wait_device(Device::Term, unit) {
            Ok(status) => status,
            Err(_) => break,
        };
        let data = term_stat_char(status);
        let rx_status = term_stat_recv(status);
        let tx_status = term_stat_xmit(status);

        match rx_status {
            DEV_READY => {}
            DEV_BUSY => {
                // A full receiver queue drops this character.
                let _ = kernel.mbox_cond_send(rx_box, &[data]);
            }
            DEV_ERROR => crate::fatal!(machine, "term {unit}: receive error"),
            other => crate::fatal!(machine, "term {unit}: unknown rx status {other}"),
        }

        match tx_status {
            DEV_READY => {
                if kernel.mutex_acquire(tx_mutex).is_err() {
                    break;
                }
                let waiter = kernel.with_ints_disabled(|| {
                    let mut dev = kernel.dev.lock();
                    let info = &mut dev.terms[unit];
                    let waiter = if info.tx_valid { info.tx_waiter } else { None };
                    info.tx_valid = false;
                    waiter
                });
                let _ = kernel.mutex_release(tx_mutex);
                if let Some(waiter) = waiter {
                    let target = kernel.private_box(waiter);
                    if kernel.mbox_send(target, &[]).is_err() {
                        break;
                    }
                }
            }
            DEV_BUSY => {}
            DEV_ERROR => crate::fatal!(machine, "term {unit}: transmit error"),
            other => crate::fatal!(machine, "term {unit}: unknown tx status {other}"),
        }

        if kernel.is_zapped() {
            break;
        }
    }
    0
}

/// Line receiver: buffers characters into lines of at most MAX_LINE
/// bytes, flushing on newline or overflow into the syscall-facing box and
/// discarding the oldest buffered line when that box is full.
pub fn terminal_receiver(kernel: &Arc<Kernel>, arg: &str) -> i32 {
    let unit: usize = arg.parse().unwrap_or(0);

    let (rx_box, to_syscall) = kernel.with_ints_disabled(|| {
        let dev = kernel.dev.lock();
        (dev.terms[unit].rx_box, dev.terms[unit].rx_syscall_box)
    });
    let (Some(rx_box), Some(to_syscall)) = (rx_box, to_syscall) else {
        crate::fatal!(kernel.machine(), "term {unit}: receiver boxes missing");
    };

    let mut line = Vec::with_capacity(MAX_LINE);
    loop {
        let mut ch = [0u8; 1];
        match kernel.mbox_receive(rx_box, &mut ch) {
            Ok(1) => {}
            Ok(_) => continue,
            Err(_) => break,
        }
        line.push(ch[0]);

        if ch[0] == b'\n' || line.len() == MAX_LINE {
            match kernel.mbox_cond_send(to_syscall, &line) {
                Ok(()) => {}
                Err(IpcError::WouldBlock) => {
                    // Buffer full: drop the oldest line, then store ours.
                    let mut garbage = [0u8; MAX_LINE];
                    if kernel.mbox_receive(to_syscall, &mut garbage).is_err() {
                        break;
                    }
                    if kernel.mbox_send(to_syscall, &line).is_err() {
                        break;
                    }
                }
                Err(_) => break,
            }
            line.clear();
        }

        if kernel.is_zapped() {
            break;
        }
    }

    let _ = kernel.mbox_release(to_syscall);
    0
}

/// Transmitter: takes `(requester, bytes)` jobs from the tx syscall box
/// and pushes one character at a time through the device, waiting for the
/// listener's ack between characters.
pub fn terminal_transmitter(kernel: &Arc<Kernel>, arg: &str) -> i32 {
    let unit: usize = arg.parse().unwrap_or(0);
    let machine = Arc::clone(kernel.machine());
    let me = kernel.getpid();

    let (from_syscall, tx_mutex) = kernel.with_ints_disabled(|| {
        let dev = kernel.dev.lock();
        (dev.terms[unit].tx_syscall_box, dev.terms[unit].tx_mutex)
    });
    let (Some(from_syscall), Some(tx_mutex)) = (from_syscall, tx_mutex) else {
        crate::fatal!(machine, "term {unit}: transmitter boxes missing");
    };

    'driver: loop {
        let mut msg = [0u8; crate::types::MAX_MESSAGE];
        let n = match kernel.mbox_receive(from_syscall, &mut msg) {
            Ok(n) => n,
            Err(_) => break,
        };
        let Some((requester, bytes)) = decode_job(&msg[..n]) else {
            continue;
        };

        // Transmit interrupts stay on for the duration of the job.
        let _ = machine.device_output(
            Device::Term,
            unit,
            DeviceRequest::Term(TermControl {
                recv_int: true,
                xmit_int: true,
                ..TermControl::default()
            }),
        );

        let mut sent = 0usize;
        for &ch in &bytes {
            // Issue the character first, then publish the handshake slot.
            // A transmit-ready interrupt can only ack once the slot is
            // valid, so a stale ready status never acks early.
            if machine
                .device_output(
                    Device::Term,
                    unit,
                    DeviceRequest::Term(TermControl {
                        send_char: true,
                        recv_int: true,
                        xmit_int: true,
                        ch,
                    }),
                )
                .is_err()
            {
                break 'driver;
            }
            if kernel.mutex_acquire(tx_mutex).is_err() {
                break 'driver;
            }
            kernel.with_ints_disabled(|| {
                let mut dev = kernel.dev.lock();
                dev.terms[unit].tx_valid = true;
                dev.terms[unit].tx_waiter = Some(me);
            });
            let _ = kernel.mutex_release(tx_mutex);

            // The listener acks on our private box once the device reports
            // transmit-ready with the slot valid.
            let private = kernel.private_box(me);
            let mut nothing = [0u8; 0];
            if kernel.mbox_receive(private, &mut nothing).is_err() {
                break 'driver;
            }
            sent += 1;
        }

        let _ = machine.device_output(
            Device::Term,
            unit,
            DeviceRequest::Term(TermControl { recv_int: true, ..TermControl::default() }),
        );

        kernel.with_ints_disabled(|| {
            kernel.dev.lock().proc[requester.slot()].term_result = Some(sent);
        });
        let target = kernel.private_box(requester);
        if kernel.mbox_send(target, &[]).is_err() {
            break;
        }
        if kernel.is_zapped() {
            break;
        }
    }

    let _ = kernel.mbox_release(from_syscall);
    0
}

impl Kernel {
    /// Reads one buffered line into `buf`; blocks until a line arrives.
    /// Returns the byte count copied (truncated to the buffer).
    pub fn term_read(self: &Arc<Self>, unit: usize, buf: &mut [u8]) -> Result<usize, DeviceOpError> {
        self.check_kernel_mode("term_read");
        let units = self.with_ints_disabled(|| self.dev.lock().term_units);
        if unit >= units || buf.is_empty() {
            return Err(DeviceOpError::BadInput);
        }
        let from_rx = self.with_ints_disabled(|| self.dev.lock().terms[unit].rx_syscall_box);
        let Some(from_rx) = from_rx else {
            return Err(DeviceOpError::BadInput);
        };
        let mut line = [0u8; MAX_LINE];
        let n = match self.mbox_receive(from_rx, &mut line) {
            Ok(n) => n,
            Err(IpcError::Zapped) => return Err(DeviceOpError::Zapped),
            Err(_) => return Err(DeviceOpError::Device(DEV_ERROR)),
        };
        let copy = n.min(buf.len());
        buf[..copy].copy_from_slice(&line[..copy]);
        Ok(copy)
    }

    /// Writes `data` to the terminal; blocks until every byte is out.
    /// Returns the transmitted byte count.
    pub fn term_write(self: &Arc<Self>, unit: usize, data: &[u8]) -> Result<usize, DeviceOpError> {
        self.check_kernel_mode("term_write");
        let units = self.with_ints_disabled(|| self.dev.lock().term_units);
        if unit >= units || data.is_empty() || data.len() > MAX_LINE {
            return Err(DeviceOpError::BadInput);
        }
        let me = self.getpid();
        let to_tx = self.with_ints_disabled(|| self.dev.lock().terms[unit].tx_syscall_box);
        let Some(to_tx) = to_tx else {
            return Err(DeviceOpError::BadInput);
        };

        let job = encode_job(me, data);
        match self.mbox_send(to_tx, &job) {
            Ok(()) => {}
            Err(IpcError::Zapped) => return Err(DeviceOpError::Zapped),
            Err(_) => return Err(DeviceOpError::Device(DEV_ERROR)),
        }

        let private = self.private_box(me);
        let mut nothing = [0u8; 0];
        if self.mbox_receive(private, &mut nothing).is_err() {
            return Err(DeviceOpError::Zapped);
        }
        let sent = self.with_ints_disabled(|| self.dev.lock().proc[me.slot()].term_result.take());
        Ok(sent.unwrap_or(0))
    }
}
