// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Syscall dispatch scenarios: the closed numbering reaches the kernel
//! operations, and adapters can install their own handlers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axon::syscall::{SysArgs, Syscall};
use axon_e2e::{cell, get, run_kernel, set};

#[test]
fn getpid_and_time_flow_through_the_vector() {
    let observed = cell((0i64, false));
    let out = Arc::clone(&observed);
    let code = run_kernel(move |kernel, _| {
        let mut args = SysArgs::new(Syscall::GetPid.number());
        kernel.syscall(&mut args);
        let pid_matches = args.arg[0] == kernel.getpid().raw() as i64;

        let mut args = SysArgs::new(Syscall::GetTimeOfDay.number());
        kernel.syscall(&mut args);
        set(&out, (args.arg[0], pid_matches));
        0
    });
    assert_eq!(code, 0);
    let (time, pid_matches) = get(&observed);
    assert!(pid_matches);
    assert!(time > 0);
}

#[test]
fn mailbox_syscalls_round_trip_a_message() {
    let received = cell(Vec::new());
    let out = Arc::clone(&received);
    let code = run_kernel(move |kernel, _| {
        let mut create = SysArgs::new(Syscall::MboxCreate.number());
        create.arg[0] = 2; // slots
        create.arg[1] = 16; // slot size
        kernel.syscall(&mut create);
        assert_eq!(create.arg[3], 0);
        let id = create.arg[0];

        let mut send = SysArgs::new(Syscall::MboxSend.number());
        send.arg[0] = id;
        send.data = Some(b"via-vector".to_vec());
        kernel.syscall(&mut send);
        assert_eq!(send.arg[3], 0);

        let mut recv = SysArgs::new(Syscall::MboxReceive.number());
        recv.arg[0] = id;
        recv.arg[1] = 16;
        kernel.syscall(&mut recv);
        assert_eq!(recv.arg[3], 0);
        set(&out, recv.data.unwrap_or_default());

        let mut release = SysArgs::new(Syscall::MboxRelease.number());
        release.arg[0] = id;
        kernel.syscall(&mut release);
        assert_eq!(release.arg[3], 0);
        0
    });
    assert_eq!(code, 0);
    assert_eq!(get(&received), b"via-vector");
}

#[test]
fn conditional_receive_reports_would_block_through_the_vector() {
    let flagged = cell(false);
    let out = Arc::clone(&flagged);
    let code = run_kernel(move |kernel, _| {
        let mut create = SysArgs::new(Syscall::MboxCreate.number());
        create.arg[0] = 1;
        create.arg[1] = 8;
        kernel.syscall(&mut create);
        let id = create.arg[0];

        let mut recv = SysArgs::new(Syscall::MboxCondReceive.number());
        recv.arg[0] = id;
        recv.arg[1] = 8;
        kernel.syscall(&mut recv);
        set(&out, recv.arg[3] == 1);
        0
    });
    assert_eq!(code, 0);
    assert!(get(&flagged));
}

#[test]
fn adapters_can_install_reserved_entries() {
    let called = Arc::new(AtomicBool::new(false));
    let seen = Arc::clone(&called);
    let code = run_kernel(move |kernel, _| {
        let hit = Arc::clone(&seen);
        kernel.install_syscall(
            Syscall::Spawn,
            Arc::new(move |_, args| {
                hit.store(true, Ordering::SeqCst);
                args.arg[0] = 99;
            }),
        );
        let mut args = SysArgs::new(Syscall::Spawn.number());
        kernel.syscall(&mut args);
        assert_eq!(args.arg[0], 99);
        0
    });
    assert_eq!(code, 0);
    assert!(called.load(Ordering::SeqCst));
}

#[test]
fn sleep_syscall_sleeps() {
    let elapsed = cell(0u64);
    let out = Arc::clone(&elapsed);
    let code = run_kernel(move |kernel, _| {
        let before = kernel.sys_clock();
        let mut args = SysArgs::new(Syscall::Sleep.number());
        args.arg[0] = 1;
        kernel.syscall(&mut args);
        assert_eq!(args.arg[3], 0);
        set(&out, kernel.sys_clock() - before);
        0
    });
    assert_eq!(code, 0);
    assert!(get(&elapsed) >= 1_000_000);
}
