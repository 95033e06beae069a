// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! End-to-end scheduler scenarios: fork/join, priority preemption,
//! zap, and timeslice accounting on a fully booted machine.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axon::proc::JoinError;
use axon_e2e::{cell, get, run_kernel, set};

#[test]
fn fork_join_returns_child_pid_and_status() {
    let observed = cell((0u16, 0u16, -1i32, 0u16));
    let out = Arc::clone(&observed);
    let code = run_kernel(move |kernel, _| {
        let me = kernel.getpid();
        let child = kernel
            .fork("forty-two", Box::new(|_, _| 42), None, 16 * 1024, 3)
            .expect("fork child");
        let (joined, status) = kernel.join().expect("join child");
        set(&out, (child.raw(), joined.raw(), status, me.raw()));
        assert_eq!(kernel.getpid(), me);
        0
    });
    assert_eq!(code, 0);
    let (child, joined, status, _me) = get(&observed);
    assert_eq!(child, joined);
    assert_eq!(status, 42);
}

#[test]
fn higher_priority_child_preempts_at_fork() {
    let ran_before_fork_returned = cell(false);
    let join_status = cell(-1i32);
    let flag = Arc::new(AtomicBool::new(false));

    let seen = Arc::clone(&ran_before_fork_returned);
    let status_out = Arc::clone(&join_status);
    let code = run_kernel(move |kernel, _| {
        let child_flag = Arc::clone(&flag);
        kernel
            .fork(
                "eager",
                Box::new(move |_, _| {
                    child_flag.store(true, Ordering::SeqCst);
                    7
                }),
                None,
                16 * 1024,
                1,
            )
            .expect("fork eager child");
        // Priority 1 beats our band 3: the child already ran to completion.
        set(&seen, flag.load(Ordering::SeqCst));
        let (_pid, status) = kernel.join().expect("join eager child");
        set(&status_out, status);
        0
    });
    assert_eq!(code, 0);
    assert!(get(&ran_before_fork_returned));
    assert_eq!(get(&join_status), 7);
}

#[test]
fn equal_priority_fork_round_robins_to_the_child() {
    // The dispatcher demotes the caller to the tail of its band before
    // selecting, so a same-band child (already queued) runs first.
    let ran_early = cell(false);
    let seen = Arc::clone(&ran_early);
    let flag = Arc::new(AtomicBool::new(false));
    let code = run_kernel(move |kernel, _| {
        let child_flag = Arc::clone(&flag);
        kernel
            .fork(
                "peer",
                Box::new(move |_, _| {
                    child_flag.store(true, Ordering::SeqCst);
                    0
                }),
                None,
                16 * 1024,
                3,
            )
            .expect("fork peer");
        set(&seen, flag.load(Ordering::SeqCst));
        let _ = kernel.join().expect("join peer");
        0
    });
    assert_eq!(code, 0);
    assert!(get(&ran_early));
}

#[test]
fn zap_blocks_until_target_quits() {
    let zap_result = cell(false);
    let target_saw_zap = cell(false);

    let zr = Arc::clone(&zap_result);
    let ts = Arc::clone(&target_saw_zap);
    let code = run_kernel(move |kernel, _| {
        let saw = Arc::clone(&ts);
        let victim = kernel
            .fork(
                "victim",
                Box::new(move |k, _| loop {
                    if k.is_zapped() {
                        set(&saw, true);
                        break 9;
                    }
                }),
                None,
                16 * 1024,
                3,
            )
            .expect("fork victim");
        let zapped_ok = kernel.zap(victim).is_ok();
        set(&zr, zapped_ok);
        match kernel.join() {
            Ok((_pid, status)) => assert_eq!(status, 9),
            Err(JoinError::Zapped { status, .. }) => assert_eq!(status, 9),
            Err(e) => panic!("join failed: {e:?}"),
        }
        0
    });
    assert_eq!(code, 0);
    assert!(get(&zap_result));
    assert!(get(&target_saw_zap));
}

#[test]
fn join_without_children_reports_no_children() {
    let saw = cell(false);
    let out = Arc::clone(&saw);
    let code = run_kernel(move |kernel, _| {
        set(&out, kernel.join() == Err(JoinError::NoChildren));
        0
    });
    assert_eq!(code, 0);
    assert!(get(&saw));
}

#[test]
fn joins_observe_children_in_quit_order() {
    let order = cell(Vec::<i32>::new());
    let out = Arc::clone(&order);
    let code = run_kernel(move |kernel, _| {
        // Children at band 2 run (and quit) immediately at fork, so quit
        // order is fork order here; join must report that order.
        for tag in [11, 22, 33] {
            kernel
                .fork(
                    &format!("kid{tag}"),
                    Box::new(move |_, _| tag),
                    None,
                    16 * 1024,
                    2,
                )
                .expect("fork kid");
        }
        let mut seen = Vec::new();
        for _ in 0..3 {
            let (_pid, status) = kernel.join().expect("join kid");
            seen.push(status);
        }
        set(&out, seen);
        0
    });
    assert_eq!(code, 0);
    assert_eq!(get(&order), vec![11, 22, 33]);
}

#[test]
fn exhausted_timeslice_restarts_the_slice_clock() {
    let moved = cell(false);
    let out = Arc::clone(&moved);
    let code = run_kernel(move |kernel, _| {
        let t0 = kernel.read_cur_start_time();
        // Push simulated time past the four-tick budget, then deliver the
        // clock interrupt's timeslice check by hand.
        kernel.machine().debug_advance_clock(85_000);
        kernel.time_slice();
        let t1 = kernel.read_cur_start_time();
        set(&out, t1 > t0);
        0
    });
    assert_eq!(code, 0);
    assert!(get(&moved));
}

#[test]
fn fork_rejects_bad_arguments() {
    let checks = cell((false, false, false));
    let out = Arc::clone(&checks);
    let code = run_kernel(move |kernel, _| {
        use axon::proc::ForkError;
        let bad_prio = kernel.fork("p", Box::new(|_, _| 0), None, 16 * 1024, 0)
            == Err(ForkError::InvalidPriority);
        let bad_prio_high = kernel.fork("p", Box::new(|_, _| 0), None, 16 * 1024, 6)
            == Err(ForkError::InvalidPriority);
        let tiny_stack = kernel.fork("p", Box::new(|_, _| 0), None, 100, 3)
            == Err(ForkError::StackTooSmall);
        set(&out, (bad_prio, bad_prio_high, tiny_stack));
        0
    });
    assert_eq!(code, 0);
    assert_eq!(get(&checks), (true, true, true));
}
