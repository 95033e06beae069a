// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! End-to-end mailbox scenarios: rendezvous, slot exhaustion, release.

use std::sync::Arc;

use axon::ipc::IpcError;
use axon_e2e::{cell, get, run_kernel, set};

#[test]
fn rendezvous_pairs_blocked_receiver_with_sender() {
    let received = cell((0usize, Vec::new()));
    let out = Arc::clone(&received);
    let code = run_kernel(move |kernel, _| {
        let mbox = kernel.mbox_create(0, 16).expect("create rendezvous box");
        let inner = Arc::clone(&out);
        // Band 2 beats us: the receiver runs now and blocks on the empty box.
        kernel
            .fork(
                "receiver",
                Box::new(move |k, _| {
                    let mut buf = [0u8; 16];
                    let n = k.mbox_receive(mbox, &mut buf).expect("receive");
                    set(&inner, (n, buf[..n].to_vec()));
                    0
                }),
                None,
                16 * 1024,
                2,
            )
            .expect("fork receiver");
        kernel.mbox_send(mbox, b"hello").expect("send");
        let _ = kernel.join().expect("join receiver");
        0
    });
    assert_eq!(code, 0);
    let (n, bytes) = get(&received);
    assert_eq!(n, 5);
    assert_eq!(bytes, b"hello");
}

#[test]
fn slot_exhaustion_blocks_third_sender_until_a_receive() {
    let order = cell(Vec::<Vec<u8>>::new());
    let out = Arc::clone(&order);
    let code = run_kernel(move |kernel, _| {
        let mbox = kernel.mbox_create(2, 10).expect("create box");
        for name in ["sender1", "sender2", "sender3"] {
            let payload = name.as_bytes().to_vec();
            kernel
                .fork(
                    name,
                    Box::new(move |k, _| match k.mbox_send(mbox, &payload) {
                        Ok(()) => 0,
                        Err(_) => 1,
                    }),
                    None,
                    16 * 1024,
                    2,
                )
                .expect("fork sender");
        }
        // The first two sends filled the slots; the third sender is blocked.
        let mut seen = Vec::new();
        for _ in 0..3 {
            let mut buf = [0u8; 10];
            let n = kernel.mbox_receive(mbox, &mut buf).expect("receive");
            seen.push(buf[..n].to_vec());
        }
        set(&out, seen);
        for _ in 0..3 {
            let _ = kernel.join().expect("join sender");
        }
        0
    });
    assert_eq!(code, 0);
    let seen = get(&order);
    assert_eq!(seen, vec![b"sender1".to_vec(), b"sender2".to_vec(), b"sender3".to_vec()]);
}

#[test]
fn conditional_send_reports_would_block() {
    let results = cell((false, false));
    let out = Arc::clone(&results);
    let code = run_kernel(move |kernel, _| {
        let full = kernel.mbox_create(1, 8).expect("create box");
        kernel.mbox_send(full, b"x").expect("fill");
        let full_blocks = kernel.mbox_cond_send(full, b"y") == Err(IpcError::WouldBlock);
        let rendezvous = kernel.mbox_create(0, 8).expect("create rendezvous");
        let lonely_blocks = kernel.mbox_cond_send(rendezvous, b"z") == Err(IpcError::WouldBlock);
        set(&out, (full_blocks, lonely_blocks));
        0
    });
    assert_eq!(code, 0);
    assert_eq!(get(&results), (true, true));
}

#[test]
fn release_wakes_blocked_receiver_with_box_released() {
    let outcome = cell(false);
    let out = Arc::clone(&outcome);
    let code = run_kernel(move |kernel, _| {
        let mbox = kernel.mbox_create(0, 8).expect("create box");
        let inner = Arc::clone(&out);
        kernel
            .fork(
                "stuck",
                Box::new(move |k, _| {
                    let mut buf = [0u8; 8];
                    let released = k.mbox_receive(mbox, &mut buf) == Err(IpcError::BoxReleased);
                    set(&inner, released);
                    0
                }),
                None,
                16 * 1024,
                2,
            )
            .expect("fork stuck receiver");
        kernel.mbox_release(mbox).expect("release box");
        let _ = kernel.join().expect("join receiver");
        // The id is dead afterwards.
        assert_eq!(kernel.mbox_send(mbox, b"x"), Err(IpcError::BadBox));
        0
    });
    assert_eq!(code, 0);
    assert!(get(&outcome));
}

#[test]
fn send_and_receive_validate_sizes() {
    let checks = cell((false, false));
    let out = Arc::clone(&checks);
    let code = run_kernel(move |kernel, _| {
        let mbox = kernel.mbox_create(2, 4).expect("create box");
        let too_big = kernel.mbox_send(mbox, b"12345") == Err(IpcError::MsgSize);
        kernel.mbox_send(mbox, b"1234").expect("send");
        let mut tiny = [0u8; 2];
        let small_buf = kernel.mbox_receive(mbox, &mut tiny) == Err(IpcError::SlotSize);
        set(&out, (too_big, small_buf));
        0
    });
    assert_eq!(code, 0);
    assert_eq!(get(&checks), (true, true));
}

#[test]
fn zero_length_rendezvous_carries_no_bytes() {
    let woke = cell(false);
    let out = Arc::clone(&woke);
    let code = run_kernel(move |kernel, _| {
        let mbox = kernel.mbox_create(0, 0).expect("create signal box");
        let inner = Arc::clone(&out);
        kernel
            .fork(
                "waiter",
                Box::new(move |k, _| {
                    let mut empty = [0u8; 0];
                    let n = k.mbox_receive(mbox, &mut empty).expect("receive signal");
                    set(&inner, n == 0);
                    0
                }),
                None,
                16 * 1024,
                2,
            )
            .expect("fork waiter");
        kernel.mbox_send(mbox, &[]).expect("signal");
        let _ = kernel.join().expect("join waiter");
        0
    });
    assert_eq!(code, 0);
    assert!(get(&woke));
}
