// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! End-to-end paging scenarios: fault-in, eviction to the swap disk, and
//! byte-exact restore with the stats to prove it happened.

use std::sync::Arc;

use axon::hal::MMU_PAGE_SIZE;
use axon::vm::{VmInitError, VmStats};
use axon_e2e::{cell, get, run_kernel, set};

#[test]
fn four_pages_on_two_frames_round_trip_through_swap() {
    let results = cell((false, VmStats::default()));
    let out = Arc::clone(&results);
    let code = run_kernel(move |kernel, _| {
        kernel.vm_init(4, 4, 2, 1).expect("vm init");

        let inner = Arc::clone(&out);
        kernel
            .fork(
                "pager-user",
                Box::new(move |k, _| {
                    let mut ok = true;
                    for page in 0..4usize {
                        let pattern = vec![(page as u8) + 1; MMU_PAGE_SIZE];
                        k.vm_write(page * MMU_PAGE_SIZE, &pattern);
                    }
                    for page in 0..4usize {
                        let mut back = vec![0u8; MMU_PAGE_SIZE];
                        k.vm_read(page * MMU_PAGE_SIZE, &mut back);
                        ok &= back == vec![(page as u8) + 1; MMU_PAGE_SIZE];
                    }
                    set(&inner, (ok, k.vm_stats()));
                    0
                }),
                None,
                64 * 1024,
                3,
            )
            .expect("fork pager user");
        let _ = kernel.join().expect("join pager user");
        kernel.vm_cleanup();
        0
    });
    assert_eq!(code, 0);
    let (ok, stats) = get(&results);
    assert!(ok, "page contents corrupted through swap");
    assert!(stats.faults >= 4, "faults: {}", stats.faults);
    assert!(stats.page_outs >= 2, "pageOuts: {}", stats.page_outs);
    assert!(stats.replaced >= 2, "replaced: {}", stats.replaced);
    assert!(stats.page_ins >= 2, "pageIns: {}", stats.page_ins);
}

#[test]
fn partial_page_writes_see_zero_filled_frames() {
    let observed = cell(Vec::new());
    let out = Arc::clone(&observed);
    let code = run_kernel(move |kernel, _| {
        kernel.vm_init(2, 2, 2, 1).expect("vm init");
        let inner = Arc::clone(&out);
        kernel
            .fork(
                "zeroes",
                Box::new(move |k, _| {
                    // Touch a few bytes; the rest of the page must read as
                    // zeros (fresh pages are zero-filled at fault time).
                    k.vm_write(10, &[7, 8, 9]);
                    let mut back = vec![0xffu8; 16];
                    k.vm_read(0, &mut back);
                    set(&inner, back);
                    0
                }),
                None,
                64 * 1024,
                3,
            )
            .expect("fork zeroes");
        let _ = kernel.join().expect("join zeroes");
        kernel.vm_cleanup();
        0
    });
    assert_eq!(code, 0);
    let back = get(&observed);
    let mut expect = vec![0u8; 16];
    expect[10] = 7;
    expect[11] = 8;
    expect[12] = 9;
    assert_eq!(back, expect);
}

#[test]
fn vm_init_validates_its_arguments() {
    let checks = cell((false, false, false));
    let out = Arc::clone(&checks);
    let code = run_kernel(move |kernel, _| {
        let maps_mismatch = kernel.vm_init(3, 4, 2, 1) == Err(VmInitError::BadArgs);
        let zero_pagers = kernel.vm_init(4, 4, 2, 0) == Err(VmInitError::BadArgs);
        let too_many_pagers = kernel.vm_init(4, 4, 2, 9) == Err(VmInitError::BadArgs);
        set(&out, (maps_mismatch, zero_pagers, too_many_pagers));
        0
    });
    assert_eq!(code, 0);
    assert_eq!(get(&checks), (true, true, true));
}

#[test]
fn vm_cleanup_reaps_the_pager_daemons() {
    let code = run_kernel(move |kernel, _| {
        kernel.vm_init(2, 2, 1, 2).expect("vm init");
        kernel.vm_cleanup();
        // With the pagers joined, the caller has no children left.
        assert_eq!(kernel.join(), Err(axon::proc::JoinError::NoChildren));
        0
    });
    assert_eq!(code, 0);
}
