// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

#![cfg(test)]
//! CONTEXT: Property-based tests for the mailbox table
//! OWNERS: @kernel-ipc-team
//! NOTE: Tests only; no kernel logic.
//!
//! TEST_SCOPE:
//!   - Receivers observe payloads in enqueue order (FIFO property)
//!   - Slot-pool accounting survives arbitrary send/receive interleavings
//!   - Rendezvous copy length is min(sender_len, receiver_len)

use proptest::collection::vec;
use proptest::prelude::*;

use super::{MailboxTable, RecvStep, SendStep};
use crate::types::Pid;

fn arb_payload() -> impl Strategy<Value = Vec<u8>> {
    vec(any::<u8>(), 0..32)
}

proptest! {
    #[test]
    fn receivers_observe_sender_order(payloads in vec(arb_payload(), 1..20)) {
        let mut table = MailboxTable::new();
        let id = table.create(payloads.len() as i32, 32).unwrap();
        for p in &payloads {
            prop_assert_eq!(table.try_send(id, None, p, true).unwrap(), SendStep::Done);
        }
        for p in &payloads {
            match table.try_receive(id, None, 32, true).unwrap() {
                RecvStep::Data { bytes, wake } => {
                    prop_assert_eq!(&bytes, p);
                    prop_assert_eq!(wake, None);
                }
                RecvStep::MustBlock => prop_assert!(false, "unexpected block"),
            }
        }
        table.assert_invariants();
    }

    #[test]
    fn slot_pool_conserved_under_interleaving(ops in vec((any::<bool>(), arb_payload()), 1..200)) {
        let mut table = MailboxTable::new();
        let id = table.create(4, 32).unwrap();
        let mut queued = 0usize;
        for (is_send, payload) in ops {
            if is_send {
                match table.try_send(id, Some(Pid::from_raw(2)), &payload, false) {
                    Ok(SendStep::Done) => queued += 1,
                    Ok(_) | Err(_) => {}
                }
            } else {
                match table.try_receive(id, Some(Pid::from_raw(3)), 32, false) {
                    Ok(RecvStep::Data { .. }) => queued -= 1,
                    Ok(_) | Err(_) => {}
                }
            }
            table.assert_invariants();
        }
        // Drain what is left; counts must agree.
        let mut drained = 0usize;
        while let Ok(RecvStep::Data { .. }) = table.try_receive(id, None, 32, false) {
            drained += 1;
        }
        prop_assert_eq!(drained, queued);
        table.assert_invariants();
    }

    #[test]
    fn rendezvous_truncates_to_shorter_side(
        payload in arb_payload(),
        recv_len in 0usize..32,
    ) {
        let mut table = MailboxTable::new();
        let id = table.create(0, 32).unwrap();
        table.try_send(id, Some(Pid::from_raw(2)), &payload, true).unwrap();
        match table.try_receive(id, None, recv_len, true).unwrap() {
            RecvStep::Data { bytes, wake } => {
                prop_assert_eq!(bytes.len(), payload.len().min(recv_len));
                prop_assert_eq!(&bytes[..], &payload[..bytes.len()]);
                prop_assert_eq!(wake, Some(Pid::from_raw(2)));
            }
            RecvStep::MustBlock => prop_assert!(false, "unexpected block"),
        }
        table.assert_invariants();
    }
}
