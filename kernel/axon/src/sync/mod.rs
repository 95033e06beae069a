// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Lock helpers for kernel state
//! OWNERS: @kernel-team
//! PUBLIC API: IntLock

mod int_lock;

pub use int_lock::IntLock;
