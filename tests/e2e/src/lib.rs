// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

#![forbid(unsafe_code)]

//! Shared helpers for the AXON end-to-end scenarios: boot a machine, run a
//! user entry process under the full driver stack, and collect results
//! through shared cells.

use std::sync::{Arc, Mutex};

use axon::{BootConfig, Kernel};

/// A value cell shared between the host test and kernel processes.
pub type Cell<T> = Arc<Mutex<T>>;

pub fn cell<T>(value: T) -> Cell<T> {
    Arc::new(Mutex::new(value))
}

pub fn set<T>(cell: &Cell<T>, value: T) {
    *cell.lock().expect("cell poisoned") = value;
}

pub fn get<T: Clone>(cell: &Cell<T>) -> T {
    cell.lock().expect("cell poisoned").clone()
}

/// Boots a default machine and runs `entry` as the user process. Returns
/// the machine halt code (0 for a clean run).
pub fn run_kernel<F>(entry: F) -> i32
where
    F: FnOnce(&Arc<Kernel>, &str) -> i32 + Send + 'static,
{
    axon::boot(BootConfig::default(), Box::new(entry))
}

/// Like `run_kernel` with an explicit machine/boot configuration.
pub fn run_kernel_with<F>(config: BootConfig, entry: F) -> i32
where
    F: FnOnce(&Arc<Kernel>, &str) -> i32 + Send + 'static,
{
    axon::boot(config, Box::new(entry))
}
