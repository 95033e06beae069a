// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Diagnostics: structured logging and the fatal-error path
//! OWNERS: @kernel-team
//! PUBLIC API: log module, fatal! macro

pub mod log;

/// Emits a kernel panic diagnostic (`function:line file: message`) on the
/// console and halts the machine. Never returns.
#[macro_export]
macro_rules! fatal {
    ($machine:expr, $($arg:tt)+) => {{
        $crate::hal::machine::console(format_args!(
            "KERNEL ERROR {}:{} {}: {}\n",
            module_path!(),
            line!(),
            file!(),
            format_args!($($arg)+)
        ));
        $machine.halt(1);
    }};
}
