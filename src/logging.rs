// SPDX-FileCopyrightText: Copyright 2024 LG Electronics Inc.
// SPDX-License-Identifier: Apache-2.0

//! Structured logging helper.
//!
//! The logger is an injectable startup knob, but idiomatic Rust favors the
//! global `tracing` registry over a passed-in logger object, so this crate
//! emits `tracing` spans/events throughout and leaves subscriber
//! installation to the embedder. [`init`] is provided for embedders (and
//! this crate's own tests) that have not already set one up.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Install a global `tracing` subscriber filtered at `level` for the
/// `ec2emu` target, `warn` elsewhere. A no-op (returns `Err`, logged and
/// ignored by convention) if a subscriber is already installed.
pub fn init(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("ec2emu={level},warn")));

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .try_init();
}
