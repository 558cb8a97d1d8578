// SPDX-FileCopyrightText: Copyright 2024 LG Electronics Inc.
// SPDX-License-Identifier: Apache-2.0

//! In-process dispatcher and reconciliation kernel for a local EC2 / Auto
//! Scaling control-plane emulator.
//!
//! This crate owns the state machine that serializes control-plane
//! mutations, keeps a derived resource graph consistent with an external
//! container runtime, runs the Auto Scaling control loop, schedules spot
//! interruptions, and serves the Instance Metadata Service. The AWS
//! query-protocol front-end, the concrete runtime client, and the CLI are
//! external collaborators an embedder wires in around [`Dispatcher`].

pub mod asg;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod executor;
pub mod exit;
pub mod fault;
pub mod imds;
pub mod lifecycle;
pub mod logging;
pub mod spot;
pub mod store;

pub use config::{EngineConfig, ExitMode};
pub use dispatcher::action::{Action, Response};
pub use dispatcher::{Dispatcher, DispatcherState};
pub use error::{Error, Result};
pub use executor::{Executor, ExecutorError, ExecutorResult};
pub use imds::ImdsState;
