// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

//! Observability module for structured logging and tracing.
//!
//! All diagnostic and operational log lines emitted by the parent process go
//! through message types in [`messages`]. Each message is a small struct with a
//! `Display` implementation, which keeps wording in one place and gives every
//! event a consistent set of structured fields.
//!
//! # Architecture
//!
//! Messages are organized by subsystem:
//! * `messages::coordinator` - parallel region lifecycle and error aggregation
//! * `messages::worker` - worker process lifecycle and per-step reporting
//! * `messages::pool` - task pool startup and queue feeding
//!
//! # Usage
//!
//! ```rust
//! use parstep::observability::messages::worker::WorkerStarted;
//! use parstep::observability::messages::StructuredLog;
//!
//! WorkerStarted {
//!     worker: 0,
//!     pid: 4242,
//!     steps: 1,
//! }
//! .log();
//! ```
//!
//! Worker processes do not log through here for step output: whatever a step
//! writes, including `tracing` output, lands in its output channel.

pub mod messages;
