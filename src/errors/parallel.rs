// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

use thiserror::Error;

/// Errors from the process plumbing itself, as opposed to step failures.
#[derive(Debug, Error)]
pub enum ParallelError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("system call failed: {0}")]
    Os(#[from] nix::errno::Errno),

    #[error("failed to encode or decode a frame: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("worker already started; steps must be added before start()")]
    AlreadyStarted,

    #[error("worker has not been started")]
    NotStarted,

    #[error("work queue is closed; every consumer has exited")]
    QueueClosed,

    #[error("work queue frame of {0} bytes is too large")]
    FrameTooLarge(usize),
}
