// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

use std::time::Duration;

/// How often a step's output is streamed while its worker is still running
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 1_000;
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(DEFAULT_POLL_INTERVAL_MS);
/// Pool size used when the number of available cores cannot be determined
pub const DEFAULT_CONCURRENCY_FALLBACK: usize = 4;
