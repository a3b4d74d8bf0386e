// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

//! Cross-process counting semaphore.
//!
//! A pipe pre-filled with one byte per permit, the same trick make's jobserver
//! uses: acquiring reads a byte (blocking while none are left), releasing writes
//! it back. Because the pipe is inherited across `fork`, every worker of one
//! coordinator run shares the same pool of permits.

use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::AsRawFd;

use nix::fcntl::OFlag;
use nix::unistd::pipe2;

use crate::engine::signals::{self, TOKEN};
use crate::errors::ParallelError;

/// Upper bound on permits; a single write of this many tokens never blocks.
pub const MAX_PERMITS: usize = 4096;

#[derive(Debug)]
pub struct Semaphore {
    reader: File,
    writer: File,
    capacity: usize,
}

impl Semaphore {
    /// Create a semaphore with `capacity` permits, clamped to `1..=MAX_PERMITS`.
    pub fn new(capacity: usize) -> Result<Self, ParallelError> {
        let capacity = capacity.clamp(1, MAX_PERMITS);
        let (read_end, write_end) = pipe2(OFlag::O_CLOEXEC)?;
        let reader = File::from(read_end);
        let mut writer = File::from(write_end);
        writer.write_all(&vec![TOKEN; capacity])?;

        Ok(Self {
            reader,
            writer,
            capacity,
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Block until a permit is available.
    ///
    /// The permit is registered with the fatal-signal handler, so a worker
    /// killed by SIGINT/SIGTERM still gives it back.
    pub fn acquire(&self) -> Result<Permit<'_>, ParallelError> {
        let mut token = [0u8; 1];
        loop {
            match (&self.reader).read(&mut token) {
                Ok(1) => break,
                Ok(_) => {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "semaphore pipe closed",
                    )
                    .into())
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }

        let slot = signals::track_token(self.writer.as_raw_fd());
        Ok(Permit {
            semaphore: self,
            slot,
        })
    }

    fn release(&self) -> io::Result<()> {
        loop {
            match (&self.writer).write(&[TOKEN]) {
                Ok(1) => return Ok(()),
                Ok(_) => return Err(io::Error::new(io::ErrorKind::WriteZero, "token not written")),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }
}

/// A held permit; released on drop.
#[derive(Debug)]
pub struct Permit<'a> {
    semaphore: &'a Semaphore,
    slot: Option<usize>,
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        let owns_release = match self.slot {
            Some(slot) => signals::untrack_token(slot),
            None => true,
        };
        if owns_release {
            if let Err(e) = self.semaphore.release() {
                tracing::warn!(error = %e, "failed to release semaphore permit");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn permits_are_returned_on_drop() {
        let semaphore = Semaphore::new(2).unwrap();
        assert_eq!(semaphore.capacity(), 2);

        let first = semaphore.acquire().unwrap();
        let second = semaphore.acquire().unwrap();
        drop(first);
        drop(second);

        // Both tokens are back, so two more acquisitions must not block.
        let _a = semaphore.acquire().unwrap();
        let _b = semaphore.acquire().unwrap();
    }

    #[test]
    fn capacity_is_clamped() {
        assert_eq!(Semaphore::new(0).unwrap().capacity(), 1);
        assert_eq!(Semaphore::new(MAX_PERMITS * 2).unwrap().capacity(), MAX_PERMITS);
    }
}
