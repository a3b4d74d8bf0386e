// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

//! Fatal-signal bookkeeping for worker processes.
//!
//! When a worker receives SIGINT or SIGTERM it must still give back every
//! semaphore token it holds and report the interrupted step before dying. The
//! handler can only touch atomics and raw `write(2)`, so everything it needs is
//! kept in static atomics: the write ends of held token pipes, and the worker's
//! return pipe. The step report is a pre-encoded frame.

use std::os::fd::RawFd;
use std::sync::atomic::{AtomicI32, Ordering};

use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};

const NO_FD: RawFd = -1;

/// How many tokens one process can hold at once with signal-safe release.
const MAX_TRACKED_TOKENS: usize = 8;

static HELD_TOKENS: [AtomicI32; MAX_TRACKED_TOKENS] = [
    AtomicI32::new(NO_FD),
    AtomicI32::new(NO_FD),
    AtomicI32::new(NO_FD),
    AtomicI32::new(NO_FD),
    AtomicI32::new(NO_FD),
    AtomicI32::new(NO_FD),
    AtomicI32::new(NO_FD),
    AtomicI32::new(NO_FD),
];

static RETURN_FD: AtomicI32 = AtomicI32::new(NO_FD);

pub(crate) const TOKEN: u8 = b'+';

// These must decode as `Outcome::Failed(StepError::Fatal(..))`.
pub(crate) const FATAL_SIGINT_FRAME: &[u8] =
    b"{\"Failed\":{\"Fatal\":\"worker interrupted by SIGINT; remaining steps abandoned\"}}\n";
pub(crate) const FATAL_SIGTERM_FRAME: &[u8] =
    b"{\"Failed\":{\"Fatal\":\"worker terminated by SIGTERM; remaining steps abandoned\"}}\n";

/// Register a held token so a fatal signal gives it back.
///
/// Returns the tracking slot, or `None` if every slot is taken (the token is
/// then only released on normal drop).
pub(crate) fn track_token(release_fd: RawFd) -> Option<usize> {
    HELD_TOKENS.iter().position(|slot| {
        slot.compare_exchange(NO_FD, release_fd, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    })
}

/// Stop tracking a token. Returns true if the caller still owns the release,
/// false if a signal handler already gave the token back.
pub(crate) fn untrack_token(slot: usize) -> bool {
    HELD_TOKENS[slot].swap(NO_FD, Ordering::SeqCst) != NO_FD
}

/// Install SIGINT/SIGTERM handlers that report a fatal outcome on `return_fd`.
///
/// Only ever called inside a freshly forked worker.
pub(crate) fn install_fatal_handlers(return_fd: RawFd) -> nix::Result<()> {
    RETURN_FD.store(return_fd, Ordering::SeqCst);
    let action = SigAction::new(
        SigHandler::Handler(on_fatal_signal),
        SaFlags::empty(),
        SigSet::empty(),
    );
    // SAFETY: the handler only uses atomics and async-signal-safe libc calls.
    unsafe {
        sigaction(Signal::SIGINT, &action)?;
        sigaction(Signal::SIGTERM, &action)?;
    }
    Ok(())
}

/// Stop reporting fatal outcomes; used once the last step has been reported.
pub(crate) fn disarm() {
    RETURN_FD.store(NO_FD, Ordering::SeqCst);
}

extern "C" fn on_fatal_signal(signum: libc::c_int) {
    for slot in HELD_TOKENS.iter() {
        let fd = slot.swap(NO_FD, Ordering::SeqCst);
        if fd != NO_FD {
            raw_write(fd, &[TOKEN]);
        }
    }

    let frame = if signum == libc::SIGINT {
        FATAL_SIGINT_FRAME
    } else {
        FATAL_SIGTERM_FRAME
    };
    let fd = RETURN_FD.swap(NO_FD, Ordering::SeqCst);
    if fd != NO_FD {
        raw_write(fd, frame);
    }

    // Die with the original signal so the exit status stays truthful.
    unsafe {
        libc::signal(signum, libc::SIG_DFL);
        libc::raise(signum);
    }
}

fn raw_write(fd: RawFd, bytes: &[u8]) {
    let mut written = 0;
    while written < bytes.len() {
        let rest = &bytes[written..];
        let n = unsafe { libc::write(fd, rest.as_ptr().cast(), rest.len()) };
        if n > 0 {
            written += n as usize;
        } else if n < 0 && std::io::Error::last_os_error().raw_os_error() == Some(libc::EINTR) {
            continue;
        } else {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::step::Outcome;
    use crate::errors::StepError;

    #[test]
    fn fatal_frames_decode_as_fatal_outcomes() {
        for frame in [FATAL_SIGINT_FRAME, FATAL_SIGTERM_FRAME] {
            let outcome: Outcome<u32> = serde_json::from_slice(frame).unwrap();
            match outcome {
                Outcome::Failed(StepError::Fatal(message)) => {
                    assert!(message.contains("remaining steps abandoned"))
                }
                other => panic!("unexpected outcome: {:?}", other),
            }
        }
    }

    #[test]
    fn untracking_twice_releases_once() {
        let slot = track_token(1_000_000).expect("free slot");
        assert!(untrack_token(slot));
        assert!(!untrack_token(slot));
    }
}
