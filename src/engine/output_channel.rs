// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

//! Per-step output spill file.
//!
//! The child writes the step's stdout/stderr straight into the file through its
//! inherited descriptor. The parent reads it through a separately opened handle
//! (its own file offset), so reading never disturbs the child's writes. Removal
//! is explicit: the parent reads to EOF after the worker reports the step, then
//! deletes the file.

use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, RawFd};
use std::path::Path;

use tempfile::NamedTempFile;

const DRAIN_CHUNK: usize = 8 * 1024;

#[derive(Debug)]
pub struct OutputChannel {
    file: NamedTempFile,
    reader: Option<File>,
}

impl OutputChannel {
    pub fn create() -> io::Result<Self> {
        let file = tempfile::Builder::new()
            .prefix("parstep-")
            .suffix(".log")
            .tempfile()?;
        Ok(Self { file, reader: None })
    }

    pub fn path(&self) -> &Path {
        self.file.path()
    }

    /// Descriptor the child redirects stdout/stderr onto.
    pub(crate) fn write_fd(&self) -> RawFd {
        self.file.as_file().as_raw_fd()
    }

    /// Copy everything written since the last drain into `sink`.
    ///
    /// With `silent` the bytes are consumed and discarded. Returns how many
    /// bytes were read.
    pub fn drain_into(&mut self, sink: &mut dyn Write, silent: bool) -> io::Result<usize> {
        if self.reader.is_none() {
            self.reader = Some(self.file.reopen()?);
        }
        let reader = match self.reader.as_mut() {
            Some(reader) => reader,
            None => return Ok(0),
        };

        let mut total = 0;
        let mut buf = [0u8; DRAIN_CHUNK];
        loop {
            let n = match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            };
            if !silent {
                sink.write_all(&buf[..n])?;
            }
            total += n;
        }
        if total > 0 && !silent {
            sink.flush()?;
        }
        Ok(total)
    }

    /// Delete the spill file.
    pub fn remove(self) -> io::Result<()> {
        drop(self.reader);
        self.file.close()
    }

    /// Child side: close the write descriptor and leave the file for the
    /// parent to read and delete.
    pub(crate) fn close_in_child(self) {
        let (file, path) = self.file.into_parts();
        drop(file);
        let _ = path.keep();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drains_incrementally_and_removes() {
        let mut channel = OutputChannel::create().unwrap();
        let path = channel.path().to_path_buf();
        let mut writer = channel.file.reopen().unwrap();
        let mut sink = Vec::new();

        writer.write_all(b"first ").unwrap();
        assert_eq!(channel.drain_into(&mut sink, false).unwrap(), 6);
        writer.write_all(b"second").unwrap();
        channel.drain_into(&mut sink, false).unwrap();
        assert_eq!(sink, b"first second");

        channel.remove().unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn silent_drain_discards_bytes() {
        let mut channel = OutputChannel::create().unwrap();
        let mut writer = channel.file.reopen().unwrap();
        let mut sink = Vec::new();

        writer.write_all(b"hidden").unwrap();
        assert_eq!(channel.drain_into(&mut sink, true).unwrap(), 6);
        writer.write_all(b"shown").unwrap();
        channel.drain_into(&mut sink, false).unwrap();

        assert_eq!(sink, b"shown");
        channel.remove().unwrap();
    }
}
