// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

//! Cross-process FIFO work queue.
//!
//! The queue is an anonymous pipe created before the pool's workers are forked,
//! so every worker inherits both ends. The parent is the only producer; workers
//! consume. Each item travels as one frame:
//!
//! ```text
//! +----------------+---------------------------+
//! | length: u32 LE | JSON QueueFrame<A> (body) |
//! +----------------+---------------------------+
//! ```
//!
//! Consumers take a one-permit [`Semaphore`] around each frame read, so two
//! workers never interleave partial reads of the same frame. A `Done` frame is
//! the per-worker sentinel: each consumer stops at the first one it reads.

use std::fs::File;
use std::io::{self, Read, Write};
use std::marker::PhantomData;
use std::sync::{Arc, Mutex, MutexGuard};

use nix::fcntl::OFlag;
use nix::unistd::pipe2;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::engine::semaphore::Semaphore;
use crate::errors::ParallelError;

const MAX_FRAME: usize = u32::MAX as usize;

#[derive(Debug, Serialize, Deserialize)]
enum QueueFrame<T> {
    Task(T),
    Done,
}

#[derive(Debug)]
struct QueueEnds {
    reader: Mutex<Option<File>>,
    writer: Mutex<File>,
    read_lock: Semaphore,
}

/// A multi-process FIFO of `A` items.
///
/// Clones share the same pipe.
#[derive(Debug)]
pub struct WorkQueue<A> {
    ends: Arc<QueueEnds>,
    _items: PhantomData<fn(A) -> A>,
}

impl<A> Clone for WorkQueue<A> {
    fn clone(&self) -> Self {
        Self {
            ends: Arc::clone(&self.ends),
            _items: PhantomData,
        }
    }
}

impl<A> WorkQueue<A> {
    pub fn new() -> Result<Self, ParallelError> {
        let (read_end, write_end) = pipe2(OFlag::O_CLOEXEC)?;
        Ok(Self {
            ends: Arc::new(QueueEnds {
                reader: Mutex::new(Some(File::from(read_end))),
                writer: Mutex::new(File::from(write_end)),
                read_lock: Semaphore::new(1)?,
            }),
            _items: PhantomData,
        })
    }

    /// Enqueue one item. Blocks while the pipe is full.
    ///
    /// Fails with [`ParallelError::QueueClosed`] once every consumer is gone.
    pub fn put(&self, item: &A) -> Result<(), ParallelError>
    where
        A: Serialize,
    {
        self.send(&QueueFrame::Task(item))
    }

    /// Enqueue one stop sentinel; exactly one consumer will see it.
    pub fn put_sentinel(&self) -> Result<(), ParallelError> {
        self.send(&QueueFrame::<()>::Done)
    }

    /// Dequeue the next item, blocking until one arrives.
    ///
    /// Returns `None` at a sentinel or when every producer is gone.
    pub fn pop(&self) -> Result<Option<A>, ParallelError>
    where
        A: DeserializeOwned,
    {
        let reader = lock(&self.ends.reader);
        let Some(mut file) = reader.as_ref() else {
            return Err(ParallelError::QueueClosed);
        };

        let body = {
            let _permit = self.ends.read_lock.acquire()?;
            let mut header = [0u8; 4];
            if !read_exact_or_eof(&mut file, &mut header)? {
                return Ok(None);
            }
            let mut body = vec![0u8; u32::from_le_bytes(header) as usize];
            file.read_exact(&mut body)?;
            body
        };

        match serde_json::from_slice::<QueueFrame<A>>(&body)? {
            QueueFrame::Task(item) => Ok(Some(item)),
            QueueFrame::Done => Ok(None),
        }
    }

    /// Drop this process's copy of the read end.
    ///
    /// The producer calls this after forking its consumers, so a `put` fails
    /// instead of blocking forever once they have all exited.
    pub fn close_reader(&self) {
        lock(&self.ends.reader).take();
    }

    /// Like [`put`](Self::put), but the write happens on tokio's blocking
    /// pool, so a full pipe never stalls an async worker thread.
    pub async fn put_async(&self, item: &A) -> Result<(), ParallelError>
    where
        A: Serialize + 'static,
    {
        let bytes = encode(&QueueFrame::Task(item))?;
        self.write_off_runtime(bytes).await
    }

    /// Like [`put_sentinel`](Self::put_sentinel), off the async runtime.
    pub async fn put_sentinel_async(&self) -> Result<(), ParallelError>
    where
        A: 'static,
    {
        let bytes = encode(&QueueFrame::<()>::Done)?;
        self.write_off_runtime(bytes).await
    }

    async fn write_off_runtime(&self, bytes: Vec<u8>) -> Result<(), ParallelError>
    where
        A: 'static,
    {
        let queue = self.clone();
        tokio::task::spawn_blocking(move || queue.write_frame(&bytes))
            .await
            .map_err(|e| ParallelError::Io(io::Error::new(io::ErrorKind::Other, e)))?
    }

    fn send<T: Serialize>(&self, frame: &QueueFrame<T>) -> Result<(), ParallelError> {
        let bytes = encode(frame)?;
        self.write_frame(&bytes)
    }

    fn write_frame(&self, bytes: &[u8]) -> Result<(), ParallelError> {
        let mut writer = lock(&self.ends.writer);
        match writer.write_all(bytes) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::BrokenPipe => Err(ParallelError::QueueClosed),
            Err(e) => Err(e.into()),
        }
    }
}

fn encode<T: Serialize>(frame: &QueueFrame<T>) -> Result<Vec<u8>, ParallelError> {
    let body = serde_json::to_vec(frame)?;
    if body.len() > MAX_FRAME {
        return Err(ParallelError::FrameTooLarge(body.len()));
    }
    let mut bytes = Vec::with_capacity(4 + body.len());
    bytes.extend_from_slice(&(body.len() as u32).to_le_bytes());
    bytes.extend_from_slice(&body);
    Ok(bytes)
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Like `read_exact`, but a clean EOF before the first byte returns `false`.
fn read_exact_or_eof(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<bool> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) if filled == 0 => return Ok(false),
            Ok(0) => return Err(io::ErrorKind::UnexpectedEof.into()),
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn items_come_out_in_order_until_the_sentinel() {
        let queue: WorkQueue<String> = WorkQueue::new().unwrap();
        queue.put(&"one".to_string()).unwrap();
        queue.put(&"two".to_string()).unwrap();
        queue.put_sentinel().unwrap();
        queue.put(&"after".to_string()).unwrap();

        assert_eq!(queue.pop().unwrap().as_deref(), Some("one"));
        assert_eq!(queue.pop().unwrap().as_deref(), Some("two"));
        assert_eq!(queue.pop().unwrap(), None);
        // The sentinel only stops one consumer; the queue itself stays usable.
        assert_eq!(queue.pop().unwrap().as_deref(), Some("after"));
    }

    #[test]
    fn clones_share_the_pipe() {
        let producer: WorkQueue<(u32, bool)> = WorkQueue::new().unwrap();
        let consumer = producer.clone();
        producer.put(&(7, true)).unwrap();
        assert_eq!(consumer.pop().unwrap(), Some((7, true)));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn async_puts_fill_past_the_pipe_buffer_without_blocking_the_runtime() {
        let queue: WorkQueue<String> = WorkQueue::new().unwrap();
        let consumer = queue.clone();
        let item = "x".repeat(16 * 1024);

        // Eight 16 KiB frames exceed the default 64 KiB pipe buffer, so the
        // producer only finishes once the consumer below has made room.
        let producer = {
            let queue = queue.clone();
            let item = item.clone();
            tokio::spawn(async move {
                for _ in 0..8 {
                    queue.put_async(&item).await?;
                }
                queue.put_sentinel_async().await
            })
        };
        // Let the producer run until the pipe is full; the runtime thread must stay free.
        tokio::task::yield_now().await;

        let drained = tokio::task::spawn_blocking(move || {
            let mut count = 0;
            while let Some(popped) = consumer.pop().unwrap() {
                assert_eq!(popped.len(), 16 * 1024);
                count += 1;
            }
            count
        });

        let count = tokio::time::timeout(Duration::from_secs(5), drained)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(count, 8);
        producer.await.unwrap().unwrap();
    }

    #[test]
    fn pop_fails_after_the_reader_is_closed() {
        let queue: WorkQueue<u8> = WorkQueue::new().unwrap();
        queue.put(&1).unwrap();
        queue.close_reader();
        assert!(matches!(queue.pop(), Err(ParallelError::QueueClosed)));
    }
}
