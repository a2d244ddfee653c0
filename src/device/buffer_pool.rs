// Copyright (c) 2019 Cloudflare, Inc. All rights reserved.
// SPDX-License-Identifier: BSD-3-Clause

//! A fixed-size slab of reusable packet buffers shared by the data-plane
//! worker pools, so steady-state packet processing does not allocate.

use crossbeam_queue::ArrayQueue;
use std::time::{Duration, Instant};

/// Large enough for the interface MTU plus the handshake/transport header.
pub const BUFFER_SIZE: usize = 2048;

const POOL_CAPACITY: usize = 1024;
const ACQUIRE_POLL_INTERVAL: Duration = Duration::from_micros(200);
const ACQUIRE_TIMEOUT: Duration = Duration::from_millis(50);

/// A buffer checked out of a [`BufferPool`]. Dropping it without returning it
/// to the pool simply shrinks the pool; this is safe but wasteful.
pub struct PoolBuf {
    data: Box<[u8; BUFFER_SIZE]>,
    len: usize,
}

impl PoolBuf {
    fn new() -> Self {
        PoolBuf {
            data: Box::new([0u8; BUFFER_SIZE]),
            len: 0,
        }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data[..self.len]
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data[..]
    }

    pub fn set_len(&mut self, len: usize) {
        assert!(len <= BUFFER_SIZE);
        self.len = len;
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn fill(&mut self, src: &[u8]) {
        self.data[..src.len()].copy_from_slice(src);
        self.len = src.len();
    }
}

/// A bounded pool of [`BUFFER_SIZE`]-byte buffers used by the reader, UDP
/// receive, encryption, decryption and interface-writer pools to avoid
/// per-packet allocation on the hot path.
pub struct BufferPool {
    free: ArrayQueue<PoolBuf>,
}

impl BufferPool {
    pub fn new() -> Self {
        let free = ArrayQueue::new(POOL_CAPACITY);
        for _ in 0..POOL_CAPACITY {
            // Capacity matches the queue we just created; push cannot fail.
            let _ = free.push(PoolBuf::new());
        }
        BufferPool { free }
    }

    /// Acquire a buffer, polling briefly under pressure before giving up.
    /// Returning `None` means the caller should drop the packet it was
    /// about to stage rather than block indefinitely.
    pub fn acquire(&self) -> Option<PoolBuf> {
        if let Some(buf) = self.free.pop() {
            return Some(buf);
        }

        let deadline = Instant::now() + ACQUIRE_TIMEOUT;
        while Instant::now() < deadline {
            std::thread::sleep(ACQUIRE_POLL_INTERVAL);
            if let Some(buf) = self.free.pop() {
                return Some(buf);
            }
        }

        None
    }

    pub fn release(&self, mut buf: PoolBuf) {
        buf.len = 0;
        let _ = self.free.push(buf);
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new()
    }
}
