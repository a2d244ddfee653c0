// Copyright (c) 2019 Cloudflare, Inc. All rights reserved.
// SPDX-License-Identifier: BSD-3-Clause

//! Per-peer sequence-number reassembly. The encryption and decryption pools
//! finish packets belonging to the same peer out of order; a
//! [`Reassembler`] restores the order they were read from the interface or
//! the network before they are handed to the next stage.

use parking_lot::Mutex;
use std::collections::BTreeMap;

/// Bounds how far a single stalled packet can hold up delivery of the ones
/// behind it. Matches the staging queue depth, so a worker that never
/// finishes can delay at most one queue's worth of work.
const MAX_PENDING: usize = 1024;

struct State<T> {
    next: u64,
    pending: BTreeMap<u64, T>,
}

pub struct Reassembler<T> {
    state: Mutex<State<T>>,
}

impl<T> Reassembler<T> {
    pub fn new() -> Self {
        Reassembler {
            state: Mutex::new(State {
                next: 0,
                pending: BTreeMap::new(),
            }),
        }
    }

    /// Record that `seq` has completed with `item`, and drain every item
    /// that is now contiguous with the delivery cursor, in order.
    ///
    /// If `pending` is already at [`MAX_PENDING`] the cursor is advanced
    /// past the gap so the reassembler does not grow without bound when a
    /// job for one sequence number is lost or dropped upstream.
    pub fn complete(&self, seq: u64, item: T) -> Vec<T> {
        let mut state = self.state.lock();
        state.pending.insert(seq, item);

        if state.pending.len() > MAX_PENDING {
            // The item holding up delivery is never coming; skip past it
            // rather than stall every later packet indefinitely.
            let stuck = state.next;
            state.next = stuck + 1;
        }

        let mut ready = Vec::new();
        loop {
            let next = state.next;
            match state.pending.remove(&next) {
                Some(item) => {
                    ready.push(item);
                    state.next = next + 1;
                }
                None => break,
            }
        }
        ready
    }
}

impl<T> Default for Reassembler<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delivers_in_order_despite_out_of_order_completion() {
        let r: Reassembler<u32> = Reassembler::new();
        assert!(r.complete(1, 10).is_empty());
        assert!(r.complete(2, 20).is_empty());
        assert_eq!(r.complete(0, 0), vec![0, 10, 20]);
        assert_eq!(r.complete(3, 30), vec![30]);
    }

    #[test]
    fn skips_a_stuck_gap_once_the_backlog_grows_too_large() {
        let r: Reassembler<u32> = Reassembler::new();
        for seq in 1..=(MAX_PENDING as u64 + 1) {
            let drained = r.complete(seq, seq as u32);
            if seq as usize == MAX_PENDING + 1 {
                assert!(!drained.is_empty());
            }
        }
    }
}
