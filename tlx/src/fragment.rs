// Copyright 2023 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Multi-beat data (de)fragmentation.
//!
//! Inbound transfers larger than one beat are parked here until the
//! consumer pulls them out with read-count requests, one beat per cycle.
//! The queue owns its packets outright; removing the last element is a
//! single well-defined operation, so there is no tail reference to leave
//! dangling.

use crate::error::Error;
use crate::event::CACHELINE_BYTES;
use std::collections::VecDeque;

#[derive(Clone, Debug, Default)]
pub struct FragmentQueue {
    beats: VecDeque<[u8; CACHELINE_BYTES]>,
    /// Beats the consumer has asked for but not yet received.
    pending_reads: usize,
    /// Beats still expected for the transfer currently being assembled.
    inbound_remaining: usize,
}

impl FragmentQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn queued(&self) -> usize {
        self.beats.len()
    }

    pub fn pending_reads(&self) -> usize {
        self.pending_reads
    }

    pub fn is_idle(&self) -> bool {
        self.beats.is_empty() && self.pending_reads == 0 && self.inbound_remaining == 0
    }

    /// Announce a transfer of `beat_count` beats whose payload will arrive
    /// over the following cycles. Starting a new transfer while a drain of
    /// the previous one is still in flight loses beat attribution, so it
    /// is refused.
    pub fn begin_transfer(&mut self, beat_count: usize) -> Result<(), Error> {
        if self.inbound_remaining > 0 {
            return Err(Error::ConcurrentFragmentConflict);
        }
        self.inbound_remaining = beat_count;
        Ok(())
    }

    /// Append one arrived beat to the tail of the assembly queue.
    pub fn push_beat(&mut self, beat: [u8; CACHELINE_BYTES]) {
        if self.inbound_remaining == 0 {
            // a beat with no announced transfer still gets queued; the
            // consumer's read counts decide when it drains
            log::warn!("fragment: unannounced data beat queued");
        } else {
            self.inbound_remaining -= 1;
        }
        self.beats.push_back(beat);
    }

    /// Split `payload` into `beat_count` beats and append them in address
    /// order. Convenience for transfers that arrive fully assembled.
    pub fn enqueue_beats(&mut self, payload: &[u8], beat_count: usize) -> Result<(), Error> {
        debug_assert!(payload.len() >= beat_count * CACHELINE_BYTES);
        self.begin_transfer(beat_count)?;
        for chunk in payload.chunks_exact(CACHELINE_BYTES).take(beat_count) {
            let mut beat = [0u8; CACHELINE_BYTES];
            beat.copy_from_slice(chunk);
            self.push_beat(beat);
        }
        Ok(())
    }

    /// Accumulate a consumer-issued read count.
    pub fn add_read_count(&mut self, beats: usize) {
        self.pending_reads += beats;
    }

    /// Pop the next beat if the consumer has asked for one. At most one
    /// beat leaves per cycle; the session calls this once per tick.
    pub fn next_beat(&mut self) -> Option<[u8; CACHELINE_BYTES]> {
        if self.pending_reads == 0 {
            return None;
        }
        match self.beats.pop_front() {
            Some(beat) => {
                self.pending_reads -= 1;
                Some(beat)
            }
            None => {
                // data underrun: the request stays pending and is satisfied
                // when the beat arrives
                log::warn!(
                    "fragment: drain underrun ({} reads pending, queue empty)",
                    self.pending_reads
                );
                None
            }
        }
    }

    /// Remove up to `read_count` beats from the head in FIFO order. Returns
    /// fewer than requested only if the queue is exhausted (underrun,
    /// logged; the consumer may poll again).
    pub fn drain(&mut self, read_count: usize) -> Vec<[u8; CACHELINE_BYTES]> {
        self.add_read_count(read_count);
        let mut out = Vec::with_capacity(read_count);
        while out.len() < read_count {
            match self.next_beat() {
                Some(beat) => out.push(beat),
                None => break,
            }
        }
        out
    }

    /// Drop everything buffered or expected, reporting how many beats were
    /// thrown away. Used on transfer abort and session teardown.
    pub fn clear(&mut self) -> usize {
        let dropped = self.beats.len();
        self.beats.clear();
        self.pending_reads = 0;
        self.inbound_remaining = 0;
        dropped
    }
}
