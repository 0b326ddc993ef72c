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

//! Round-robin arbitration over per-context command sources.
//!
//! At most one command enters the link per cycle. The rotation starts just
//! after the previously served source; serving moves a source to the back,
//! declining costs nothing.

use crate::event::{Response, CACHELINE_BYTES};
use crate::Cycle;
use itertools::Itertools;
use std::collections::{HashMap, VecDeque};

/// Ready-to-send command parameters supplied by a source.
#[derive(Clone, Debug, Default)]
pub struct CommandRequest {
    pub opcode: u8,
    pub ea: u64,
    pub dl: u8,
    pub pl: u8,
    pub be: u64,
    pub flag: u8,
    pub endian: bool,
    pub pasid: u32,
    pub pg_size: u8,
    /// Payload for write-class commands, in 64-byte beats.
    pub data: Option<Vec<u8>>,
}

/// A per-context generator of commands (the test/demo boundary).
pub trait CommandSource {
    fn context_id(&self) -> u16;

    /// Offered an issue slot. `None` declines (e.g. an internal delay has
    /// not elapsed). The offer must be repeatable: nothing is committed
    /// until [`CommandSource::issued`] is called.
    fn offer(&mut self, cycle: Cycle) -> Option<CommandRequest>;

    /// The offered command went onto the wire this cycle.
    fn issued(&mut self, cycle: Cycle);

    /// A terminal response for a command this source issued.
    fn response(&mut self, response: &Response, cycle: Cycle);

    /// One beat of read data for this source's outstanding load.
    fn data_beat(&mut self, beat: &[u8; CACHELINE_BYTES], cycle: Cycle) {
        let _ = (beat, cycle);
    }

    /// True once the source has no command in flight and nothing prepared.
    fn is_completed(&self) -> bool;
}

#[derive(Default)]
pub struct CommandScheduler {
    sources: HashMap<u16, Box<dyn CommandSource>>,
    rotation: VecDeque<u16>,
}

impl CommandScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a source. The rotation is (re)built in ascending context-id
    /// order; from then on it evolves only by the served-to-back rule.
    pub fn register(&mut self, source: Box<dyn CommandSource>) {
        let context = source.context_id();
        if self.sources.insert(context, source).is_some() {
            log::warn!("scheduler: context {} re-registered", context);
        }
        self.rotation = self.sources.keys().copied().sorted().collect();
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    pub fn source_mut(&mut self, context: u16) -> Option<&mut Box<dyn CommandSource>> {
        self.sources.get_mut(&context)
    }

    /// True when every registered source reports completion.
    pub fn all_completed(&self) -> bool {
        self.sources.values().all(|source| source.is_completed())
    }

    /// Drop all sources, e.g. on controller reset.
    pub fn clear(&mut self) {
        self.sources.clear();
        self.rotation.clear();
    }

    /// Offer one issue slot around the rotation. `grant` performs the
    /// actual issue (tag allocation, credits, emission) and says whether
    /// the command went out; on success the serving source moves to the
    /// back. A declining source keeps its place. A failed grant means the
    /// cycle's credit situation blocks any issue, so arbitration stops
    /// without rotating.
    pub fn arbitrate<F>(&mut self, cycle: Cycle, mut grant: F) -> Option<u16>
    where
        F: FnMut(u16, &CommandRequest) -> bool,
    {
        for idx in 0..self.rotation.len() {
            let context = self.rotation[idx];
            let source = match self.sources.get_mut(&context) {
                Some(source) => source,
                None => continue,
            };
            if let Some(request) = source.offer(cycle) {
                if grant(context, &request) {
                    source.issued(cycle);
                    let _ = self.rotation.remove(idx);
                    self.rotation.push_back(context);
                    log::trace!(
                        "scheduler: context {} issued opcode 0x{:02x} at cycle {}",
                        context,
                        request.opcode,
                        cycle
                    );
                    return Some(context);
                }
                return None;
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::cell::Cell;
    use std::rc::Rc;

    struct StubSource {
        context: u16,
        ready: Rc<Cell<bool>>,
        issued: usize,
        responded: usize,
    }

    impl StubSource {
        fn boxed(context: u16, ready: bool) -> Box<dyn CommandSource> {
            Self::switched(context, Rc::new(Cell::new(ready)))
        }

        fn switched(context: u16, ready: Rc<Cell<bool>>) -> Box<dyn CommandSource> {
            Box::new(Self {
                context,
                ready,
                issued: 0,
                responded: 0,
            })
        }
    }

    impl CommandSource for StubSource {
        fn context_id(&self) -> u16 {
            self.context
        }

        fn offer(&mut self, _cycle: Cycle) -> Option<CommandRequest> {
            if self.ready.get() {
                Some(CommandRequest {
                    opcode: 0x12,
                    ..CommandRequest::default()
                })
            } else {
                None
            }
        }

        fn issued(&mut self, _cycle: Cycle) {
            self.issued += 1;
        }

        fn response(&mut self, _response: &Response, _cycle: Cycle) {
            self.responded += 1;
        }

        fn is_completed(&self) -> bool {
            self.issued == self.responded
        }
    }

    #[test]
    fn test_round_robin_fairness_over_nine_slots() {
        let mut scheduler = CommandScheduler::new();
        for context in [1u16, 2, 3] {
            scheduler.register(StubSource::boxed(context, true));
        }
        let mut served = Vec::new();
        for cycle in 0..9 {
            served.push(scheduler.arbitrate(cycle, |_, _| true).unwrap());
        }
        assert_eq!(served, vec![1, 2, 3, 1, 2, 3, 1, 2, 3]);
    }

    #[test]
    fn test_decliner_keeps_rotation_slot() {
        let ready = Rc::new(Cell::new(false));
        let mut scheduler = CommandScheduler::new();
        scheduler.register(StubSource::switched(1, Rc::clone(&ready)));
        scheduler.register(StubSource::boxed(2, true));
        // context 1 declines, context 2 serves, twice in a row
        assert_eq!(scheduler.arbitrate(0, |_, _| true), Some(2));
        assert_eq!(scheduler.arbitrate(1, |_, _| true), Some(2));
        // once context 1 becomes ready it is still first in rotation
        ready.set(true);
        assert_eq!(scheduler.arbitrate(2, |_, _| true), Some(1));
    }

    #[test]
    fn test_failed_grant_stops_cycle_without_rotating() {
        let mut scheduler = CommandScheduler::new();
        scheduler.register(StubSource::boxed(1, true));
        scheduler.register(StubSource::boxed(2, true));
        // credits dry: nobody issues, rotation must not move
        assert_eq!(scheduler.arbitrate(0, |_, _| false), None);
        assert_eq!(scheduler.arbitrate(1, |_, _| true), Some(1));
    }

    #[test]
    fn test_at_most_one_issue_per_arbitration() {
        let mut scheduler = CommandScheduler::new();
        scheduler.register(StubSource::boxed(1, true));
        scheduler.register(StubSource::boxed(2, true));
        let mut grants = 0;
        scheduler.arbitrate(0, |_, _| {
            grants += 1;
            true
        });
        assert_eq!(grants, 1);
    }
}
