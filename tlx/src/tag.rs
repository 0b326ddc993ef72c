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

//! Correlation of asynchronous responses with the commands that caused
//! them, via a bounded pool of afutag values.

use crate::error::Error;
use std::collections::{BTreeMap, BTreeSet};

/// Who a tag was allocated for.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Requester {
    /// A per-context command machine.
    Context(u16),
    /// A link-control operation (assign_actag, status traffic).
    Control,
}

/// Bounded afutag pool. The pool size is fixed at bring-up to the
/// negotiated command-credit initial count, so live tags can never exceed
/// the commands the peer allows in flight.
#[derive(Clone, Debug, Default)]
pub struct TagRegistry {
    free: BTreeSet<u16>,
    bound: BTreeMap<u16, Requester>,
}

impl TagRegistry {
    pub fn new(pool_size: u16) -> Self {
        Self {
            free: (0..pool_size).collect(),
            bound: BTreeMap::new(),
        }
    }

    pub fn live(&self) -> usize {
        self.bound.len()
    }

    /// Bind the lowest free tag to `requester`.
    pub fn allocate(&mut self, requester: Requester) -> Result<u16, Error> {
        let tag = match self.free.iter().next() {
            Some(&tag) => tag,
            None => return Err(Error::TagPoolExhausted),
        };
        self.free.remove(&tag);
        self.bound.insert(tag, requester);
        log::trace!("tag: 0x{:04x} bound to {:?}", tag, requester);
        Ok(tag)
    }

    /// Look up the requester a live tag is bound to. An unknown tag means
    /// lost or duplicated correlation state upstream.
    pub fn resolve(&self, tag: u16) -> Result<Requester, Error> {
        self.bound.get(&tag).copied().ok_or(Error::UnknownTag(tag))
    }

    /// Unbind a tag, returning it to the pool for reuse.
    pub fn release(&mut self, tag: u16) -> Result<Requester, Error> {
        let requester = self.bound.remove(&tag).ok_or(Error::UnknownTag(tag))?;
        self.free.insert(tag);
        log::trace!("tag: 0x{:04x} released from {:?}", tag, requester);
        Ok(requester)
    }

    /// Drop every live binding, reporting how many were in flight. Used
    /// when the session tears down so aborted transfers do not leak tags.
    pub fn release_all(&mut self) -> usize {
        let dropped = self.bound.len();
        for (&tag, _) in std::mem::take(&mut self.bound).iter() {
            self.free.insert(tag);
        }
        dropped
    }
}
