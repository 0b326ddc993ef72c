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

//! Credit-based flow control: four independent pools per direction.
//!
//! The session applies outbound issues before inbound returns within a
//! tick, so a return is visible to the next cycle's issue decision, never
//! the same one. Nothing in here enforces that ordering; it is the calling
//! convention of the tick loop.

use crate::error::Error;
use std::fmt;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum CreditKind {
    Cmd,
    CmdData,
    Resp,
    RespData,
}

impl CreditKind {
    pub const ALL: [CreditKind; 4] = [
        CreditKind::Cmd,
        CreditKind::CmdData,
        CreditKind::Resp,
        CreditKind::RespData,
    ];

    fn index(self) -> usize {
        match self {
            CreditKind::Cmd => 0,
            CreditKind::CmdData => 1,
            CreditKind::Resp => 2,
            CreditKind::RespData => 3,
        }
    }
}

impl fmt::Display for CreditKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            CreditKind::Cmd => "cmd".fmt(f),
            CreditKind::CmdData => "cmd-data".fmt(f),
            CreditKind::Resp => "resp".fmt(f),
            CreditKind::RespData => "resp-data".fmt(f),
        }
    }
}

#[derive(Clone, Copy, Debug, Default)]
struct CreditPool {
    initial: u8,
    available: u8,
    negotiated: bool,
}

/// The four pools of credits the peer has granted us for issuing.
#[derive(Clone, Debug, Default)]
pub struct CreditManager {
    pools: [CreditPool; 4],
}

impl CreditManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fix a pool's initial count. Called exactly once per pool at link
    /// bring-up; the count is immutable afterwards.
    pub fn negotiate(&mut self, kind: CreditKind, initial: u8) -> Result<(), Error> {
        let pool = &mut self.pools[kind.index()];
        if pool.negotiated {
            debug_assert!(false, "credit pool {} negotiated twice", kind);
            return Err(Error::CreditRenegotiation(kind));
        }
        pool.initial = initial;
        pool.available = initial;
        pool.negotiated = true;
        log::debug!("credit: {} pool negotiated at {}", kind, initial);
        Ok(())
    }

    pub fn initial(&self, kind: CreditKind) -> u8 {
        self.pools[kind.index()].initial
    }

    pub fn available(&self, kind: CreditKind) -> u8 {
        self.pools[kind.index()].available
    }

    /// Take one credit if any is available. On `false` the caller must not
    /// issue; state is unchanged.
    pub fn try_issue(&mut self, kind: CreditKind) -> bool {
        let pool = &mut self.pools[kind.index()];
        if pool.available == 0 {
            return false;
        }
        pool.available -= 1;
        true
    }

    /// Hand one credit back. A return beyond the initial count is a peer
    /// protocol violation; it is logged and dropped so duplicate returns
    /// cannot corrupt the accounting.
    pub fn return_credit(&mut self, kind: CreditKind) {
        let pool = &mut self.pools[kind.index()];
        if pool.available == pool.initial {
            log::warn!(
                "credit: excess {} return dropped (available already {})",
                kind,
                pool.initial
            );
            return;
        }
        pool.available += 1;
    }

    /// Forget all outstanding issues, e.g. when the controller resets.
    pub fn refill(&mut self) {
        for pool in self.pools.iter_mut() {
            pool.available = pool.initial;
        }
    }
}
