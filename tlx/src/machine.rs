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

//! The protocol state machines: partial memory access, configuration-space
//! access, and device lifecycle. Each is advanced once per cycle by the
//! session; they share nothing except the credit manager and tag registry
//! passed in by the caller.

use crate::event::{Response, CACHELINE_BYTES};
use crate::Cycle;

mod config;
mod lifecycle;
mod partial;

pub use config::{ConfigAccess, ConfigState};
pub use lifecycle::{Lifecycle, LifecycleState, LifecycleView};
pub use partial::{PartialAccess, PartialState};

/// Cycles a machine waits for a data phase before aborting the transfer.
pub const DATA_PHASE_TIMEOUT: Cycle = 1000;

/// Cycles an emission retries for credit before the transfer is aborted.
pub const CREDIT_RETRY_BOUND: Cycle = 1000;

/// A response leaving a machine, with any inline data beats to stream.
#[derive(Clone, Debug, Default)]
pub struct ResponseEmission {
    pub response: Response,
    pub beats: Vec<[u8; CACHELINE_BYTES]>,
}
