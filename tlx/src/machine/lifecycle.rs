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

//! Overall device lifecycle: enable, run, reset, drain, halt.
//!
//! The enable and reset conditions live in the device-control register and
//! are only re-evaluated after that register has been written: the session
//! reports a write to the control *offset* via
//! [`Lifecycle::note_control_write`]. The written value never doubles as
//! the trigger; only the addressed register does.

use crate::Cycle;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LifecycleState {
    Idle,
    Ready,
    Running,
    Resetting,
    DrainingResponses,
    Halted,
}

/// What the lifecycle machine can observe this cycle, assembled by the
/// session from the register file and the scheduler.
#[derive(Clone, Copy, Debug, Default)]
pub struct LifecycleView {
    /// Control-register enable bit.
    pub enabled: bool,
    /// Control-register reset/quiesce bit.
    pub reset: bool,
    /// Contexts discovered with at least one active machine.
    pub active_contexts: usize,
    /// External request to stop issuing and drain outstanding responses.
    pub drain_requested: bool,
    /// Every active context reports completion.
    pub all_complete: bool,
}

#[derive(Clone, Debug)]
pub struct Lifecycle {
    state: LifecycleState,
    /// A control-register write happened; enable/reset need a recheck.
    control_dirty: bool,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self {
            state: LifecycleState::Idle,
            control_dirty: false,
        }
    }
}

impl Lifecycle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    pub fn is_running(&self) -> bool {
        self.state == LifecycleState::Running
    }

    pub fn is_halted(&self) -> bool {
        self.state == LifecycleState::Halted
    }

    /// The device-control register was written; re-evaluate the enable and
    /// reset bits on the next advance.
    pub fn note_control_write(&mut self) {
        self.control_dirty = true;
    }

    /// Advance at most one transition. Returns the state entered, if any;
    /// the session performs the controller reset when `Resetting` comes
    /// back and re-arms credits/tags/queues before the machine reaches
    /// `Ready` again.
    pub fn advance(&mut self, cycle: Cycle, view: &LifecycleView) -> Option<LifecycleState> {
        let control_dirty = std::mem::replace(&mut self.control_dirty, false);
        let next = match self.state {
            LifecycleState::Idle => {
                if control_dirty && view.enabled {
                    Some(LifecycleState::Ready)
                } else {
                    None
                }
            }
            LifecycleState::Ready => {
                if control_dirty && view.reset {
                    Some(LifecycleState::Resetting)
                } else if view.active_contexts > 0 {
                    Some(LifecycleState::Running)
                } else {
                    None
                }
            }
            LifecycleState::Running => {
                if control_dirty && view.reset {
                    Some(LifecycleState::Resetting)
                } else if view.drain_requested {
                    Some(LifecycleState::DrainingResponses)
                } else {
                    None
                }
            }
            // the controller reset happens the cycle Resetting is
            // observed; the machine is ready again on the next edge
            LifecycleState::Resetting => Some(LifecycleState::Ready),
            LifecycleState::DrainingResponses => {
                if view.all_complete {
                    Some(LifecycleState::Halted)
                } else {
                    None
                }
            }
            LifecycleState::Halted => {
                if control_dirty && view.reset {
                    Some(LifecycleState::Resetting)
                } else {
                    None
                }
            }
        };
        if let Some(state) = next {
            log::debug!(
                "lifecycle: {:?} -> {:?} at cycle {}",
                self.state,
                state,
                cycle
            );
            self.state = state;
        } else if control_dirty {
            // a control write that changes nothing still clears the flag
            log::trace!("lifecycle: control write with no transition at cycle {}", cycle);
        }
        next
    }
}
