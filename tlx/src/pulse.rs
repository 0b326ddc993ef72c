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

//! Minimum pulse widths for outward-facing valid/strobe signals.
//!
//! A hardware consumer needs a strobe held across clock edges to latch it.
//! Protocol logic asserts a signal once; the countdown here keeps the
//! outward level high for the required number of cycles and drops it
//! automatically, whether or not the consumer acted.

/// Cycles a strobe stays asserted after being driven.
pub const PULSE_WIDTH: u8 = 2;

/// The outward strobes with hardware pulse-width requirements.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Strobe {
    CmdValid,
    CmdDataValid,
    RespValid,
    RespDataValid,
    ConfigValid,
}

impl Strobe {
    const COUNT: usize = 5;

    fn index(self) -> usize {
        match self {
            Strobe::CmdValid => 0,
            Strobe::CmdDataValid => 1,
            Strobe::RespValid => 2,
            Strobe::RespDataValid => 3,
            Strobe::ConfigValid => 4,
        }
    }
}

/// Independent countdowns, one per strobe.
#[derive(Clone, Debug, Default)]
pub struct PulseBank {
    countdown: [u8; Strobe::COUNT],
}

impl PulseBank {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drive a strobe high for the next `PULSE_WIDTH` cycles (including the
    /// current one). Re-asserting restarts the countdown.
    pub fn assert(&mut self, strobe: Strobe) {
        self.countdown[strobe.index()] = PULSE_WIDTH;
    }

    /// The level a consumer sees this cycle.
    pub fn level(&self, strobe: Strobe) -> bool {
        self.countdown[strobe.index()] > 0
    }

    /// Advance one cycle: every live countdown drops by one.
    pub fn tick(&mut self) {
        for count in self.countdown.iter_mut() {
            *count = count.saturating_sub(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pulse_lasts_exactly_width_cycles() {
        let mut bank = PulseBank::new();
        bank.assert(Strobe::CmdValid);
        // cycle T
        assert!(bank.level(Strobe::CmdValid));
        bank.tick();
        // cycle T+1
        assert!(bank.level(Strobe::CmdValid));
        bank.tick();
        // cycle T+2: dropped regardless of consumer action
        assert!(!bank.level(Strobe::CmdValid));
    }

    #[test]
    fn test_strobes_do_not_interfere() {
        let mut bank = PulseBank::new();
        bank.assert(Strobe::RespValid);
        bank.tick();
        bank.assert(Strobe::RespDataValid);
        assert!(bank.level(Strobe::RespValid));
        assert!(bank.level(Strobe::RespDataValid));
        bank.tick();
        // resp expires one cycle before resp-data
        assert!(!bank.level(Strobe::RespValid));
        assert!(bank.level(Strobe::RespDataValid));
        bank.tick();
        assert!(!bank.level(Strobe::RespDataValid));
    }

    #[test]
    fn test_reassert_restarts_countdown() {
        let mut bank = PulseBank::new();
        bank.assert(Strobe::CmdDataValid);
        bank.tick();
        bank.assert(Strobe::CmdDataValid);
        bank.tick();
        assert!(bank.level(Strobe::CmdDataValid));
        bank.tick();
        assert!(!bank.level(Strobe::CmdDataValid));
    }
}
