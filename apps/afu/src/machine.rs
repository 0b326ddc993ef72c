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

//! Per-context command generation: the machines behind the scheduler.
//!
//! Each machine free-runs (or fires once) against its config table,
//! waiting a randomized delay between commands and targeting randomized
//! aligned addresses in its memory window. After every completed command
//! the controller runs the status handshake with the host application:
//! write 0 to the status word, then poll it until the host writes 0xFF.

use rand::{Rng, SeedableRng};
use rand_xoshiro::Xoshiro256StarStar;
use tlx::event::{tlx_cmd, Response};
use tlx::{CommandRequest, CommandSource, Cycle, CACHELINE_BYTES};

/// Machine-level command codes held in the config table (a subset of the
/// wire opcodes).
pub mod machine_cmd {
    pub const PR_RD_WNITC: u16 = 0x12;
    pub const DMA_W: u16 = 0x20;
    pub const DMA_PR_W: u16 = 0x30;
    pub const INTRP_REQ: u16 = 0x58;
}

/// A command body in flight, dispatched by match rather than virtually.
#[derive(Clone, Debug)]
pub enum CommandBody {
    Load { ea: u64, size: u16 },
    Store { ea: u64, size: u16, payload: Vec<u8> },
    Other { code: u16 },
}

impl CommandBody {
    /// The wire request this body sends.
    pub fn request(&self) -> CommandRequest {
        match self {
            CommandBody::Load { ea, size } => CommandRequest {
                opcode: if *size >= CACHELINE_BYTES as u16 {
                    tlx_cmd::RD_WNITC
                } else {
                    tlx_cmd::PR_RD_WNITC
                },
                ea: *ea,
                dl: dl_for(*size),
                pl: pl_for(*size),
                ..CommandRequest::default()
            },
            CommandBody::Store { ea, size, payload } => CommandRequest {
                opcode: if *size >= CACHELINE_BYTES as u16 {
                    tlx_cmd::DMA_W
                } else {
                    tlx_cmd::DMA_PR_W
                },
                ea: *ea,
                dl: dl_for(*size),
                pl: pl_for(*size),
                data: Some(payload.clone()),
                ..CommandRequest::default()
            },
            CommandBody::Other { code } => CommandRequest {
                opcode: *code as u8,
                dl: 1,
                pl: 3,
                ..CommandRequest::default()
            },
        }
    }

    pub fn is_restart(&self) -> bool {
        // TLX defines no restart command; the hook mirrors the contract of
        // models that do
        match self {
            CommandBody::Load { .. } | CommandBody::Store { .. } => false,
            CommandBody::Other { .. } => false,
        }
    }
}

fn pl_for(size: u16) -> u8 {
    match size {
        1 => 0,
        2 => 1,
        4 => 2,
        _ => 3,
    }
}

fn dl_for(size: u16) -> u8 {
    match size {
        128 => 2,
        256 => 3,
        _ => 1,
    }
}

/// One machine's decoded config table plus its run state. The machine is
/// in flight exactly while it holds a command body.
#[derive(Clone, Debug)]
pub struct Machine {
    config: [u64; 4],
    cache_line: [u8; CACHELINE_BYTES],
    /// Cycle the next command may be offered.
    ready_at: Cycle,
    command: Option<CommandBody>,
}

impl Machine {
    pub fn from_words(config: [u64; 4]) -> Self {
        Self {
            config,
            cache_line: [0; CACHELINE_BYTES],
            ready_at: 0,
            command: None,
        }
    }

    pub fn is_enabled(&self) -> bool {
        (self.config[0] >> 63) & 0x1 == 1 || self.is_enabled_once()
    }

    pub fn is_enabled_once(&self) -> bool {
        (self.config[0] >> 62) & 0x1 == 1
    }

    fn disable_once(&mut self) {
        self.config[0] &= !(0x1u64 << 62);
    }

    pub fn command_code(&self) -> u16 {
        ((self.config[0] >> 48) & 0x1FFF) as u16
    }

    fn min_delay(&self) -> u16 {
        ((self.config[0] >> 16) & 0xFFFF) as u16
    }

    fn max_delay(&self) -> u16 {
        (self.config[0] & 0xFFFF) as u16
    }

    fn command_size(&self) -> u16 {
        ((self.config[1] >> 48) & 0xFFF) as u16
    }

    /// Parity bits riding in the config table; carried with the data,
    /// never consulted for control flow.
    pub fn parity_bits(&self) -> u8 {
        ((self.config[1] >> 44) & 0xF) as u8
    }

    fn memory_base(&self) -> u64 {
        self.config[2]
    }

    fn memory_size(&self) -> u64 {
        self.config[3]
    }

    pub fn is_completed(&self) -> bool {
        self.command.is_none()
    }

    /// Record issue state into the config table's status half, the way the
    /// host application reads progress back.
    fn record_command(&mut self, cycle: Cycle) {
        let stamp = (cycle as u64) & 0x7FFF;
        self.config[1] = (self.config[1] & !0xFFFFu64) | stamp;
    }

    fn record_response(&mut self, cycle: Cycle, code: u8) {
        let stamp = ((cycle as u64) & 0x7FFF) << 16;
        self.config[1] = (self.config[1] & !0xFFFF_0000u64) | stamp;
        self.config[1] = (self.config[1] & !0xFF_0000_0000u64) | ((code as u64) << 32);
    }

    fn roll_delay(&mut self, now: Cycle, rng: &mut Xoshiro256StarStar) {
        let (min, max) = (self.min_delay() as usize, self.max_delay() as usize);
        let delay = if max <= min {
            max
        } else {
            rng.gen_range(min..max)
        };
        self.ready_at = now + delay;
    }

    /// Build the next command body at a randomized aligned offset inside
    /// the machine's memory window.
    fn prepare(&mut self, rng: &mut Xoshiro256StarStar) -> Option<CommandBody> {
        let size = self.command_size().max(1);
        let window = self.memory_size();
        if window < size as u64 {
            log::warn!(
                "machine: window 0x{:x} smaller than command size {}",
                window,
                size
            );
            return None;
        }
        let span = window - (size as u64 - 1);
        let offset = rng.gen_range(0..span) & !(size as u64 - 1);
        let ea = self.memory_base() + offset;
        let body = match self.command_code() {
            machine_cmd::PR_RD_WNITC => CommandBody::Load { ea, size },
            machine_cmd::DMA_PR_W | machine_cmd::DMA_W => {
                let mut payload = vec![0u8; size.max(1) as usize];
                rng.fill(payload.as_mut_slice());
                CommandBody::Store { ea, size, payload }
            }
            machine_cmd::INTRP_REQ => CommandBody::Other {
                code: machine_cmd::INTRP_REQ,
            },
            code => {
                log::warn!("machine: command code 0x{:x} is not supported", code);
                return None;
            }
        };
        Some(body)
    }
}

/// What the controller is doing between machine commands.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Phase {
    Commands,
    StatusWrite,
    StatusPoll,
}

/// Which operation owns the in-flight tag.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum InFlight {
    Machine(usize),
    Status,
}

/// One per active context; the scheduler's command source.
pub struct MachineController {
    context: u16,
    machines: Vec<Machine>,
    status_address: u64,
    phase: Phase,
    in_flight: Option<InFlight>,
    prepared: Option<(InFlight, CommandBody)>,
    /// Low byte of the last polled status word.
    status_seen: Option<u8>,
    rng: Xoshiro256StarStar,
    /// Machine served last, for rotation inside the context.
    last_served: usize,
}

impl MachineController {
    pub fn new(context: u16, machines: Vec<Machine>, status_address: u64, seed: u64) -> Self {
        Self {
            context,
            machines,
            status_address,
            phase: Phase::Commands,
            in_flight: None,
            prepared: None,
            status_seen: None,
            rng: Xoshiro256StarStar::seed_from_u64(seed ^ context as u64),
            last_served: 0,
        }
    }

    fn prepare_machine_command(&mut self, cycle: Cycle) -> Option<(InFlight, CommandBody)> {
        let count = self.machines.len();
        for step in 0..count {
            let idx = (self.last_served + 1 + step) % count;
            let machine = &mut self.machines[idx];
            if !machine.is_enabled() || !machine.is_completed() || machine.ready_at > cycle {
                continue;
            }
            if let Some(body) = machine.prepare(&mut self.rng) {
                return Some((InFlight::Machine(idx), body));
            }
        }
        None
    }

    fn status_body(&self, poll: bool) -> CommandBody {
        if poll {
            CommandBody::Load {
                ea: self.status_address,
                size: 4,
            }
        } else {
            CommandBody::Store {
                ea: self.status_address,
                size: 4,
                payload: vec![0u8; 4],
            }
        }
    }
}

impl CommandSource for MachineController {
    fn context_id(&self) -> u16 {
        self.context
    }

    fn offer(&mut self, cycle: Cycle) -> Option<CommandRequest> {
        if self.in_flight.is_some() {
            return None;
        }
        if self.prepared.is_none() {
            self.prepared = match self.phase {
                Phase::Commands => self.prepare_machine_command(cycle),
                Phase::StatusWrite => Some((InFlight::Status, self.status_body(false))),
                Phase::StatusPoll => Some((InFlight::Status, self.status_body(true))),
            };
        }
        self.prepared.as_ref().map(|(_, body)| body.request())
    }

    fn issued(&mut self, cycle: Cycle) {
        let (owner, body) = match self.prepared.take() {
            Some(prepared) => prepared,
            None => {
                log::error!("machine: issue confirmation without an offer");
                return;
            }
        };
        if let InFlight::Machine(idx) = owner {
            let machine = &mut self.machines[idx];
            machine.command = Some(body);
            machine.record_command(cycle);
            if machine.is_enabled_once() {
                machine.disable_once();
            }
            self.last_served = idx;
        }
        self.in_flight = Some(owner);
    }

    fn response(&mut self, response: &Response, cycle: Cycle) {
        let owner = match self.in_flight.take() {
            Some(owner) => owner,
            None => {
                log::warn!(
                    "machine: context {} response with nothing in flight",
                    self.context
                );
                return;
            }
        };
        match owner {
            InFlight::Machine(idx) => {
                let machine = &mut self.machines[idx];
                let restarted = machine
                    .command
                    .take()
                    .map(|body| body.is_restart())
                    .unwrap_or(false);
                machine.record_response(cycle, response.code);
                machine.roll_delay(cycle, &mut self.rng);
                log::debug!(
                    "machine: context {} machine {} completed (code 0x{:x}{})",
                    self.context,
                    idx,
                    response.code,
                    if restarted { ", restart" } else { "" }
                );
                if self.status_address != 0 {
                    self.phase = Phase::StatusWrite;
                }
            }
            InFlight::Status => match self.phase {
                Phase::StatusWrite => {
                    self.phase = Phase::StatusPoll;
                    self.status_seen = None;
                }
                Phase::StatusPoll => {
                    // resolution happens when the polled beat arrives
                    if self.status_seen == Some(0xFF) {
                        self.phase = Phase::Commands;
                    }
                }
                Phase::Commands => {}
            },
        }
    }

    fn data_beat(&mut self, beat: &[u8; CACHELINE_BYTES], cycle: Cycle) {
        match self.phase {
            Phase::StatusPoll => {
                let offset = (self.status_address & 0x3F) as usize;
                self.status_seen = Some(beat[offset]);
                if beat[offset] == 0xFF {
                    log::debug!(
                        "machine: context {} host status ready at cycle {}",
                        self.context,
                        cycle
                    );
                    self.phase = Phase::Commands;
                }
            }
            _ => {
                // read data lands in the cache line of the machine that
                // asked for it; the response usually lands first, so fall
                // back to the machine served last
                let idx = match self.in_flight {
                    Some(InFlight::Machine(idx)) => Some(idx),
                    Some(InFlight::Status) => None,
                    None => Some(self.last_served),
                };
                if let Some(idx) = idx {
                    self.machines[idx].cache_line.copy_from_slice(beat);
                }
            }
        }
    }

    fn is_completed(&self) -> bool {
        // a prepared-but-never-granted body is only staged, not in flight;
        // it must not hold up a drain
        self.in_flight.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn machine(command: u16) -> Machine {
        let init = crate::descriptor::MachineInit {
            command,
            min_delay: 0,
            max_delay: 0,
            command_size: 4,
            base_address: 0x2000,
            memory_size: 0x100,
            abort: 0,
            parity: 0,
            enable_once: false,
        };
        Machine::from_words(init.pack(1))
    }

    fn response(code: u8) -> Response {
        Response {
            code,
            ..Response::default()
        }
    }

    #[test]
    fn test_load_addresses_stay_in_window_and_aligned() {
        let mut controller = MachineController::new(1, vec![machine(0x12)], 0, 7);
        for cycle in 0..32 {
            let request = controller.offer(cycle).expect("always-ready machine");
            assert_eq!(request.opcode, tlx_cmd::PR_RD_WNITC);
            assert!(request.ea >= 0x2000 && request.ea + 4 <= 0x2100);
            assert_eq!(request.ea % 4, 0);
            controller.issued(cycle);
            assert!(controller.offer(cycle).is_none(), "one in flight at a time");
            controller.response(&response(0), cycle);
        }
    }

    #[test]
    fn test_load_data_lands_in_cache_line() {
        let mut controller = MachineController::new(1, vec![machine(0x12)], 0, 21);
        controller.offer(0).unwrap();
        controller.issued(0);
        controller.response(&response(0), 1);
        let mut beat = [0u8; CACHELINE_BYTES];
        beat[0] = 0x5A;
        controller.data_beat(&beat, 2);
        assert_eq!(controller.machines[0].cache_line[0], 0x5A);
    }

    #[test]
    fn test_store_carries_payload() {
        let mut controller = MachineController::new(2, vec![machine(0x20)], 0, 9);
        let request = controller.offer(0).unwrap();
        assert_eq!(request.opcode, tlx_cmd::DMA_PR_W);
        assert_eq!(request.data.as_ref().unwrap().len(), 4);
    }

    #[test]
    fn test_delay_window_respected() {
        let init = crate::descriptor::MachineInit {
            command: 0x12,
            min_delay: 5,
            max_delay: 6,
            command_size: 4,
            base_address: 0,
            memory_size: 0x100,
            abort: 0,
            parity: 0,
            enable_once: false,
        };
        let mut controller =
            MachineController::new(3, vec![Machine::from_words(init.pack(3))], 0, 11);
        controller.offer(0).unwrap();
        controller.issued(0);
        controller.response(&response(0), 10);
        // the machine rolled a delay of exactly 5 (the only value in range)
        assert!(controller.offer(14).is_none());
        assert!(controller.offer(15).is_some());
    }

    #[test]
    fn test_enable_once_fires_a_single_command() {
        let init = crate::descriptor::MachineInit {
            command: 0x12,
            min_delay: 0,
            max_delay: 0,
            command_size: 4,
            base_address: 0,
            memory_size: 0x100,
            abort: 0,
            parity: 0,
            enable_once: true,
        };
        let mut controller =
            MachineController::new(4, vec![Machine::from_words(init.pack(4))], 0, 13);
        controller.offer(0).unwrap();
        controller.issued(0);
        controller.response(&response(0), 1);
        assert!(controller.offer(2).is_none());
        assert!(controller.is_completed());
    }

    #[test]
    fn test_status_handshake_after_completion() {
        let mut controller = MachineController::new(5, vec![machine(0x12)], 0x9000, 17);
        controller.offer(0).unwrap();
        controller.issued(0);
        controller.response(&response(0), 1);

        // status write of 0 comes first
        let request = controller.offer(2).unwrap();
        assert_eq!(request.ea, 0x9000);
        assert_eq!(request.data.as_ref().unwrap(), &vec![0u8; 4]);
        controller.issued(2);
        controller.response(&response(0), 3);

        // then the poll load, repeated until the host stores 0xFF
        let request = controller.offer(4).unwrap();
        assert_eq!(request.ea, 0x9000);
        assert!(request.data.is_none());
        controller.issued(4);
        let mut beat = [0u8; CACHELINE_BYTES];
        controller.data_beat(&beat, 5);
        controller.response(&response(0), 5);
        let request = controller.offer(6).unwrap();
        assert!(request.data.is_none(), "still polling");
        controller.issued(6);
        beat[0] = 0xFF;
        controller.data_beat(&beat, 7);
        controller.response(&response(0), 7);

        // handshake complete: back to machine commands
        let request = controller.offer(8).unwrap();
        assert_eq!(request.opcode, tlx_cmd::PR_RD_WNITC);
        assert!(request.ea >= 0x2000);
    }
}
