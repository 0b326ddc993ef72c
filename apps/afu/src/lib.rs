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

//! The software AFU: a device model serving one end of the TLX bridge.
//!
//! It answers the host's configuration and memory traffic through the
//! protocol session, and once enabled discovers its contexts and lets
//! their machines generate randomized command streams back at the host.

use anyhow::Context;
use std::collections::HashSet;
use std::path::Path;
use tlx::{Channel, Cycle, InitialCredits, LifecycleState, Listener, Session, TickStatus, VcdTrace};

mod descriptor;
mod machine;

pub use crate::descriptor::{
    ContextInit, Descriptor, DescriptorConfig, MachineInit, RegisterInit, CONTEXT_STRIDE,
    MACHINE_STRIDE, MAX_CONTEXTS, MAX_MACHINES,
};
pub use crate::machine::{machine_cmd, CommandBody, Machine, MachineController};

/// Credits this endpoint grants the host at bring-up.
pub const INITIAL_CMD_CREDITS: u8 = 8;
pub const INITIAL_CMD_DATA_CREDITS: u8 = 8;
pub const INITIAL_RESP_CREDITS: u8 = 7;
pub const INITIAL_RESP_DATA_CREDITS: u8 = 8;

pub struct Afu {
    session: Session<Descriptor>,
    config: DescriptorConfig,
    seed: u64,
    registered: HashSet<u16>,
    drain_after: Option<Cycle>,
}

impl Afu {
    /// Bind the responder port, wait for the host simulator, and set up
    /// the session around the seeded descriptor.
    pub fn serve(
        base_port: u16,
        config: DescriptorConfig,
        seed: u64,
        vcd_path: Option<&Path>,
    ) -> anyhow::Result<Self> {
        let listener = Listener::bind(base_port).context("binding responder socket")?;
        log::info!(
            "afu: '{}' listening on port {}",
            config.name,
            listener.port()
        );
        let channel = listener.accept().context("waiting for host simulator")?;
        let mut device = Self::attach(channel, config, seed);
        if let Some(path) = vcd_path {
            let trace = VcdTrace::create(path, Session::<Descriptor>::TRACE_SIGNALS)
                .context("creating VCD trace")?;
            device.session.set_trace(trace);
        }
        Ok(device)
    }

    /// Build the device around an already-established channel.
    pub fn attach(channel: Channel, config: DescriptorConfig, seed: u64) -> Self {
        let descriptor = Descriptor::from_config(&config);
        let session = Session::new(channel, descriptor);
        Self {
            session,
            config,
            seed,
            registered: HashSet::new(),
            drain_after: None,
        }
    }

    /// Raise the drain request once the given cycle is reached.
    pub fn set_drain_after(&mut self, cycles: Cycle) {
        self.drain_after = Some(cycles);
    }

    pub fn lifecycle_state(&self) -> LifecycleState {
        self.session.lifecycle_state()
    }

    /// Run the device until the host disconnects.
    pub fn run(&mut self) -> anyhow::Result<()> {
        self.session
            .bring_up(InitialCredits {
                cmd: INITIAL_CMD_CREDITS,
                cmd_data: INITIAL_CMD_DATA_CREDITS,
                resp: INITIAL_RESP_CREDITS,
                resp_data: INITIAL_RESP_DATA_CREDITS,
            })
            .context("credit negotiation")?;
        loop {
            match self.session.tick().context("session tick")? {
                TickStatus::Disconnected => break,
                TickStatus::Active => {}
            }
            if self.session.lifecycle_state() == LifecycleState::Ready {
                self.discover_contexts();
            }
            if let Some(limit) = self.drain_after {
                if self.session.cycle() >= limit {
                    self.session.request_drain();
                }
            }
        }
        log::info!(
            "afu: host disconnected after {} cycles ({:?})",
            self.session.cycle(),
            self.session.lifecycle_state()
        );
        Ok(())
    }

    /// Scan the per-context MMIO blocks for machine tables the host (or
    /// the descriptor seed) has armed, and put a controller behind each.
    fn discover_contexts(&mut self) {
        let mut found = Vec::new();
        for ctx in 1..=MAX_CONTEXTS {
            if self.registered.contains(&ctx) {
                continue;
            }
            let base = CONTEXT_STRIDE * ctx as u64;
            let regs = self.session.regs();
            let mut machines = Vec::new();
            for m in 0..MAX_MACHINES {
                let offset = base + MACHINE_STRIDE * m as u64;
                let word0 = regs.read_qword(offset);
                if (word0 >> 62) & 0x3 == 0 {
                    continue;
                }
                let words = [
                    word0,
                    regs.read_qword(offset + 8),
                    regs.read_qword(offset + 16),
                    regs.read_qword(offset + 24),
                ];
                let machine = Machine::from_words(words);
                log::debug!(
                    "afu: context {} machine {} code 0x{:x} parity 0x{:x}",
                    ctx,
                    m,
                    machine.command_code(),
                    machine.parity_bits()
                );
                machines.push(machine);
            }
            if machines.is_empty() {
                continue;
            }
            let status_address = self
                .config
                .contexts
                .iter()
                .find(|c| c.context == ctx)
                .map(|c| c.status_address)
                .unwrap_or(0);
            found.push((ctx, machines, status_address));
        }
        for (ctx, machines, status_address) in found {
            log::info!(
                "afu: context {} armed with {} machine(s)",
                ctx,
                machines.len()
            );
            let controller = MachineController::new(ctx, machines, status_address, self.seed);
            self.session.register_source(Box::new(controller));
            self.registered.insert(ctx);
        }
    }
}
