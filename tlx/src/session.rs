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

//! The device-side session: one object owning every piece of link state,
//! advanced one tick per inbound clock edge.
//!
//! Tick order matters for the credit contract: outbound issues see the
//! pools as of the previous cycle, and the peer's credit returns are
//! applied only after this cycle's outbound snapshot is built. Within a
//! tick nothing blocks except the transport poll.

use crate::credit::{CreditKind, CreditManager};
use crate::error::Error;
use crate::event::{
    decode_dl, decode_rd_cnt, encode_rd_cnt, tl_resp, tlx_cmd, Command, CreditReturn, DataBeat,
    EventSnapshot, InitialCredits, ReadRequest, Response, CACHELINE_BYTES,
};
use crate::fragment::FragmentQueue;
use crate::machine::{ConfigAccess, Lifecycle, LifecycleState, LifecycleView, PartialAccess};
use crate::pulse::{PulseBank, Strobe};
use crate::regfile::{RegisterFile, AFU_CONTROL_REG, AFU_ENABLE_BIT, AFU_RESET_BIT};
use crate::scheduler::{CommandScheduler, CommandSource};
use crate::tag::{Requester, TagRegistry};
use crate::transport::Channel;
use crate::vcd::VcdTrace;
use crate::Cycle;
use std::collections::VecDeque;

/// Link-level identity driven into every outbound command.
#[derive(Clone, Copy, Debug, Default)]
pub struct LinkIdentity {
    pub bdf: u16,
    pub actag: u16,
    pub stream_id: u8,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TickStatus {
    Active,
    Disconnected,
}

pub struct Session<R: RegisterFile> {
    channel: Channel,
    regs: R,
    credits: CreditManager,
    tags: TagRegistry,
    partial: PartialAccess,
    config: ConfigAccess,
    lifecycle: Lifecycle,
    scheduler: CommandScheduler,
    pulses: PulseBank,
    /// Inbound response data awaiting delivery to the loads that asked.
    resp_data_in: FragmentQueue,
    /// (requester, beats outstanding) per in-flight load, FIFO.
    drains: VecDeque<(Requester, usize)>,
    /// Outbound response beats not yet driven (one leaves per cycle).
    out_resp_beats: VecDeque<[u8; CACHELINE_BYTES]>,
    /// Outbound command data beats not yet driven.
    out_cmd_beats: VecDeque<[u8; CACHELINE_BYTES]>,
    identity: LinkIdentity,
    pasid: u32,
    drain_requested: bool,
    actag_pending: bool,
    trace: Option<VcdTrace>,
}

impl<R: RegisterFile> Session<R> {
    pub fn new(channel: Channel, regs: R) -> Self {
        Self {
            channel,
            regs,
            credits: CreditManager::new(),
            tags: TagRegistry::default(),
            partial: PartialAccess::new(),
            config: ConfigAccess::new(),
            lifecycle: Lifecycle::new(),
            scheduler: CommandScheduler::new(),
            pulses: PulseBank::new(),
            resp_data_in: FragmentQueue::new(),
            drains: VecDeque::new(),
            out_resp_beats: VecDeque::new(),
            out_cmd_beats: VecDeque::new(),
            identity: LinkIdentity {
                actag: 0x01,
                ..LinkIdentity::default()
            },
            pasid: 0,
            drain_requested: false,
            actag_pending: false,
            trace: None,
        }
    }

    /// Signals declared when a VCD trace is attached.
    pub const TRACE_SIGNALS: &'static [(&'static str, u32)] = &[
        ("cmd_valid", 1),
        ("cmd_data_valid", 1),
        ("resp_valid", 1),
        ("resp_data_valid", 1),
        ("cfg_valid", 1),
        ("cmd_credits", 8),
        ("cmd_data_credits", 8),
        ("resp_credits", 8),
        ("resp_data_credits", 8),
        ("live_tags", 8),
    ];

    pub fn set_trace(&mut self, trace: VcdTrace) {
        self.trace = Some(trace);
    }

    pub fn regs(&self) -> &R {
        &self.regs
    }

    pub fn cycle(&self) -> Cycle {
        self.channel.cycle()
    }

    pub fn lifecycle_state(&self) -> LifecycleState {
        self.lifecycle.state()
    }

    pub fn credits(&self) -> &CreditManager {
        &self.credits
    }

    /// The level an adjacent hardware block would see on a strobe this
    /// cycle (held for the pulse width regardless of consumer action).
    pub fn strobe_level(&self, strobe: Strobe) -> bool {
        self.pulses.level(strobe)
    }

    pub fn register_source(&mut self, source: Box<dyn CommandSource>) {
        self.scheduler.register(source);
    }

    /// Ask the lifecycle machine to stop issuing and drain to Halted.
    pub fn request_drain(&mut self) {
        self.drain_requested = true;
    }

    /// Exchange initial credit advertisements. Our advertisement tells the
    /// peer what we absorb; theirs seeds the issue pools and sizes the tag
    /// registry. Called once, before the first tick.
    pub fn bring_up(&mut self, ours: InitialCredits) -> Result<(), Error> {
        self.channel.send(EventSnapshot {
            initial_credits: Some(ours),
            ..EventSnapshot::default()
        });
        self.channel.flush()?;
        loop {
            let snapshot = match self.channel.poll()? {
                Some(snapshot) => snapshot,
                None => {
                    return Err(Error::TransportError(
                        "link closed during bring-up".to_string(),
                    ))
                }
            };
            if let Some(theirs) = snapshot.initial_credits {
                self.negotiate(&theirs)?;
                return Ok(());
            }
            if !snapshot.is_empty() {
                log::warn!("session: pre-negotiation snapshot dropped");
            }
            // mark the edge so the peer keeps clocking
            self.channel.flush()?;
        }
    }

    fn negotiate(&mut self, theirs: &InitialCredits) -> Result<(), Error> {
        self.credits.negotiate(CreditKind::Cmd, theirs.cmd)?;
        self.credits.negotiate(CreditKind::CmdData, theirs.cmd_data)?;
        self.credits.negotiate(CreditKind::Resp, theirs.resp)?;
        self.credits.negotiate(CreditKind::RespData, theirs.resp_data)?;
        self.tags = TagRegistry::new(theirs.cmd as u16);
        log::info!(
            "session: negotiated credits cmd={} cmd-data={} resp={} resp-data={}",
            theirs.cmd,
            theirs.cmd_data,
            theirs.resp,
            theirs.resp_data
        );
        Ok(())
    }

    /// Run ticks until the peer disconnects.
    pub fn run(&mut self) -> Result<(), Error> {
        loop {
            if self.tick()? == TickStatus::Disconnected {
                return Ok(());
            }
        }
    }

    /// Process one clock edge: consume the inbound snapshot, advance every
    /// machine, and drive the outbound snapshot.
    pub fn tick(&mut self) -> Result<TickStatus, Error> {
        let snapshot = match self.channel.poll()? {
            Some(snapshot) => snapshot,
            None => {
                self.shutdown();
                return Ok(TickStatus::Disconnected);
            }
        };
        let cycle = self.channel.cycle();
        self.pulses.tick();

        let mut outbound = EventSnapshot::default();
        let mut returns = CreditReturn::default();
        let staged_returns = snapshot.credit_return.clone();

        if let Some(theirs) = &snapshot.initial_credits {
            // a re-advertisement mid-session is a peer bug
            if let Err(err) = self.negotiate(theirs) {
                log::warn!("session: cycle {}: {}", cycle, err);
            }
        }

        // inbound command/config/response traffic
        if let Some(cfg) = &snapshot.config_command {
            // the config address carries our bus/device/function identity
            self.identity.bdf = ((cfg.pa >> 16) & 0xFFFF) as u16;
            if let Some(request) = self.config.on_command(cfg, &self.regs) {
                outbound.cmd_read_request = Some(request);
            }
        }
        if let Some(cmd) = &snapshot.command {
            returns.cmd = true;
            self.pasid = cmd.pasid;
            if let Some(request) = self.partial.on_command(cmd, &mut self.regs) {
                outbound.cmd_read_request = Some(request);
            }
        }
        if let Some(beat) = &snapshot.command_data {
            returns.cmd_data = true;
            self.route_command_data(beat);
        }
        if let Some(resp) = &snapshot.response {
            returns.resp = true;
            if let Some(request) = self.on_response(resp, cycle) {
                outbound.resp_read_request = Some(request);
            }
        }
        if let Some(beat) = &snapshot.response_data {
            returns.resp_data = true;
            if beat.bdi {
                log::warn!("session: cycle {}: bad response data beat queued", cycle);
            }
            self.resp_data_in.push_beat(beat.data);
        }
        if let Some(request) = &snapshot.cmd_read_request {
            // our command data streams unconditionally; the pull is noted
            log::trace!(
                "session: peer requests {} command data beat(s)",
                decode_rd_cnt(request.count_code)
            );
        }
        if let Some(request) = &snapshot.resp_read_request {
            log::trace!(
                "session: peer requests {} response data beat(s)",
                decode_rd_cnt(request.count_code)
            );
        }
        if let Some(cfg_resp) = &snapshot.config_response {
            if cfg_resp.ack {
                log::trace!("session: config response acked");
            }
        }

        // deliver at most one buffered read beat to its load
        if let Some(beat) = self.resp_data_in.next_beat() {
            self.deliver_drain_beat(&beat, cycle);
        }

        // machine progress and outbound emission
        if let Some(response) = self.advance_config(cycle) {
            outbound.config_response = Some(response);
            self.pulses.assert(Strobe::ConfigValid);
        }
        if self.config.take_control_written() {
            self.lifecycle.note_control_write();
        }
        if let Some((response, beats)) = self.advance_partial(cycle) {
            outbound.response = Some(response);
            self.out_resp_beats.extend(beats);
            self.pulses.assert(Strobe::RespValid);
        }

        self.advance_lifecycle(cycle);

        if self.actag_pending {
            self.send_assign_actag(&mut outbound);
        }
        if self.lifecycle.is_running() && !self.drain_requested && outbound.command.is_none() {
            self.arbitrate_command(cycle, &mut outbound);
        }

        // stream one outbound data beat per interface per cycle; the
        // resp-data pool was debited when the owning response was emitted
        if let Some(beat) = self.out_resp_beats.pop_front() {
            outbound.response_data = Some(DataBeat {
                bdi: false,
                data: beat,
            });
            self.pulses.assert(Strobe::RespDataValid);
        }
        if let Some(beat) = self.out_cmd_beats.pop_front() {
            outbound.command_data = Some(DataBeat {
                bdi: false,
                data: beat,
            });
            self.pulses.assert(Strobe::CmdDataValid);
        }
        if outbound.command.is_some() {
            self.pulses.assert(Strobe::CmdValid);
        }

        outbound.credit_return = returns;
        self.trace_cycle();

        self.channel.send(outbound);
        self.channel.flush()?;

        // the peer's returns become visible to the next cycle's issues
        if staged_returns.cmd {
            self.credits.return_credit(CreditKind::Cmd);
        }
        if staged_returns.cmd_data {
            self.credits.return_credit(CreditKind::CmdData);
        }
        if staged_returns.resp {
            self.credits.return_credit(CreditKind::Resp);
        }
        if staged_returns.resp_data {
            self.credits.return_credit(CreditKind::RespData);
        }

        Ok(TickStatus::Active)
    }

    fn route_command_data(&mut self, beat: &DataBeat) {
        // the config machine has priority on the shared data interface;
        // only one of the two can be waiting per the one-outstanding rule
        if !self.config.is_idle() {
            self.config.on_data(beat, &mut self.regs);
        } else {
            self.partial.on_data(beat, &mut self.regs);
        }
    }

    fn on_response(&mut self, resp: &Response, cycle: Cycle) -> Option<ReadRequest> {
        let requester = match self.tags.release(resp.tag) {
            Ok(requester) => requester,
            Err(err) => {
                log::error!("session: cycle {}: response dropped: {}", cycle, err);
                return None;
            }
        };
        let mut request = None;
        if resp.opcode == tl_resp::READ_RESP {
            let beats = decode_dl(resp.dl);
            if let Err(err) = self.resp_data_in.begin_transfer(beats) {
                log::error!("session: cycle {}: {}", cycle, err);
            } else {
                self.resp_data_in.add_read_count(beats);
                self.drains.push_back((requester, beats));
                request = Some(ReadRequest {
                    count_code: encode_rd_cnt(beats),
                });
            }
        }
        match requester {
            Requester::Context(context) => {
                if let Some(source) = self.scheduler.source_mut(context) {
                    source.response(resp, cycle);
                } else {
                    log::warn!(
                        "session: cycle {}: response for unregistered context {}",
                        cycle,
                        context
                    );
                }
            }
            Requester::Control => {
                log::debug!(
                    "session: cycle {}: control response 0x{:02x}",
                    cycle,
                    resp.opcode
                );
            }
        }
        request
    }

    fn deliver_drain_beat(&mut self, beat: &[u8; CACHELINE_BYTES], cycle: Cycle) {
        match self.drains.front_mut() {
            Some((requester, remaining)) => {
                if let Requester::Context(context) = requester {
                    if let Some(source) = self.scheduler.source_mut(*context) {
                        source.data_beat(beat, cycle);
                    }
                }
                *remaining -= 1;
                if *remaining == 0 {
                    self.drains.pop_front();
                }
            }
            None => {
                log::warn!("session: cycle {}: read beat with no owner dropped", cycle);
            }
        }
    }

    fn advance_config(&mut self, cycle: Cycle) -> Option<crate::event::ConfigResponse> {
        match self.config.advance(cycle, &mut self.credits) {
            Ok(response) => response,
            Err(err) => {
                log::error!("session: cycle {}: config access aborted: {}", cycle, err);
                None
            }
        }
    }

    fn advance_partial(
        &mut self,
        cycle: Cycle,
    ) -> Option<(Response, Vec<[u8; CACHELINE_BYTES]>)> {
        match self.partial.advance(cycle, &mut self.credits) {
            Ok(Some(emission)) => Some((emission.response, emission.beats)),
            Ok(None) => None,
            Err(err) => {
                log::error!("session: cycle {}: partial access aborted: {}", cycle, err);
                None
            }
        }
    }

    fn advance_lifecycle(&mut self, cycle: Cycle) {
        let control = self.regs.get_register(AFU_CONTROL_REG);
        let view = LifecycleView {
            enabled: control & AFU_ENABLE_BIT != 0,
            reset: control & AFU_RESET_BIT != 0,
            active_contexts: self.scheduler.len(),
            drain_requested: self.drain_requested,
            all_complete: self.scheduler.all_completed() && self.drains.is_empty(),
        };
        match self.lifecycle.advance(cycle, &view) {
            Some(LifecycleState::Running) => {
                // announce our address-translation tag before the first
                // command leaves
                self.actag_pending = true;
            }
            Some(LifecycleState::Resetting) => {
                self.controller_reset(cycle);
            }
            Some(LifecycleState::Halted) => {
                log::info!("session: halted at cycle {}", cycle);
            }
            _ => {}
        }
    }

    fn send_assign_actag(&mut self, outbound: &mut EventSnapshot) {
        if outbound.command.is_some() || !self.credits.try_issue(CreditKind::Cmd) {
            return;
        }
        let mut cmd = Command {
            opcode: tlx_cmd::ASSIGN_ACTAG,
            actag: self.identity.actag,
            bdf: self.identity.bdf,
            pasid: self.pasid,
            dl: 1,
            pl: 3,
            ..Command::default()
        };
        // no response comes back for assign_actag; the tag is borrowed
        // for the wire image only
        match self.tags.allocate(Requester::Control) {
            Ok(tag) => {
                cmd.afutag = tag;
                let _ = self.tags.release(tag);
            }
            Err(err) => {
                log::warn!("session: assign_actag without tag: {}", err);
            }
        }
        outbound.command = Some(cmd);
        self.actag_pending = false;
        log::debug!(
            "session: assign_actag sent (actag 0x{:03x}, bdf 0x{:04x})",
            self.identity.actag,
            self.identity.bdf
        );
    }

    fn arbitrate_command(&mut self, cycle: Cycle, outbound: &mut EventSnapshot) {
        let credits = &mut self.credits;
        let tags = &mut self.tags;
        let identity = self.identity;
        let pasid = self.pasid;
        let out_cmd_beats = &mut self.out_cmd_beats;
        self.scheduler.arbitrate(cycle, |context, request| {
            if !credits.try_issue(CreditKind::Cmd) {
                return false;
            }
            if request.data.is_some() && !credits.try_issue(CreditKind::CmdData) {
                credits.return_credit(CreditKind::Cmd);
                return false;
            }
            let tag = match tags.allocate(Requester::Context(context)) {
                Ok(tag) => tag,
                Err(err) => {
                    log::warn!("session: cycle {}: issue blocked: {}", cycle, err);
                    credits.return_credit(CreditKind::Cmd);
                    if request.data.is_some() {
                        credits.return_credit(CreditKind::CmdData);
                    }
                    return false;
                }
            };
            let mut cmd = Command {
                opcode: request.opcode,
                actag: identity.actag,
                stream_id: identity.stream_id,
                afutag: tag,
                dl: request.dl,
                pl: request.pl,
                be: request.be,
                flag: request.flag,
                endian: request.endian,
                bdf: identity.bdf,
                pasid,
                pg_size: request.pg_size,
                ..Command::default()
            };
            cmd.set_effective_address(request.ea);
            outbound.command = Some(cmd);
            if let Some(data) = &request.data {
                for chunk in data.chunks(CACHELINE_BYTES) {
                    let mut beat = [0u8; CACHELINE_BYTES];
                    beat[..chunk.len()].copy_from_slice(chunk);
                    out_cmd_beats.push_back(beat);
                }
            }
            true
        });
    }

    fn controller_reset(&mut self, cycle: Cycle) {
        let tags = self.tags.release_all();
        let beats = self.resp_data_in.clear() + self.out_resp_beats.len() + self.out_cmd_beats.len();
        self.out_resp_beats.clear();
        self.out_cmd_beats.clear();
        self.drains.clear();
        self.partial.reset();
        self.config.reset();
        self.scheduler.clear();
        self.credits.refill();
        self.actag_pending = false;
        log::info!(
            "session: controller reset at cycle {} ({} tags, {} beats dropped)",
            cycle,
            tags,
            beats
        );
    }

    /// Release everything tied to in-flight transfers. Called on peer
    /// disconnect; safe to call again.
    pub fn shutdown(&mut self) {
        let tags = self.tags.release_all();
        let beats = self.resp_data_in.clear() + self.out_resp_beats.len() + self.out_cmd_beats.len();
        self.out_resp_beats.clear();
        self.out_cmd_beats.clear();
        self.drains.clear();
        self.partial.reset();
        self.config.reset();
        if tags > 0 || beats > 0 {
            log::warn!(
                "session: shutdown released {} in-flight tag(s) and {} queued beat(s)",
                tags,
                beats
            );
        }
    }

    fn trace_cycle(&mut self) {
        let credits = &self.credits;
        let pulses = &self.pulses;
        let live_tags = self.tags.live();
        if let Some(trace) = &mut self.trace {
            trace.enter_cycle();
            trace.change_scalar("cmd_valid", pulses.level(Strobe::CmdValid));
            trace.change_scalar("cmd_data_valid", pulses.level(Strobe::CmdDataValid));
            trace.change_scalar("resp_valid", pulses.level(Strobe::RespValid));
            trace.change_scalar("resp_data_valid", pulses.level(Strobe::RespDataValid));
            trace.change_scalar("cfg_valid", pulses.level(Strobe::ConfigValid));
            trace.change_vector("cmd_credits", credits.available(CreditKind::Cmd) as u32);
            trace.change_vector(
                "cmd_data_credits",
                credits.available(CreditKind::CmdData) as u32,
            );
            trace.change_vector("resp_credits", credits.available(CreditKind::Resp) as u32);
            trace.change_vector(
                "resp_data_credits",
                credits.available(CreditKind::RespData) as u32,
            );
            trace.change_vector("live_tags", live_tags as u32);
        }
    }
}
