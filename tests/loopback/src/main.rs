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

//! Two-endpoint loopback run over real sockets.
//!
//! The device thread runs the full AFU model; the main thread stands in
//! for the host coherence simulator, scripted through the bring-up,
//! enable, partial-access round-trips, and a free-running traffic phase
//! serving the device's machine commands.

use anyhow::{bail, ensure, Context};
use std::collections::HashMap;
use std::thread;
use structopt::StructOpt;

use afu::{Afu, ContextInit, DescriptorConfig, MachineInit, RegisterInit};
use tlx::LifecycleState;
use tlx::event::{
    decode_dl, decode_pl, decode_rd_cnt, tl_cmd, tl_resp, tlx_cmd, tlx_resp, Command,
    ConfigCommand, ConfigResponse, CreditReturn, DataBeat, EventSnapshot, InitialCredits,
    Response,
};
use tlx::{Channel, CreditKind, CreditManager, Listener, BASE_PORT, CACHELINE_BYTES};

const STATUS_ADDRESS: u64 = 0x9000;
const ENABLE_BIT: u32 = 1 << 24;

#[derive(StructOpt)]
#[structopt(name = "loopback", about = "End-to-end loopback test of the TLX bridge")]
struct Arguments {
    /// edges of free-running traffic after the scripted phases
    #[structopt(short, long, default_value = "2000")]
    edges: usize,
    #[structopt(short, long, default_value = "7")]
    seed: u64,
}

fn demo_config() -> DescriptorConfig {
    DescriptorConfig {
        name: "loopback".to_string(),
        registers: vec![RegisterInit {
            offset: 0x404,
            value: 0x1,
        }],
        contexts: vec![ContextInit {
            context: 1,
            status_address: STATUS_ADDRESS,
            machines: vec![
                MachineInit {
                    command: 0x12,
                    min_delay: 1,
                    max_delay: 8,
                    command_size: 8,
                    base_address: 0x2000,
                    memory_size: 0x100,
                    abort: 0,
                    parity: 0,
                    enable_once: false,
                },
                MachineInit {
                    command: 0x30,
                    min_delay: 2,
                    max_delay: 16,
                    command_size: 4,
                    base_address: 0x3000,
                    memory_size: 0x100,
                    abort: 0,
                    parity: 0,
                    enable_once: false,
                },
            ],
        }],
    }
}

/// A store the device is streaming data for.
struct Collect {
    afutag: u16,
    ea: u64,
    size: usize,
    beats_left: usize,
    data: Vec<u8>,
}

/// The scripted host endpoint.
struct Host {
    channel: Channel,
    credits: CreditManager,
    memory: HashMap<u64, [u8; CACHELINE_BYTES]>,
    returns_out: CreditReturn,
    resp_out: Vec<Response>,
    resp_beats_out: Vec<[u8; CACHELINE_BYTES]>,
    staged_write_beat: Option<[u8; CACHELINE_BYTES]>,
    pending_pull: usize,
    collecting: Option<Collect>,
    responses_seen: Vec<Response>,
    cfg_responses_seen: Vec<ConfigResponse>,
    read_beats_seen: Vec<[u8; CACHELINE_BYTES]>,
    machine_cmds_seen: usize,
    loads_served: usize,
    stores_applied: usize,
    status_writes: usize,
}

impl Host {
    fn connect(port: u16) -> anyhow::Result<Self> {
        let channel = Channel::connect(("127.0.0.1", port)).context("host connect")?;
        let mut host = Self {
            channel,
            credits: CreditManager::new(),
            memory: HashMap::new(),
            returns_out: CreditReturn::default(),
            resp_out: Vec::new(),
            resp_beats_out: Vec::new(),
            staged_write_beat: None,
            pending_pull: 0,
            collecting: None,
            responses_seen: Vec::new(),
            cfg_responses_seen: Vec::new(),
            read_beats_seen: Vec::new(),
            machine_cmds_seen: 0,
            loads_served: 0,
            stores_applied: 0,
            status_writes: 0,
        };
        // exchange initial credit advertisements
        host.channel.send(EventSnapshot {
            initial_credits: Some(InitialCredits {
                cmd: 8,
                cmd_data: 12,
                resp: 8,
                resp_data: 12,
            }),
            ..EventSnapshot::default()
        });
        host.channel.flush()?;
        let hello = match host.channel.poll()? {
            Some(snapshot) => snapshot,
            None => bail!("device closed during bring-up"),
        };
        let theirs = hello
            .initial_credits
            .context("device did not advertise credits")?;
        host.credits.negotiate(CreditKind::Cmd, theirs.cmd)?;
        host.credits.negotiate(CreditKind::CmdData, theirs.cmd_data)?;
        host.credits.negotiate(CreditKind::Resp, theirs.resp)?;
        host.credits.negotiate(CreditKind::RespData, theirs.resp_data)?;
        log::info!("host: link up, device grants {:?}", theirs);
        Ok(host)
    }

    fn line_mut(&mut self, addr: u64) -> &mut [u8; CACHELINE_BYTES] {
        self.memory
            .entry(addr & !(CACHELINE_BYTES as u64 - 1))
            .or_insert([0; CACHELINE_BYTES])
    }

    fn line(&self, addr: u64) -> [u8; CACHELINE_BYTES] {
        self.memory
            .get(&(addr & !(CACHELINE_BYTES as u64 - 1)))
            .copied()
            .unwrap_or([0; CACHELINE_BYTES])
    }

    fn write_span(&mut self, addr: u64, data: &[u8]) {
        let offset = (addr & (CACHELINE_BYTES as u64 - 1)) as usize;
        let line = self.line_mut(addr);
        let end = (offset + data.len()).min(CACHELINE_BYTES);
        line[offset..end].copy_from_slice(&data[..end - offset]);
    }

    /// Drive one edge: merge queued traffic into `inject`, flush it, and
    /// absorb the device's answering edge.
    fn step(&mut self, mut inject: EventSnapshot) -> anyhow::Result<()> {
        if inject.response.is_none() && !self.resp_out.is_empty() {
            inject.response = Some(self.resp_out.remove(0));
        }
        if inject.response_data.is_none() && !self.resp_beats_out.is_empty() {
            inject.response_data = Some(DataBeat {
                bdi: false,
                data: self.resp_beats_out.remove(0),
            });
        }
        if self.pending_pull > 0 {
            if let Some(beat) = self.staged_write_beat.take() {
                self.credits.try_issue(CreditKind::CmdData);
                inject.command_data = Some(DataBeat { bdi: false, data: beat });
                self.pending_pull -= 1;
            }
        }
        inject.credit_return = std::mem::take(&mut self.returns_out);
        self.channel.send(inject);
        self.channel.flush()?;
        let snapshot = match self.channel.poll()? {
            Some(snapshot) => snapshot,
            None => bail!("device disconnected"),
        };
        self.absorb(&snapshot);
        Ok(())
    }

    fn absorb(&mut self, snapshot: &EventSnapshot) {
        let returned = &snapshot.credit_return;
        if returned.cmd {
            self.credits.return_credit(CreditKind::Cmd);
        }
        if returned.cmd_data {
            self.credits.return_credit(CreditKind::CmdData);
        }
        if returned.resp {
            self.credits.return_credit(CreditKind::Resp);
        }
        if returned.resp_data {
            self.credits.return_credit(CreditKind::RespData);
        }
        if let Some(cmd) = &snapshot.command {
            self.returns_out.cmd = true;
            self.serve_command(cmd);
        }
        if let Some(beat) = &snapshot.command_data {
            self.returns_out.cmd_data = true;
            self.collect_store_beat(&beat.data);
        }
        if let Some(resp) = &snapshot.response {
            self.returns_out.resp = true;
            self.responses_seen.push(resp.clone());
        }
        if let Some(beat) = &snapshot.response_data {
            self.returns_out.resp_data = true;
            self.read_beats_seen.push(beat.data);
        }
        if let Some(cfg_resp) = &snapshot.config_response {
            self.cfg_responses_seen.push(cfg_resp.clone());
        }
        if let Some(request) = &snapshot.cmd_read_request {
            self.pending_pull += decode_rd_cnt(request.count_code);
        }
        // resp_read_request needs no action: read data is streamed as soon
        // as the response leaves
    }

    fn serve_command(&mut self, cmd: &Command) {
        match cmd.opcode {
            tlx_cmd::ASSIGN_ACTAG => {
                log::info!("host: actag 0x{:03x} assigned", cmd.actag);
            }
            tlx_cmd::PR_RD_WNITC | tlx_cmd::RD_WNITC => {
                self.machine_cmds_seen += 1;
                let beats = if cmd.opcode == tlx_cmd::RD_WNITC {
                    decode_dl(cmd.dl)
                } else {
                    1
                };
                let ea = cmd.effective_address();
                assert!(self.credits.try_issue(CreditKind::Resp), "host resp pool dry");
                self.resp_out.push(Response {
                    opcode: tl_resp::READ_RESP,
                    tag: cmd.afutag,
                    dl: cmd.dl.max(1),
                    ..Response::default()
                });
                for i in 0..beats {
                    self.resp_beats_out
                        .push(self.line(ea + (i * CACHELINE_BYTES) as u64));
                }
                self.loads_served += 1;
            }
            tlx_cmd::DMA_PR_W | tlx_cmd::DMA_W | tlx_cmd::DMA_W_BE => {
                self.machine_cmds_seen += 1;
                let (beats, size) = if cmd.opcode == tlx_cmd::DMA_PR_W {
                    (1, decode_pl(cmd.pl).unwrap_or(4))
                } else {
                    let beats = decode_dl(cmd.dl);
                    (beats, beats * CACHELINE_BYTES)
                };
                self.collecting = Some(Collect {
                    afutag: cmd.afutag,
                    ea: cmd.effective_address(),
                    size,
                    beats_left: beats,
                    data: Vec::with_capacity(beats * CACHELINE_BYTES),
                });
            }
            tlx_cmd::INTRP_REQ => {
                self.machine_cmds_seen += 1;
                assert!(self.credits.try_issue(CreditKind::Resp), "host resp pool dry");
                self.resp_out.push(Response {
                    opcode: tl_resp::INTRP_RESP,
                    tag: cmd.afutag,
                    ..Response::default()
                });
            }
            opcode => {
                log::warn!("host: unserved device command 0x{:02x}", opcode);
            }
        }
    }

    fn collect_store_beat(&mut self, data: &[u8; CACHELINE_BYTES]) {
        let collect = match &mut self.collecting {
            Some(collect) => collect,
            None => {
                log::warn!("host: stray command data beat");
                return;
            }
        };
        collect.data.extend_from_slice(data);
        collect.beats_left -= 1;
        if collect.beats_left > 0 {
            return;
        }
        let collect = self.collecting.take().unwrap();
        let payload = &collect.data[..collect.size];
        self.write_span(collect.ea, payload);
        self.stores_applied += 1;
        if collect.ea == STATUS_ADDRESS {
            self.status_writes += 1;
            // the host application acknowledges immediately: the next
            // status poll must read ready
            self.line_mut(STATUS_ADDRESS)[0] = 0xFF;
        }
        assert!(self.credits.try_issue(CreditKind::Resp), "host resp pool dry");
        self.resp_out.push(Response {
            opcode: tl_resp::WRITE_RESP,
            tag: collect.afutag,
            ..Response::default()
        });
    }

    fn pump_until<F: Fn(&Host) -> bool>(&mut self, what: &str, pred: F) -> anyhow::Result<()> {
        for _ in 0..10_000 {
            if pred(self) {
                return Ok(());
            }
            self.step(EventSnapshot::default())?;
        }
        bail!("timed out waiting for {}", what)
    }

    /// Scripted config write with its one-beat data phase.
    fn config_write(&mut self, pa: u64, value: u32, capptag: u16) -> anyhow::Result<()> {
        let seen = self.cfg_responses_seen.len();
        let mut beat = [0u8; CACHELINE_BYTES];
        let offset = (pa & 0x3F) as usize;
        beat[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
        self.staged_write_beat = Some(beat);
        self.step(EventSnapshot {
            config_command: Some(ConfigCommand {
                opcode: tl_cmd::CONFIG_WRITE,
                pa,
                pl: 2,
                capptag,
                data: value,
                ..ConfigCommand::default()
            }),
            ..EventSnapshot::default()
        })?;
        self.pump_until("config write response", |host| {
            host.cfg_responses_seen.len() > seen
        })?;
        let resp = &self.cfg_responses_seen[seen];
        ensure!(resp.opcode == tlx_resp::MEM_WR_RESPONSE, "bad config write resp");
        ensure!(resp.capptag == capptag, "config write capptag mismatch");
        Ok(())
    }

    fn config_read(&mut self, pa: u64, capptag: u16) -> anyhow::Result<u32> {
        let seen = self.cfg_responses_seen.len();
        self.step(EventSnapshot {
            config_command: Some(ConfigCommand {
                opcode: tl_cmd::CONFIG_READ,
                pa,
                pl: 2,
                capptag,
                ..ConfigCommand::default()
            }),
            ..EventSnapshot::default()
        })?;
        self.pump_until("config read response", |host| {
            host.cfg_responses_seen.len() > seen
        })?;
        let resp = &self.cfg_responses_seen[seen];
        ensure!(resp.opcode == tlx_resp::MEM_RD_RESPONSE, "bad config read resp");
        Ok(resp.data)
    }

    /// Partial write to device memory, with the pulled data phase.
    fn partial_write(&mut self, pa: u64, value: u32, capptag: u16) -> anyhow::Result<()> {
        let seen = self.responses_seen.len();
        ensure!(self.credits.try_issue(CreditKind::Cmd), "host cmd pool dry");
        let mut beat = [0u8; CACHELINE_BYTES];
        let offset = (pa & 0x3F) as usize;
        beat[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
        self.staged_write_beat = Some(beat);
        self.step(EventSnapshot {
            command: Some(Command {
                opcode: tl_cmd::PR_WR_MEM,
                pa,
                pl: 2,
                capptag,
                ..Command::default()
            }),
            ..EventSnapshot::default()
        })?;
        self.pump_until("partial write response", |host| {
            host.responses_seen.len() > seen
        })?;
        let resp = &self.responses_seen[seen];
        ensure!(resp.opcode == tlx_resp::MEM_WR_RESPONSE, "bad write resp");
        ensure!(resp.tag == capptag, "write capptag mismatch");
        Ok(())
    }

    fn partial_read(&mut self, pa: u64, capptag: u16) -> anyhow::Result<[u8; 4]> {
        let seen = self.responses_seen.len();
        let beats = self.read_beats_seen.len();
        ensure!(self.credits.try_issue(CreditKind::Cmd), "host cmd pool dry");
        self.step(EventSnapshot {
            command: Some(Command {
                opcode: tl_cmd::PR_RD_MEM,
                pa,
                pl: 2,
                capptag,
                ..Command::default()
            }),
            ..EventSnapshot::default()
        })?;
        self.pump_until("partial read response", |host| {
            host.responses_seen.len() > seen && host.read_beats_seen.len() > beats
        })?;
        let resp = &self.responses_seen[seen];
        ensure!(resp.opcode == tlx_resp::MEM_RD_RESPONSE, "bad read resp");
        ensure!(resp.tag == capptag, "read capptag mismatch");
        let beat = &self.read_beats_seen[beats];
        let offset = (pa & 0x3F) as usize;
        let mut out = [0u8; 4];
        out.copy_from_slice(&beat[offset..offset + 4]);
        Ok(out)
    }
}

fn run(args: &Arguments) -> anyhow::Result<()> {
    let listener = Listener::bind(BASE_PORT)?;
    let port = listener.port();
    let seed = args.seed;

    let edges = args.edges;
    let device = thread::spawn(move || -> anyhow::Result<LifecycleState> {
        let channel = listener.accept()?;
        let mut device = Afu::attach(channel, demo_config(), seed);
        // half the free-running phase, then drain to Halted
        device.set_drain_after(edges / 2);
        device.run()?;
        Ok(device.lifecycle_state())
    });

    let mut host = Host::connect(port)?;

    // enable the device through its control register
    host.config_write(0x0100_050C, ENABLE_BIT, 0xE1)?;
    log::info!("host: device enabled");

    // configuration round-trip via the read port register
    host.config_write(0x0100_0410, 0xAABB_CCDD, 0xE2)?;
    let back = host.config_read(0x0100_0410, 0xE3)?;
    ensure!(
        back == 0xAABB_CCDD,
        "config round-trip mismatch: 0x{:08x}",
        back
    );
    log::info!("host: config round-trip ok");

    // partial access round-trip against device MMIO
    host.partial_write(0x8014, 0x1234_5678, 0xA1)?;
    let bytes = host.partial_read(0x8014, 0xA2)?;
    ensure!(
        bytes == 0x1234_5678u32.to_le_bytes(),
        "partial round-trip mismatch: {:02x?}",
        bytes
    );
    log::info!("host: partial access round-trip ok");

    // free-running phase: serve the device's machines
    for _ in 0..args.edges {
        host.step(EventSnapshot::default())?;
    }
    ensure!(host.machine_cmds_seen > 0, "no machine commands observed");
    ensure!(host.loads_served > 0, "no loads served");
    ensure!(host.stores_applied > 0, "no stores applied");
    ensure!(host.status_writes > 0, "status handshake never ran");
    log::info!(
        "host: {} machine commands ({} loads, {} stores, {} status rounds)",
        host.machine_cmds_seen,
        host.loads_served,
        host.stores_applied,
        host.status_writes
    );

    drop(host);
    let final_state = match device.join() {
        Ok(result) => result.context("device run")?,
        Err(panic) => std::panic::resume_unwind(panic),
    };
    ensure!(
        final_state == LifecycleState::Halted,
        "device did not drain to Halted (got {:?})",
        final_state
    );
    log::info!("loopback passed");
    Ok(())
}

fn main() {
    let args = Arguments::from_args();

    let _logger = env_logger::builder()
        .filter(Some("loopback"), log::LevelFilter::Info)
        .filter(Some("tlx"), log::LevelFilter::Info)
        .filter(Some("afu"), log::LevelFilter::Info)
        .target(env_logger::Target::Stderr)
        .init();

    run(&args).expect("Loopback run failed");
}
