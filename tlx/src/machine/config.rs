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

//! Configuration-space access sequencing.
//!
//! Reads are satisfied straight from the register file. Writes have a
//! one-beat data phase like partial memory writes, plus the indirect
//! descriptor port protocol: a write to 0x40C selects a descriptor
//! register, whose value shows up at the 0x410 read port.

use super::{CREDIT_RETRY_BOUND, DATA_PHASE_TIMEOUT};
use crate::credit::{CreditKind, CreditManager};
use crate::error::Error;
use crate::event::{
    decode_pl, encode_rd_cnt, tl_cmd, tlx_resp, ConfigCommand, ConfigResponse, DataBeat,
    ReadRequest,
};
use crate::regfile::{RegisterFile, AFU_CONTROL_REG, DESC_READ_PORT, DESC_WRITE_PORT};
use crate::signal::{byte_shift, Shift};
use crate::Cycle;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ConfigState {
    Idle,
    AwaitingConfigData,
}

#[derive(Clone, Debug)]
struct PendingWrite {
    pa: u64,
    capptag: u16,
    size: usize,
}

#[derive(Clone, Debug, Default)]
pub struct ConfigAccess {
    state: ConfigState,
    pending: Option<PendingWrite>,
    ready: Option<ConfigResponse>,
    /// Set when a completed write touched the device-control register;
    /// the session forwards this to the lifecycle machine.
    control_written: bool,
    waited: Cycle,
}

impl Default for ConfigState {
    fn default() -> Self {
        ConfigState::Idle
    }
}

impl ConfigAccess {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> ConfigState {
        self.state
    }

    pub fn is_idle(&self) -> bool {
        self.state == ConfigState::Idle && self.ready.is_none()
    }

    /// True once per completed control-register write; reading clears it.
    pub fn take_control_written(&mut self) -> bool {
        std::mem::replace(&mut self.control_written, false)
    }

    /// Consume a config command. A write answers with the one-beat data
    /// read-count request to drive outward; a read parks its response for
    /// credit-gated emission.
    pub fn on_command<R: RegisterFile>(
        &mut self,
        cfg: &ConfigCommand,
        regs: &R,
    ) -> Option<ReadRequest> {
        if cfg.t {
            // type-1 config routing is for switches downstream of us
            log::warn!("config: type-1 command 0x{:02x} ignored", cfg.opcode);
            return None;
        }
        match cfg.opcode {
            tl_cmd::CONFIG_READ => {
                if self.ready.is_some() {
                    log::warn!("config: read ignored, response still pending");
                    return None;
                }
                self.ready = Some(self.perform_read(cfg, regs));
                None
            }
            tl_cmd::CONFIG_WRITE => {
                if self.state != ConfigState::Idle {
                    log::warn!("config: write ignored while {:?}", self.state);
                    return None;
                }
                self.pending = Some(PendingWrite {
                    pa: cfg.pa,
                    capptag: cfg.capptag,
                    size: decode_pl(cfg.pl).filter(|&s| s <= 4).unwrap_or(4),
                });
                self.state = ConfigState::AwaitingConfigData;
                self.waited = 0;
                Some(ReadRequest {
                    count_code: encode_rd_cnt(1),
                })
            }
            _ => {
                log::warn!("config: unexpected opcode 0x{:02x}", cfg.opcode);
                None
            }
        }
    }

    fn perform_read<R: RegisterFile>(&self, cfg: &ConfigCommand, regs: &R) -> ConfigResponse {
        let capptag = cfg.capptag;
        let size = match decode_pl(cfg.pl) {
            Some(size) if size <= 4 => size,
            _ => {
                log::warn!("config: unsupported pl code {} for config_read", cfg.pl);
                return ConfigResponse {
                    opcode: tlx_resp::MEM_RD_FAIL,
                    capptag,
                    code: 0x1,
                    ..ConfigResponse::default()
                };
            }
        };
        let word_offset = (cfg.pa & 0xFFFC) as u32;
        let sub = (cfg.pa & 0x3) as usize;
        if sub % size != 0 {
            log::warn!(
                "config: read offset 0x{:x} unsupported for size {}",
                cfg.pa,
                size
            );
            return ConfigResponse {
                opcode: tlx_resp::MEM_RD_FAIL,
                capptag,
                code: 0x1,
                ..ConfigResponse::default()
            };
        }
        let word = regs.get_register(word_offset);
        let value = (word >> (sub * 8)) & sized_mask(size);
        log::debug!(
            "config: read offset 0x{:04x} size {} -> 0x{:08x}",
            word_offset,
            size,
            value
        );
        ConfigResponse {
            opcode: tlx_resp::MEM_RD_RESPONSE,
            capptag,
            offset: (cfg.pa & 0xF) as u8,
            data: value,
            ..ConfigResponse::default()
        }
    }

    /// Capture the write data beat, apply the register write, and park the
    /// write response.
    pub fn on_data<R: RegisterFile>(&mut self, beat: &DataBeat, regs: &mut R) {
        if self.state != ConfigState::AwaitingConfigData {
            log::warn!("config: data beat ignored while {:?}", self.state);
            return;
        }
        if beat.bdi {
            log::warn!("config: bad-data indicator set on config write beat");
        }
        let pending = self.pending.take().expect("awaiting data without pending");
        let mut data = beat.data;
        let offset = (pending.pa & 0x3F) as usize;
        byte_shift(&mut data, pending.size, offset, Shift::Left);
        let mut value = 0u32;
        for i in (0..pending.size).rev() {
            value = (value << 8) | data[i] as u32;
        }
        self.apply_write(&pending, value, regs);
        self.ready = Some(ConfigResponse {
            opcode: tlx_resp::MEM_WR_RESPONSE,
            capptag: pending.capptag,
            ..ConfigResponse::default()
        });
        self.state = ConfigState::Idle;
        self.waited = 0;
    }

    fn apply_write<R: RegisterFile>(&mut self, pending: &PendingWrite, value: u32, regs: &mut R) {
        let word_offset = (pending.pa & 0xFFFC) as u32;
        if word_offset == DESC_WRITE_PORT {
            // indirect descriptor access: the written value selects the
            // descriptor register mirrored at the read port
            let desc_offset = value;
            let desc_data = regs.get_register(desc_offset & !0x3);
            regs.set_register(DESC_READ_PORT, desc_data);
            regs.set_register(DESC_WRITE_PORT, desc_offset | 0x8000_0000);
            log::debug!(
                "config: descriptor port select 0x{:04x} -> 0x{:08x}",
                desc_offset,
                desc_data
            );
            return;
        }
        let sub = (pending.pa & 0x3) as usize;
        let mask = sized_mask(pending.size) << (sub * 8);
        let word = regs.get_register(word_offset);
        let word = (word & !mask) | ((value << (sub * 8)) & mask);
        regs.set_register(word_offset, word);
        log::debug!(
            "config: write offset 0x{:04x} size {} = 0x{:08x}",
            word_offset,
            pending.size,
            value
        );
        if word_offset == AFU_CONTROL_REG {
            self.control_written = true;
        }
    }

    /// One cycle of progress: time out a stuck data phase, or retry the
    /// parked response against the response credit pool.
    pub fn advance(
        &mut self,
        cycle: Cycle,
        credits: &mut CreditManager,
    ) -> Result<Option<ConfigResponse>, Error> {
        if self.state == ConfigState::AwaitingConfigData {
            self.waited += 1;
            if self.waited > DATA_PHASE_TIMEOUT {
                self.reset_keep_control();
                return Err(Error::DataPhaseTimeout {
                    cycle,
                    opcode: tl_cmd::CONFIG_WRITE,
                });
            }
            return Ok(None);
        }
        if self.ready.is_none() {
            return Ok(None);
        }
        if !credits.try_issue(CreditKind::Resp) {
            self.waited += 1;
            if self.waited > CREDIT_RETRY_BOUND {
                self.reset_keep_control();
                return Err(Error::CreditStarvation {
                    kind: CreditKind::Resp,
                    cycle,
                });
            }
            return Ok(None);
        }
        self.waited = 0;
        Ok(self.ready.take())
    }

    /// Abandon whatever is in flight (disconnect, controller reset).
    pub fn reset(&mut self) {
        self.state = ConfigState::Idle;
        self.pending = None;
        self.ready = None;
        self.control_written = false;
        self.waited = 0;
    }

    fn reset_keep_control(&mut self) {
        let control = self.control_written;
        self.reset();
        self.control_written = control;
    }
}

fn sized_mask(size: usize) -> u32 {
    match size {
        1 => 0xFF,
        2 => 0xFFFF,
        _ => 0xFFFF_FFFF,
    }
}
