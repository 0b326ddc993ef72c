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

//! Partial (and full-line) memory access sequencing on the device side.
//!
//! Sub-beat accesses land at the byte offset given by the low 6 address
//! bits: a write payload is shifted left to extract the value, a read
//! response is shifted right to place it.

use super::{ResponseEmission, CREDIT_RETRY_BOUND, DATA_PHASE_TIMEOUT};
use crate::credit::{CreditKind, CreditManager};
use crate::error::Error;
use crate::event::{
    decode_dl, decode_pl, encode_dl, encode_rd_cnt, tl_cmd, tlx_resp, Command, DataBeat,
    ReadRequest, Response, CACHELINE_BYTES,
};
use crate::regfile::RegisterFile;
use crate::signal::{byte_shift, Shift};
use crate::Cycle;
use bitvec::prelude::*;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PartialState {
    Idle,
    AwaitingData,
    ResponsePending,
}

#[derive(Clone, Debug)]
struct Pending {
    opcode: u8,
    capptag: u16,
    pa: u64,
    /// Partial byte count for pr_* opcodes, 0 for full-line ones.
    size: usize,
    be: u64,
    beats_expected: usize,
    beats: Vec<[u8; CACHELINE_BYTES]>,
}

#[derive(Clone, Debug)]
pub struct PartialAccess {
    state: PartialState,
    pending: Option<Pending>,
    ready: Option<ResponseEmission>,
    waited: Cycle,
}

impl Default for PartialAccess {
    fn default() -> Self {
        Self {
            state: PartialState::Idle,
            pending: None,
            ready: None,
            waited: 0,
        }
    }
}

fn is_read_class(opcode: u8) -> bool {
    matches!(opcode, tl_cmd::RD_MEM | tl_cmd::PR_RD_MEM | tl_cmd::AMO_RD)
}

fn is_write_class(opcode: u8) -> bool {
    matches!(
        opcode,
        tl_cmd::WRITE_MEM
            | tl_cmd::WRITE_MEM_BE
            | tl_cmd::PR_WR_MEM
            | tl_cmd::AMO_W
            | tl_cmd::AMO_RW
    )
}

impl PartialAccess {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> PartialState {
        self.state
    }

    pub fn is_idle(&self) -> bool {
        self.state == PartialState::Idle
    }

    /// Consume a memory command. A write-class command answers with the
    /// data read-count request to drive outward; a read-class command
    /// performs the access immediately and parks the response for
    /// credit-gated emission.
    pub fn on_command<R: RegisterFile>(
        &mut self,
        cmd: &Command,
        regs: &mut R,
    ) -> Option<ReadRequest> {
        if self.state != PartialState::Idle {
            log::warn!(
                "partial: command 0x{:02x} ignored while {:?}",
                cmd.opcode,
                self.state
            );
            return None;
        }
        if is_read_class(cmd.opcode) {
            self.ready = Some(self.perform_read(cmd, regs));
            self.state = PartialState::ResponsePending;
            self.waited = 0;
            return None;
        }
        if !is_write_class(cmd.opcode) {
            log::warn!("partial: unhandled command opcode 0x{:02x}", cmd.opcode);
            return None;
        }
        let (size, beats_expected) = match cmd.opcode {
            tl_cmd::PR_WR_MEM => match decode_pl(cmd.pl) {
                Some(size) if size <= 8 => (size, 1),
                _ => {
                    log::warn!("partial: unsupported pl code {} for pr_wr_mem", cmd.pl);
                    self.ready = Some(fail_emission(cmd.capptag, tlx_resp::MEM_WR_FAIL));
                    self.state = PartialState::ResponsePending;
                    self.waited = 0;
                    return None;
                }
            },
            tl_cmd::WRITE_MEM_BE => (0, 1),
            _ => (0, decode_dl(cmd.dl)),
        };
        self.pending = Some(Pending {
            opcode: cmd.opcode,
            capptag: cmd.capptag,
            pa: cmd.pa,
            size,
            be: cmd.be,
            beats_expected,
            beats: Vec::with_capacity(beats_expected),
        });
        self.state = PartialState::AwaitingData;
        self.waited = 0;
        log::debug!(
            "partial: write 0x{:02x} capptag 0x{:04x} awaiting {} beat(s)",
            cmd.opcode,
            cmd.capptag,
            beats_expected
        );
        Some(ReadRequest {
            count_code: encode_rd_cnt(beats_expected),
        })
    }

    /// Capture one beat of the write data phase. Once all beats are in,
    /// the memory side effect is applied and the write response parked.
    pub fn on_data<R: RegisterFile>(&mut self, beat: &DataBeat, regs: &mut R) {
        if self.state != PartialState::AwaitingData {
            log::warn!("partial: data beat ignored while {:?}", self.state);
            return;
        }
        if beat.bdi {
            log::warn!("partial: bad-data indicator set on write beat");
        }
        let pending = self.pending.as_mut().expect("awaiting data without pending");
        pending.beats.push(beat.data);
        self.waited = 0;
        if pending.beats.len() < pending.beats_expected {
            return;
        }
        let pending = self.pending.take().unwrap();
        self.apply_write(&pending, regs);
        self.ready = Some(ResponseEmission {
            response: Response {
                opcode: tlx_resp::MEM_WR_RESPONSE,
                tag: pending.capptag,
                dl: encode_dl(pending.beats_expected),
                ..Response::default()
            },
            beats: Vec::new(),
        });
        self.state = PartialState::ResponsePending;
    }

    fn apply_write<R: RegisterFile>(&self, pending: &Pending, regs: &mut R) {
        match pending.opcode {
            tl_cmd::PR_WR_MEM => {
                let mut beat = pending.beats[0];
                let offset = (pending.pa & 0x3F) as usize;
                byte_shift(&mut beat, pending.size, offset, Shift::Left);
                regs.write_bytes(pending.pa as u32, &beat[..pending.size]);
            }
            tl_cmd::WRITE_MEM_BE => {
                let beat = &pending.beats[0];
                let base = pending.pa & !0x3F;
                for i in pending.be.view_bits::<Lsb0>().iter_ones() {
                    regs.write_bytes(base as u32 + i as u32, &beat[i..i + 1]);
                }
            }
            _ => {
                for (i, beat) in pending.beats.iter().enumerate() {
                    regs.write_bytes(pending.pa as u32 + (i * CACHELINE_BYTES) as u32, beat);
                }
            }
        }
    }

    fn perform_read<R: RegisterFile>(&self, cmd: &Command, regs: &R) -> ResponseEmission {
        match cmd.opcode {
            tl_cmd::PR_RD_MEM | tl_cmd::AMO_RD => {
                let size = match decode_pl(cmd.pl) {
                    Some(size) if size <= 8 => size,
                    _ => {
                        log::warn!("partial: unsupported pl code {} for pr_rd_mem", cmd.pl);
                        return fail_emission(cmd.capptag, tlx_resp::MEM_RD_FAIL);
                    }
                };
                let mut beat = [0u8; CACHELINE_BYTES];
                regs.read_bytes(cmd.pa as u32, &mut beat[..size]);
                let offset = (cmd.pa & 0x3F) as usize;
                byte_shift(&mut beat, size, offset, Shift::Right);
                ResponseEmission {
                    response: Response {
                        opcode: tlx_resp::MEM_RD_RESPONSE,
                        tag: cmd.capptag,
                        dl: 1,
                        ..Response::default()
                    },
                    beats: vec![beat],
                }
            }
            _ => {
                let beats_expected = decode_dl(cmd.dl);
                let mut beats = Vec::with_capacity(beats_expected);
                for i in 0..beats_expected {
                    let mut beat = [0u8; CACHELINE_BYTES];
                    regs.read_bytes(cmd.pa as u32 + (i * CACHELINE_BYTES) as u32, &mut beat);
                    beats.push(beat);
                }
                ResponseEmission {
                    response: Response {
                        opcode: tlx_resp::MEM_RD_RESPONSE,
                        tag: cmd.capptag,
                        dl: encode_dl(beats_expected),
                        ..Response::default()
                    },
                    beats,
                }
            }
        }
    }

    /// One cycle of progress: time out a stuck data phase, or retry the
    /// parked response against the credit pools. On abort the machine is
    /// back at Idle and the error carries the cycle for the diagnostic.
    pub fn advance(
        &mut self,
        cycle: Cycle,
        credits: &mut CreditManager,
    ) -> Result<Option<ResponseEmission>, Error> {
        match self.state {
            PartialState::Idle => Ok(None),
            PartialState::AwaitingData => {
                self.waited += 1;
                if self.waited > DATA_PHASE_TIMEOUT {
                    let pending = self.pending.take();
                    self.reset();
                    return Err(Error::DataPhaseTimeout {
                        cycle,
                        opcode: pending.map(|p| p.opcode).unwrap_or(0),
                    });
                }
                Ok(None)
            }
            PartialState::ResponsePending => {
                let has_data = self
                    .ready
                    .as_ref()
                    .map(|emission| !emission.beats.is_empty())
                    .unwrap_or(false);
                if !credits.try_issue(CreditKind::Resp) {
                    self.waited += 1;
                    if self.waited > CREDIT_RETRY_BOUND {
                        self.reset();
                        return Err(Error::CreditStarvation {
                            kind: CreditKind::Resp,
                            cycle,
                        });
                    }
                    return Ok(None);
                }
                if has_data && !credits.try_issue(CreditKind::RespData) {
                    // give the resp credit back; the pair goes out together
                    credits.return_credit(CreditKind::Resp);
                    self.waited += 1;
                    if self.waited > CREDIT_RETRY_BOUND {
                        self.reset();
                        return Err(Error::CreditStarvation {
                            kind: CreditKind::RespData,
                            cycle,
                        });
                    }
                    return Ok(None);
                }
                let emission = self.ready.take();
                self.reset();
                Ok(emission)
            }
        }
    }

    /// Abandon whatever is in flight (disconnect, controller reset).
    pub fn reset(&mut self) {
        self.state = PartialState::Idle;
        self.pending = None;
        self.ready = None;
        self.waited = 0;
    }
}

fn fail_emission(capptag: u16, opcode: u8) -> ResponseEmission {
    ResponseEmission {
        response: Response {
            opcode,
            tag: capptag,
            code: 0x1,
            ..Response::default()
        },
        beats: Vec::new(),
    }
}
