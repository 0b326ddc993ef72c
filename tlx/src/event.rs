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

//! The per-cycle event snapshot and its wire codec.
//!
//! One snapshot crosses the socket per simulated clock edge. Every
//! interface group is optional; a group that is absent on the wire leaves
//! the consumer's state for that interface untouched.

use crate::error::Error;
use crate::signal::mask_bits;

pub const CACHELINE_BYTES: usize = 64;

/// Opcodes of host-to-device (TL) commands.
pub mod tl_cmd {
    pub const NOP: u8 = 0x00;
    pub const XLATE_DONE: u8 = 0x18;
    pub const INTRP_RDY: u8 = 0x1A;
    pub const RD_MEM: u8 = 0x20;
    pub const PR_RD_MEM: u8 = 0x28;
    pub const AMO_RD: u8 = 0x38;
    pub const AMO_RW: u8 = 0x40;
    pub const AMO_W: u8 = 0x48;
    pub const WRITE_MEM: u8 = 0x81;
    pub const WRITE_MEM_BE: u8 = 0x82;
    pub const PR_WR_MEM: u8 = 0x86;
    pub const FORCE_EVICT: u8 = 0xD0;
    pub const WAKE_AFU_THREAD: u8 = 0xDF;
    pub const CONFIG_READ: u8 = 0xE0;
    pub const CONFIG_WRITE: u8 = 0xE1;
}

/// Opcodes of host-to-device (TL) responses.
pub mod tl_resp {
    pub const NOP: u8 = 0x00;
    pub const TOUCH_RESP: u8 = 0x02;
    pub const READ_RESP: u8 = 0x04;
    pub const READ_FAILED: u8 = 0x05;
    pub const WRITE_RESP: u8 = 0x08;
    pub const WRITE_FAILED: u8 = 0x09;
    pub const INTRP_RESP: u8 = 0x0C;
}

/// Opcodes of device-to-host (TLX) commands.
pub mod tlx_cmd {
    pub const RD_WNITC: u8 = 0x10;
    pub const PR_RD_WNITC: u8 = 0x12;
    pub const DMA_W: u8 = 0x20;
    pub const DMA_W_BE: u8 = 0x28;
    pub const DMA_PR_W: u8 = 0x30;
    pub const ASSIGN_ACTAG: u8 = 0x50;
    pub const INTRP_REQ: u8 = 0x58;
}

/// Opcodes of device-to-host (TLX) responses.
pub mod tlx_resp {
    pub const MEM_RD_RESPONSE: u8 = 0x01;
    pub const MEM_RD_FAIL: u8 = 0x02;
    pub const MEM_WR_RESPONSE: u8 = 0x04;
    pub const MEM_WR_FAIL: u8 = 0x05;
}

/// Number of 64-byte beats encoded by a 2-bit data-length code.
///
/// Code 0 is reserved; it is clamped to a single beat and the caller is
/// expected to log the irregularity.
pub fn decode_dl(dl: u8) -> usize {
    match dl & 0x3 {
        0 | 1 => 1,
        2 => 2,
        _ => 4,
    }
}

/// The 2-bit data-length code for a beat count.
pub fn encode_dl(beats: usize) -> u8 {
    match beats {
        2 => 2,
        4 => 3,
        _ => 1,
    }
}

/// Number of bytes encoded by a 3-bit partial-length code, if supported.
pub fn decode_pl(pl: u8) -> Option<usize> {
    match pl & 0x7 {
        0 => Some(1),
        1 => Some(2),
        2 => Some(4),
        3 => Some(8),
        4 => Some(16),
        5 => Some(32),
        _ => None,
    }
}

/// Number of beats encoded by a 3-bit read-count code (code 0 means the
/// full 512-byte burst).
pub fn decode_rd_cnt(cnt: u8) -> usize {
    match cnt & 0x7 {
        0 => 8,
        1 => 1,
        2 => 2,
        3 => 4,
        _ => 8,
    }
}

/// The 3-bit read-count code for a beat count.
pub fn encode_rd_cnt(beats: usize) -> u8 {
    match beats {
        1 => 1,
        2 => 2,
        4 => 3,
        _ => 0,
    }
}

/// One command, either direction. Device-issued commands fill the
/// actag/stream/ea/afutag group; host-issued commands fill pa/capptag/t.
/// Fields are meaningful only for the direction that drove them.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Command {
    pub opcode: u8,
    pub actag: u16,
    pub stream_id: u8,
    pub ea_or_obj: [u8; 9],
    pub afutag: u16,
    pub capptag: u16,
    pub dl: u8,
    pub pl: u8,
    pub be: u64,
    pub flag: u8,
    pub endian: bool,
    pub bdf: u16,
    pub pasid: u32,
    pub pg_size: u8,
    pub pa: u64,
    pub t: bool,
}

impl Command {
    /// The effective address packed into the ea_or_obj handle.
    pub fn effective_address(&self) -> u64 {
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&self.ea_or_obj[..8]);
        u64::from_le_bytes(bytes)
    }

    pub fn set_effective_address(&mut self, ea: u64) {
        self.ea_or_obj = [0; 9];
        self.ea_or_obj[..8].copy_from_slice(&ea.to_le_bytes());
    }
}

/// One 64-byte data beat with its bad-data indicator.
#[derive(Clone, PartialEq)]
pub struct DataBeat {
    pub bdi: bool,
    pub data: [u8; CACHELINE_BYTES],
}

impl Default for DataBeat {
    fn default() -> Self {
        Self {
            bdi: false,
            data: [0; CACHELINE_BYTES],
        }
    }
}

impl std::fmt::Debug for DataBeat {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        // 64 raw bytes are noise in a debug dump; show the leading word
        write!(
            f,
            "DataBeat {{ bdi: {}, data: {:02x}{:02x}{:02x}{:02x}.. }}",
            self.bdi, self.data[0], self.data[1], self.data[2], self.data[3]
        )
    }
}

/// One response, either direction. `tag` is the capptag of the command
/// being answered when the device responds, the afutag when the host does.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Response {
    pub opcode: u8,
    pub tag: u16,
    pub code: u8,
    pub dl: u8,
    pub dp: u8,
    pub pg_size: u8,
    pub addr_tag: u32,
}

/// A configuration-space command (config_read / config_write); these travel
/// on their own interface, separate from the bulk command path.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ConfigCommand {
    pub opcode: u8,
    pub pa: u64,
    pub t: bool,
    pub pl: u8,
    pub capptag: u16,
    pub data: u32,
    pub bdi: bool,
}

/// A configuration-space response: one 4-byte window placed at an aligned
/// offset within the beat, plus the ack that releases the config interface.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ConfigResponse {
    pub opcode: u8,
    pub capptag: u16,
    pub code: u8,
    pub offset: u8,
    pub data: u32,
    pub bdi: bool,
    pub ack: bool,
}

/// A consumer-issued request to stream `count` beats from a data queue.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ReadRequest {
    pub count_code: u8,
}

/// The four independent credit-return strobes.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CreditReturn {
    pub cmd: bool,
    pub cmd_data: bool,
    pub resp: bool,
    pub resp_data: bool,
}

impl CreditReturn {
    pub fn any(&self) -> bool {
        self.cmd || self.cmd_data || self.resp || self.resp_data
    }
}

/// Initial credit advertisement, sent once by each side at bring-up.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct InitialCredits {
    pub cmd: u8,
    pub cmd_data: u8,
    pub resp: u8,
    pub resp_data: u8,
}

/// Everything one endpoint drives onto the link in one clock edge.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct EventSnapshot {
    pub command: Option<Command>,
    pub command_data: Option<DataBeat>,
    pub response: Option<Response>,
    pub response_data: Option<DataBeat>,
    pub config_command: Option<ConfigCommand>,
    pub config_response: Option<ConfigResponse>,
    pub cmd_read_request: Option<ReadRequest>,
    pub resp_read_request: Option<ReadRequest>,
    pub credit_return: CreditReturn,
    pub initial_credits: Option<InitialCredits>,
}

// presence bits, in encoding order
const P_COMMAND: u16 = 1 << 0;
const P_COMMAND_DATA: u16 = 1 << 1;
const P_RESPONSE: u16 = 1 << 2;
const P_RESPONSE_DATA: u16 = 1 << 3;
const P_CONFIG_COMMAND: u16 = 1 << 4;
const P_CONFIG_RESPONSE: u16 = 1 << 5;
const P_CMD_READ_REQUEST: u16 = 1 << 6;
const P_RESP_READ_REQUEST: u16 = 1 << 7;
const P_CREDIT_RETURN: u16 = 1 << 8;
const P_INITIAL_CREDITS: u16 = 1 << 9;
const P_KNOWN: u16 = P_COMMAND
    | P_COMMAND_DATA
    | P_RESPONSE
    | P_RESPONSE_DATA
    | P_CONFIG_COMMAND
    | P_CONFIG_RESPONSE
    | P_CMD_READ_REQUEST
    | P_RESP_READ_REQUEST
    | P_CREDIT_RETURN
    | P_INITIAL_CREDITS;

impl EventSnapshot {
    /// An empty snapshot still marks a clock edge on the wire.
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    fn presence(&self) -> u16 {
        let mut bits = 0;
        if self.command.is_some() {
            bits |= P_COMMAND;
        }
        if self.command_data.is_some() {
            bits |= P_COMMAND_DATA;
        }
        if self.response.is_some() {
            bits |= P_RESPONSE;
        }
        if self.response_data.is_some() {
            bits |= P_RESPONSE_DATA;
        }
        if self.config_command.is_some() {
            bits |= P_CONFIG_COMMAND;
        }
        if self.config_response.is_some() {
            bits |= P_CONFIG_RESPONSE;
        }
        if self.cmd_read_request.is_some() {
            bits |= P_CMD_READ_REQUEST;
        }
        if self.resp_read_request.is_some() {
            bits |= P_RESP_READ_REQUEST;
        }
        if self.credit_return.any() {
            bits |= P_CREDIT_RETURN;
        }
        if self.initial_credits.is_some() {
            bits |= P_INITIAL_CREDITS;
        }
        bits
    }

    /// Encode the snapshot body (without the length prefix the transport
    /// adds). Fields are masked to their interface widths on the way out.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(32);
        buf.extend_from_slice(&self.presence().to_le_bytes());
        if let Some(cmd) = &self.command {
            buf.push(cmd.opcode);
            buf.extend_from_slice(&(mask_bits(cmd.actag as u32, 12) as u16).to_le_bytes());
            buf.push(mask_bits(cmd.stream_id as u32, 4) as u8);
            buf.extend_from_slice(&cmd.ea_or_obj);
            buf.extend_from_slice(&cmd.afutag.to_le_bytes());
            buf.extend_from_slice(&cmd.capptag.to_le_bytes());
            buf.push(mask_bits(cmd.dl as u32, 2) as u8);
            buf.push(mask_bits(cmd.pl as u32, 3) as u8);
            buf.extend_from_slice(&cmd.be.to_le_bytes());
            buf.push(mask_bits(cmd.flag as u32, 4) as u8);
            buf.push(cmd.endian as u8);
            buf.extend_from_slice(&cmd.bdf.to_le_bytes());
            buf.extend_from_slice(&mask_bits(cmd.pasid, 20).to_le_bytes());
            buf.push(mask_bits(cmd.pg_size as u32, 6) as u8);
            buf.extend_from_slice(&cmd.pa.to_le_bytes());
            buf.push(cmd.t as u8);
        }
        if let Some(beat) = &self.command_data {
            buf.push(beat.bdi as u8);
            buf.extend_from_slice(&beat.data);
        }
        if let Some(resp) = &self.response {
            buf.push(resp.opcode);
            buf.extend_from_slice(&resp.tag.to_le_bytes());
            buf.push(mask_bits(resp.code as u32, 4) as u8);
            buf.push(mask_bits(resp.dl as u32, 2) as u8);
            buf.push(mask_bits(resp.dp as u32, 2) as u8);
            buf.push(mask_bits(resp.pg_size as u32, 6) as u8);
            buf.extend_from_slice(&mask_bits(resp.addr_tag, 18).to_le_bytes());
        }
        if let Some(beat) = &self.response_data {
            buf.push(beat.bdi as u8);
            buf.extend_from_slice(&beat.data);
        }
        if let Some(cfg) = &self.config_command {
            buf.push(cfg.opcode);
            buf.extend_from_slice(&cfg.pa.to_le_bytes());
            buf.push(cfg.t as u8);
            buf.push(mask_bits(cfg.pl as u32, 3) as u8);
            buf.extend_from_slice(&cfg.capptag.to_le_bytes());
            buf.extend_from_slice(&cfg.data.to_le_bytes());
            buf.push(cfg.bdi as u8);
        }
        if let Some(cfg) = &self.config_response {
            buf.push(cfg.opcode);
            buf.extend_from_slice(&cfg.capptag.to_le_bytes());
            buf.push(mask_bits(cfg.code as u32, 4) as u8);
            buf.push(mask_bits(cfg.offset as u32, 4) as u8);
            buf.extend_from_slice(&cfg.data.to_le_bytes());
            buf.push(cfg.bdi as u8);
            buf.push(cfg.ack as u8);
        }
        if let Some(req) = &self.cmd_read_request {
            buf.push(mask_bits(req.count_code as u32, 3) as u8);
        }
        if let Some(req) = &self.resp_read_request {
            buf.push(mask_bits(req.count_code as u32, 3) as u8);
        }
        if self.credit_return.any() {
            let cr = &self.credit_return;
            buf.push(
                cr.cmd as u8
                    | (cr.cmd_data as u8) << 1
                    | (cr.resp as u8) << 2
                    | (cr.resp_data as u8) << 3,
            );
        }
        if let Some(init) = &self.initial_credits {
            buf.push(init.cmd);
            buf.push(init.cmd_data);
            buf.push(init.resp);
            buf.push(init.resp_data);
        }
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self, Error> {
        let mut r = Reader { buf, pos: 0 };
        let bits = r.u16()?;
        if bits & !P_KNOWN != 0 {
            return Err(Error::MalformedFrame("unknown presence bits"));
        }
        let mut snap = Self::default();
        if bits & P_COMMAND != 0 {
            snap.command = Some(Command {
                opcode: r.u8()?,
                actag: r.u16()?,
                stream_id: r.u8()?,
                ea_or_obj: r.bytes9()?,
                afutag: r.u16()?,
                capptag: r.u16()?,
                dl: r.u8()?,
                pl: r.u8()?,
                be: r.u64()?,
                flag: r.u8()?,
                endian: r.flag()?,
                bdf: r.u16()?,
                pasid: r.u32()?,
                pg_size: r.u8()?,
                pa: r.u64()?,
                t: r.flag()?,
            });
        }
        if bits & P_COMMAND_DATA != 0 {
            snap.command_data = Some(DataBeat {
                bdi: r.flag()?,
                data: r.cacheline()?,
            });
        }
        if bits & P_RESPONSE != 0 {
            snap.response = Some(Response {
                opcode: r.u8()?,
                tag: r.u16()?,
                code: r.u8()?,
                dl: r.u8()?,
                dp: r.u8()?,
                pg_size: r.u8()?,
                addr_tag: r.u32()?,
            });
        }
        if bits & P_RESPONSE_DATA != 0 {
            snap.response_data = Some(DataBeat {
                bdi: r.flag()?,
                data: r.cacheline()?,
            });
        }
        if bits & P_CONFIG_COMMAND != 0 {
            snap.config_command = Some(ConfigCommand {
                opcode: r.u8()?,
                pa: r.u64()?,
                t: r.flag()?,
                pl: r.u8()?,
                capptag: r.u16()?,
                data: r.u32()?,
                bdi: r.flag()?,
            });
        }
        if bits & P_CONFIG_RESPONSE != 0 {
            snap.config_response = Some(ConfigResponse {
                opcode: r.u8()?,
                capptag: r.u16()?,
                code: r.u8()?,
                offset: r.u8()?,
                data: r.u32()?,
                bdi: r.flag()?,
                ack: r.flag()?,
            });
        }
        if bits & P_CMD_READ_REQUEST != 0 {
            snap.cmd_read_request = Some(ReadRequest {
                count_code: r.u8()?,
            });
        }
        if bits & P_RESP_READ_REQUEST != 0 {
            snap.resp_read_request = Some(ReadRequest {
                count_code: r.u8()?,
            });
        }
        if bits & P_CREDIT_RETURN != 0 {
            let strobes = r.u8()?;
            snap.credit_return = CreditReturn {
                cmd: strobes & 1 != 0,
                cmd_data: strobes & 2 != 0,
                resp: strobes & 4 != 0,
                resp_data: strobes & 8 != 0,
            };
        }
        if bits & P_INITIAL_CREDITS != 0 {
            snap.initial_credits = Some(InitialCredits {
                cmd: r.u8()?,
                cmd_data: r.u8()?,
                resp: r.u8()?,
                resp_data: r.u8()?,
            });
        }
        if r.pos != buf.len() {
            return Err(Error::MalformedFrame("trailing bytes"));
        }
        Ok(snap)
    }
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], Error> {
        if self.pos + n > self.buf.len() {
            return Err(Error::MalformedFrame("frame truncated"));
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, Error> {
        Ok(self.take(1)?[0])
    }

    fn flag(&mut self) -> Result<bool, Error> {
        Ok(self.u8()? != 0)
    }

    fn u16(&mut self) -> Result<u16, Error> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32, Error> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&mut self) -> Result<u64, Error> {
        let b = self.take(8)?;
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(b);
        Ok(u64::from_le_bytes(bytes))
    }

    fn bytes9(&mut self) -> Result<[u8; 9], Error> {
        let b = self.take(9)?;
        let mut bytes = [0u8; 9];
        bytes.copy_from_slice(b);
        Ok(bytes)
    }

    fn cacheline(&mut self) -> Result<[u8; CACHELINE_BYTES], Error> {
        let b = self.take(CACHELINE_BYTES)?;
        let mut bytes = [0u8; CACHELINE_BYTES];
        bytes.copy_from_slice(b);
        Ok(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codec_roundtrip() {
        let mut cmd = Command {
            opcode: tlx_cmd::PR_RD_WNITC,
            actag: 0x01,
            afutag: 0x2A,
            dl: 1,
            pl: 3,
            bdf: 0x0100,
            pasid: 0x7,
            ..Command::default()
        };
        cmd.set_effective_address(0xDEAD_BEE0);
        let snap = EventSnapshot {
            command: Some(cmd),
            credit_return: CreditReturn {
                resp: true,
                ..CreditReturn::default()
            },
            ..EventSnapshot::default()
        };
        let decoded = EventSnapshot::decode(&snap.encode()).unwrap();
        assert_eq!(decoded, snap);
        assert_eq!(decoded.command.unwrap().effective_address(), 0xDEAD_BEE0);
    }

    #[test]
    fn test_encode_masks_field_widths() {
        let snap = EventSnapshot {
            response: Some(Response {
                opcode: tlx_resp::MEM_RD_RESPONSE,
                tag: 0xFFFF,
                code: 0xFF,     // 4-bit field
                dl: 0x7,        // 2-bit field
                addr_tag: 0xFFFF_FFFF, // 18-bit field
                ..Response::default()
            }),
            ..EventSnapshot::default()
        };
        let decoded = EventSnapshot::decode(&snap.encode()).unwrap();
        let resp = decoded.response.unwrap();
        assert_eq!(resp.code, 0xF);
        assert_eq!(resp.dl, 0x3);
        assert_eq!(resp.addr_tag, 0x3_FFFF);
        assert_eq!(resp.tag, 0xFFFF); // full 16 bits survive
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert_eq!(
            EventSnapshot::decode(&[0xFF, 0xFF]),
            Err(Error::MalformedFrame("unknown presence bits"))
        );
        let truncated = [P_RESPONSE.to_le_bytes()[0], 0, 0x04];
        assert_eq!(
            EventSnapshot::decode(&truncated),
            Err(Error::MalformedFrame("frame truncated"))
        );
    }

    #[test]
    fn test_empty_snapshot_is_two_bytes() {
        let snap = EventSnapshot::default();
        assert!(snap.is_empty());
        assert_eq!(snap.encode(), vec![0, 0]);
    }

    #[test]
    fn test_length_codes() {
        assert_eq!(decode_dl(1), 1);
        assert_eq!(decode_dl(3), 4);
        assert_eq!(decode_dl(0), 1); // reserved code clamps to one beat
        assert_eq!(encode_dl(4), 3);
        assert_eq!(decode_pl(2), Some(4));
        assert_eq!(decode_pl(7), None);
        assert_eq!(decode_rd_cnt(0), 8);
        assert_eq!(decode_rd_cnt(2), 2);
    }
}
