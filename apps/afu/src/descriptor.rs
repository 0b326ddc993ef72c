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

//! The device's register file: config space plus a sparse 64-byte-line
//! memory for everything the host addresses by MMIO.
//!
//! A YAML descriptor seeds the initial register values and the per-context
//! machine tables, standing in for the host application that would write
//! them over the link.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use tlx::regfile::RegisterFile;
use tlx::CACHELINE_BYTES;

/// Byte stride between per-context MMIO blocks.
pub const CONTEXT_STRIDE: u64 = 0x1000;

/// Byte stride between machine config tables within a context block.
pub const MACHINE_STRIDE: u64 = 0x20;

/// Context slots probed during discovery.
pub const MAX_CONTEXTS: u16 = 4;

/// Machine tables probed per context.
pub const MAX_MACHINES: u16 = 4;

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct RegisterInit {
    pub offset: u32,
    pub value: u32,
}

/// One machine's command-generation parameters; packed into the 4-word
/// config table the discovery path reads back through the register file.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct MachineInit {
    /// Machine-level command code (0x12 load, 0x20 store, 0x58 interrupt).
    pub command: u16,
    #[serde(default)]
    pub min_delay: u16,
    #[serde(default = "default_max_delay")]
    pub max_delay: u16,
    #[serde(default = "default_command_size")]
    pub command_size: u16,
    pub base_address: u64,
    pub memory_size: u64,
    #[serde(default)]
    pub abort: u8,
    /// Parity-check bits carried with the data path, not interpreted.
    #[serde(default)]
    pub parity: u8,
    /// One command then stop, instead of free-running.
    #[serde(default)]
    pub enable_once: bool,
}

fn default_max_delay() -> u16 {
    16
}

fn default_command_size() -> u16 {
    8
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ContextInit {
    pub context: u16,
    /// Host-side status word the controller writes and polls; 0 disables
    /// the status handshake.
    #[serde(default)]
    pub status_address: u64,
    pub machines: Vec<MachineInit>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct DescriptorConfig {
    pub name: String,
    #[serde(default)]
    pub registers: Vec<RegisterInit>,
    #[serde(default)]
    pub contexts: Vec<ContextInit>,
}

impl DescriptorConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let text = fs::read_to_string(path.as_ref())?;
        let config: Self = serde_yaml::from_str(&text)?;
        Ok(config)
    }
}

impl MachineInit {
    /// The 4-word config table layout the discovery path decodes:
    /// word 0: [63] enable-always, [62] enable-once, [60:48] command code,
    /// [47:32] context, [31:16] min delay, [15:0] max delay;
    /// word 1: [62:60] abort, [59:48] command size, [47:44] parity bits
    /// (low half holds the recorded status); word 2: base address;
    /// word 3: memory size.
    pub fn pack(&self, context: u16) -> [u64; 4] {
        let enable = if self.enable_once { 1u64 << 62 } else { 1u64 << 63 };
        let word0 = enable
            | ((self.command as u64 & 0x1FFF) << 48)
            | ((context as u64) << 32)
            | ((self.min_delay as u64) << 16)
            | self.max_delay as u64;
        let word1 = ((self.abort as u64 & 0x7) << 60)
            | ((self.command_size as u64 & 0xFFF) << 48)
            | ((self.parity as u64 & 0xF) << 44);
        [word0, word1, self.base_address, self.memory_size]
    }
}

/// Sparse line-granular storage (config space and MMIO live in one address
/// space; untouched lines read as zero).
#[derive(Clone, Debug, Default)]
pub struct Descriptor {
    lines: HashMap<u64, [u8; CACHELINE_BYTES]>,
}

impl Descriptor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed registers and machine tables from the descriptor config.
    pub fn from_config(config: &DescriptorConfig) -> Self {
        let mut descriptor = Self::new();
        for init in &config.registers {
            descriptor.set_register(init.offset, init.value);
        }
        for ctx in &config.contexts {
            let base = CONTEXT_STRIDE * ctx.context as u64;
            for (m, machine) in ctx.machines.iter().enumerate() {
                let words = machine.pack(ctx.context);
                let mut offset = base + MACHINE_STRIDE * m as u64;
                for word in words.iter() {
                    descriptor.write_qword(offset, *word);
                    offset += 8;
                }
            }
        }
        descriptor
    }

    pub fn read_qword(&self, offset: u64) -> u64 {
        let mut bytes = [0u8; 8];
        self.read_bytes(offset as u32, &mut bytes);
        u64::from_le_bytes(bytes)
    }

    pub fn write_qword(&mut self, offset: u64, value: u64) {
        self.write_bytes(offset as u32, &value.to_le_bytes());
    }
}

impl RegisterFile for Descriptor {
    fn get_register(&self, offset: u32) -> u32 {
        let line_addr = offset as u64 & !(CACHELINE_BYTES as u64 - 1);
        let sub = (offset as usize) & (CACHELINE_BYTES - 1) & !0x3;
        match self.lines.get(&line_addr) {
            Some(line) => {
                u32::from_le_bytes([line[sub], line[sub + 1], line[sub + 2], line[sub + 3]])
            }
            None => 0,
        }
    }

    fn set_register(&mut self, offset: u32, value: u32) {
        let line_addr = offset as u64 & !(CACHELINE_BYTES as u64 - 1);
        let sub = (offset as usize) & (CACHELINE_BYTES - 1) & !0x3;
        let line = self
            .lines
            .entry(line_addr)
            .or_insert([0; CACHELINE_BYTES]);
        line[sub..sub + 4].copy_from_slice(&value.to_le_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descriptor_seeds_registers_and_tables() {
        let yaml = r#"
name: demo
registers:
  - { offset: 0x404, value: 0x1 }
contexts:
  - context: 1
    status_address: 0x9000
    machines:
      - { command: 0x12, min_delay: 2, max_delay: 8, command_size: 4,
          base_address: 0x2000, memory_size: 0x1000 }
"#;
        let config: DescriptorConfig = serde_yaml::from_str(yaml).unwrap();
        let descriptor = Descriptor::from_config(&config);
        assert_eq!(descriptor.get_register(0x404), 0x1);

        let word0 = descriptor.read_qword(CONTEXT_STRIDE);
        assert_eq!(word0 >> 63, 1); // enable-always
        assert_eq!((word0 >> 48) & 0x1FFF, 0x12);
        assert_eq!((word0 >> 32) & 0xFFFF, 1);
        assert_eq!((word0 >> 16) & 0xFFFF, 2);
        assert_eq!(word0 & 0xFFFF, 8);
        assert_eq!(descriptor.read_qword(CONTEXT_STRIDE + 0x10), 0x2000);
        assert_eq!(descriptor.read_qword(CONTEXT_STRIDE + 0x18), 0x1000);
    }

    #[test]
    fn test_untouched_lines_read_zero() {
        let descriptor = Descriptor::new();
        assert_eq!(descriptor.get_register(0xBEEF & !0x3), 0);
        assert_eq!(descriptor.read_qword(0x4000), 0);
    }
}
