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

//! Waveform dumps of the link-level signals (valid strobes, credit
//! counts), one VCD timestamp per simulated cycle.
//!
//! Write failures latch an error state and are logged once; tracing never
//! takes the session down.

use chrono;
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path;
use vcd;

const DEFAULT_VCD_HEADER: &str = "tlx VCD";
const DEFAULT_TOP_MODULE: &str = "link";

pub struct VcdTrace {
    writer: vcd::Writer<io::BufWriter<fs::File>>,
    is_error_state: bool,
    id_map: HashMap<&'static str, (vcd::IdCode, u32)>,
    last_value_map: HashMap<vcd::IdCode, u64>,
    timestamp: u64,
}

impl VcdTrace {
    /// Open `path` and write the declaration section for the given signal
    /// set: `(name, width_in_bits)`, width 1 meaning a scalar strobe.
    pub fn create<P: AsRef<path::Path>>(
        path: P,
        signals: &[(&'static str, u32)],
    ) -> io::Result<Self> {
        let file = fs::File::create(path)?;
        let mut writer = vcd::Writer::new(io::BufWriter::new(file));
        writer.comment(DEFAULT_VCD_HEADER)?;
        writer.date(chrono::Utc::now().to_string().as_str())?;
        writer.timescale(1, vcd::TimescaleUnit::NS)?;
        writer.add_module(DEFAULT_TOP_MODULE)?;
        let mut id_map = HashMap::new();
        for &(name, width) in signals {
            let id_code = writer.add_wire(width, name)?;
            id_map.insert(name, (id_code, width));
        }
        writer.upscope()?;
        writer.enddefinitions()?;
        Ok(Self {
            writer,
            is_error_state: false,
            id_map,
            last_value_map: HashMap::new(),
            timestamp: 0,
        })
    }

    fn vcd_error_handler(&mut self, err: io::Error) {
        if !self.is_error_state {
            self.is_error_state = true;
            log::error!("VCD writing failed with error {:?}", err);
        }
    }

    /// Start the next cycle's timestamp.
    pub fn enter_cycle(&mut self) {
        if self.is_error_state {
            return;
        }
        let timestamp = self.timestamp;
        if let Err(err) = self.writer.timestamp(timestamp) {
            self.vcd_error_handler(err);
        }
        self.timestamp += 1;
    }

    pub fn change_scalar(&mut self, name: &str, value: bool) {
        self.change_value(name, value as u64);
    }

    pub fn change_vector(&mut self, name: &str, value: u32) {
        self.change_value(name, value as u64);
    }

    fn change_value(&mut self, name: &str, value: u64) {
        if self.is_error_state {
            return;
        }
        let (id_code, width) = match self.id_map.get(name) {
            Some(&entry) => entry,
            None => {
                log::warn!("No such signal {} was defined for VCD dumps.", name);
                return;
            }
        };
        if self.last_value_map.get(&id_code) == Some(&value) {
            return;
        }
        let result = if width == 1 {
            self.writer
                .change_scalar(id_code, if value != 0 { vcd::Value::V1 } else { vcd::Value::V0 })
        } else {
            let bits: Vec<vcd::Value> = (0..width)
                .rev()
                .map(|bit| {
                    if value >> bit & 1 != 0 {
                        vcd::Value::V1
                    } else {
                        vcd::Value::V0
                    }
                })
                .collect();
            self.writer.change_vector(id_code, &bits)
        };
        match result {
            Ok(()) => {
                self.last_value_map.insert(id_code, value);
            }
            Err(err) => self.vcd_error_handler(err),
        }
    }
}
