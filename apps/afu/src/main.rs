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

use env_logger::Target;
use std::path::PathBuf;
use structopt::StructOpt;

use afu::{Afu, DescriptorConfig};

#[derive(StructOpt)]
#[structopt(name = "afu", about = "Software AFU endpoint for the TLX bus-functional bridge")]
struct Arguments {
    /// first port tried by the responder; search walks upward from here
    #[structopt(short, long, default_value = "32768")]
    port: u16,
    /// YAML descriptor seeding registers and context machine tables
    #[structopt(short, long)]
    descriptor: PathBuf,
    /// seed for command delays and addresses
    #[structopt(short, long, default_value = "42")]
    seed: u64,
    /// write a waveform trace of the link signals here
    #[structopt(long)]
    vcd: Option<PathBuf>,
    /// raise the drain request after this many cycles
    #[structopt(long)]
    drain_after: Option<usize>,
}

fn main() {
    let args = Arguments::from_args();

    let _logger = env_logger::builder()
        .filter(Some("afu"), log::LevelFilter::Debug)
        .filter(Some("tlx"), log::LevelFilter::Debug)
        .target(Target::Stderr)
        .init();

    let config = DescriptorConfig::load(&args.descriptor).expect("Failed to load descriptor");
    let mut device = Afu::serve(args.port, config, args.seed, args.vcd.as_deref())
        .expect("Failed to bring the link up");
    if let Some(cycles) = args.drain_after {
        device.set_drain_after(cycles);
    }
    device.run().expect("Device run failed");
}
