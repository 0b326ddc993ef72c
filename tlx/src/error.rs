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

use crate::credit::CreditKind;
use crate::Cycle;
use std::fmt;

#[derive(Debug, Eq, PartialEq)]
pub enum Error {
    /// The peer speaks a different protocol revision.
    ProtocolVersionMismatch { ours: (u8, u8), theirs: (u8, u8) },
    /// No listening socket could be established in the port search range.
    TransportUnavailable,
    /// The socket failed mid-session.
    TransportError(String),
    /// A malformed frame arrived on the wire.
    MalformedFrame(&'static str),
    /// The afutag pool has no free entry.
    TagPoolExhausted,
    /// A tag arrived that is not currently bound to any requester.
    UnknownTag(u16),
    /// Beats were enqueued for a transfer whose drain is still in flight.
    ConcurrentFragmentConflict,
    /// No data phase arrived within the bounded wait.
    DataPhaseTimeout { cycle: Cycle, opcode: u8 },
    /// An issue retried past the bounded number of cycles.
    CreditStarvation { kind: CreditKind, cycle: Cycle },
    /// A credit pool was negotiated twice.
    CreditRenegotiation(CreditKind),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::ProtocolVersionMismatch { ours, theirs } => {
                write!(
                    f,
                    "ERROR: protocol version mismatch (ours {}.{}, peer {}.{})",
                    ours.0, ours.1, theirs.0, theirs.1
                )
            }
            Self::TransportError(msg) => write!(f, "ERROR: transport failed: {}", msg),
            Self::MalformedFrame(what) => write!(f, "ERROR: malformed frame: {}", what),
            Self::UnknownTag(tag) => write!(f, "ERROR: tag 0x{:04x} is not bound", tag),
            Self::DataPhaseTimeout { cycle, opcode } => {
                write!(
                    f,
                    "ERROR: data phase timed out at cycle {} (opcode 0x{:02x})",
                    cycle, opcode
                )
            }
            Self::CreditStarvation { kind, cycle } => {
                write!(f, "ERROR: starved for {} credit at cycle {}", kind, cycle)
            }
            _ => write!(f, "{:?}", self),
        }
    }
}

// this is needed to allow `anyhow::Result` to accept our definition of
// errors in the app binaries.
impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        None
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::TransportError(err.to_string())
    }
}
