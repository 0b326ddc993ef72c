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

//! Socket transport carrying one event snapshot per clock edge.
//!
//! The responding endpoint (the device model) binds the first free port in
//! an auto-incrementing range and waits for the simulator to connect. The
//! blocking read in [`Channel::poll`] is the tick loop's single suspension
//! point; everything else is synchronous.

use crate::error::Error;
use crate::event::EventSnapshot;
use crate::Cycle;
use std::io::{ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};

pub const PROTOCOL_MAGIC: [u8; 4] = *b"OTLX";
pub const PROTOCOL_VERSION: (u8, u8) = (3, 0);

/// First port the responder tries; it walks upward from here.
pub const BASE_PORT: u16 = 32768;

/// A bound, not-yet-connected responder endpoint.
pub struct Listener {
    listener: TcpListener,
    port: u16,
}

impl Listener {
    /// Bind the first free port in `[base_port, 65535]`.
    pub fn bind(base_port: u16) -> Result<Self, Error> {
        let mut port = base_port;
        loop {
            match TcpListener::bind(("0.0.0.0", port)) {
                Ok(listener) => {
                    log::info!("transport: listening on port {}", port);
                    return Ok(Self { listener, port });
                }
                Err(err) if port < u16::MAX => {
                    log::trace!("transport: port {} unavailable ({}), trying next", port, err);
                    port += 1;
                }
                Err(_) => return Err(Error::TransportUnavailable),
            }
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Wait for the peer and complete the version handshake.
    pub fn accept(self) -> Result<Channel, Error> {
        let (stream, peer) = self.listener.accept()?;
        log::info!("transport: peer connected from {}", peer);
        let mut channel = Channel::new(stream, peer)?;
        let theirs = channel.read_hello()?;
        channel.write_hello()?;
        check_version(theirs)?;
        Ok(channel)
    }
}

fn check_version(theirs: (u8, u8)) -> Result<(), Error> {
    if theirs != PROTOCOL_VERSION {
        return Err(Error::ProtocolVersionMismatch {
            ours: PROTOCOL_VERSION,
            theirs,
        });
    }
    Ok(())
}

/// An established per-edge event channel.
pub struct Channel {
    stream: TcpStream,
    peer: SocketAddr,
    outbound: Option<EventSnapshot>,
    cycle: Cycle,
    closed: bool,
}

impl Channel {
    fn new(stream: TcpStream, peer: SocketAddr) -> Result<Self, Error> {
        stream.set_nodelay(true)?;
        Ok(Self {
            stream,
            peer,
            outbound: None,
            cycle: 0,
            closed: false,
        })
    }

    /// Connect to a responder whose port is already known (or discovered by
    /// an out-of-band probe) and complete the version handshake.
    pub fn connect<A: ToSocketAddrs>(endpoint: A) -> Result<Self, Error> {
        let stream = TcpStream::connect(endpoint)?;
        let peer = stream.peer_addr()?;
        log::info!("transport: connected to {}", peer);
        let mut channel = Self::new(stream, peer)?;
        channel.write_hello()?;
        let theirs = channel.read_hello()?;
        check_version(theirs)?;
        Ok(channel)
    }

    fn write_hello(&mut self) -> Result<(), Error> {
        let mut hello = [0u8; 6];
        hello[..4].copy_from_slice(&PROTOCOL_MAGIC);
        hello[4] = PROTOCOL_VERSION.0;
        hello[5] = PROTOCOL_VERSION.1;
        self.stream.write_all(&hello)?;
        Ok(())
    }

    fn read_hello(&mut self) -> Result<(u8, u8), Error> {
        let mut hello = [0u8; 6];
        self.stream.read_exact(&mut hello)?;
        if hello[..4] != PROTOCOL_MAGIC {
            return Err(Error::MalformedFrame("bad handshake magic"));
        }
        Ok((hello[4], hello[5]))
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Cycles observed on this channel, i.e. snapshots yielded by `poll`.
    pub fn cycle(&self) -> Cycle {
        self.cycle
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Stage the outbound snapshot for the next edge. Only the most recent
    /// call before `flush` takes effect.
    pub fn send(&mut self, snapshot: EventSnapshot) {
        if self.outbound.is_some() {
            log::trace!("transport: outbound snapshot replaced before edge");
        }
        self.outbound = Some(snapshot);
    }

    /// Drive the staged snapshot (or an empty edge marker) onto the wire.
    pub fn flush(&mut self) -> Result<(), Error> {
        let snapshot = self.outbound.take().unwrap_or_default();
        let body = snapshot.encode();
        debug_assert!(body.len() <= u16::MAX as usize);
        let mut frame = Vec::with_capacity(2 + body.len());
        frame.extend_from_slice(&(body.len() as u16).to_le_bytes());
        frame.extend_from_slice(&body);
        self.stream.write_all(&frame)?;
        Ok(())
    }

    /// Block until the peer's next edge arrives. Returns `None` and marks
    /// the channel closed on orderly disconnect.
    pub fn poll(&mut self) -> Result<Option<EventSnapshot>, Error> {
        if self.closed {
            return Ok(None);
        }
        let mut len_bytes = [0u8; 2];
        match self.stream.read_exact(&mut len_bytes) {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::UnexpectedEof => {
                log::info!("transport: peer {} disconnected", self.peer);
                self.closed = true;
                return Ok(None);
            }
            Err(err) => return Err(err.into()),
        }
        let len = u16::from_le_bytes(len_bytes) as usize;
        let mut body = vec![0u8; len];
        self.stream.read_exact(&mut body)?;
        let snapshot = EventSnapshot::decode(&body)?;
        self.cycle += 1;
        Ok(Some(snapshot))
    }
}
