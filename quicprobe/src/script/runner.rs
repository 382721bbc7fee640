//! # Script Runner
//!
//! Runs a [`Script`] against a server [`Endpoint`] with deterministic
//! collaborators: plaintext crypto, an in-memory network and seeded
//! randomness. Everything the endpoint sends is opened by the raw
//! client and kept, so later steps can assert on it.

use bytes::Bytes;
use quicprobe_quic::connection::handshake::build_client_hello;
use quicprobe_quic::peer::cid_from_hex;
use quicprobe_quic::tls::HandshakeMessage;
use quicprobe_quic::{
    Connection, ConnectionId, EncryptionLevel, Endpoint, EndpointConfig, Event, Frame,
    MemoryNetwork, PlaintextCrypto, RawClient, SeededRandom, StreamId, Timer,
};
use std::net::SocketAddr;
use tracing::{debug, info};

use super::{PeerSpec, Script, ScriptError, Step};

const CLIENT_ADDR: ([u8; 4], u16) = ([127, 0, 0, 1], 50000);

/// Summary of a completed run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunReport {
    pub name: String,
    pub steps: usize,
    pub events: usize,
    pub frames_received: usize,

    /// Error codes recorded by the connection under test
    pub error_codes: Vec<u64>,
}

pub struct Runner {
    server: Endpoint,
    net: MemoryNetwork,
    peer: RawClient,
    rng: SeededRandom,
    client_addr: SocketAddr,

    events: Vec<Event>,
    event_cursor: usize,
    frames: Vec<Frame>,
    frame_cursor: usize,
}

impl Runner {
    pub fn new(config: EndpointConfig, seed: u64, peer: &PeerSpec) -> Result<Self, ScriptError> {
        let invalid = |reason: String| ScriptError::InvalidStep {
            step: 0,
            action: "peer",
            reason,
        };
        let dcid = cid_from_hex(&peer.dcid).map_err(|e| invalid(e.to_string()))?;
        let scid = cid_from_hex(&peer.scid).map_err(|e| invalid(e.to_string()))?;
        let client = RawClient::new(dcid, scid).map_err(|e| invalid(e.to_string()))?;

        let net = MemoryNetwork::new();
        let server = Endpoint::new(
            config,
            Box::new(PlaintextCrypto::new()),
            Box::new(net.clone()),
            Box::new(SeededRandom::new(seed)),
        );
        Ok(Self {
            server,
            net,
            peer: client,
            rng: SeededRandom::new(peer.seed),
            client_addr: SocketAddr::from(CLIENT_ADDR),
            events: Vec::new(),
            event_cursor: 0,
            frames: Vec::new(),
            frame_cursor: 0,
        })
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.server
    }

    /// Every event observed so far
    pub fn events(&self) -> &[Event] {
        &self.events
    }

    /// Every frame the peer received so far
    pub fn frames(&self) -> &[Frame] {
        &self.frames
    }

    fn key(&self) -> ConnectionId {
        self.peer.key().clone()
    }

    fn connection(&self) -> Option<&Connection> {
        self.server.connection(self.peer.key())
    }

    /// Run every step, stopping at the first failure.
    pub fn run(&mut self, script: &Script) -> Result<RunReport, ScriptError> {
        info!(script = script.name(), steps = script.steps.len(), "running script");
        for (index, step) in script.steps.iter().enumerate() {
            let number = index + 1;
            debug!(step = number, action = step.action(), "step");
            self.step(number, step)?;
        }
        Ok(RunReport {
            name: script.name().to_string(),
            steps: script.steps.len(),
            events: self.events.len(),
            frames_received: self.frames.len(),
            error_codes: self
                .connection()
                .map(|c| c.error_codes().iter().copied().collect())
                .unwrap_or_default(),
        })
    }

    fn step(&mut self, number: usize, step: &Step) -> Result<(), ScriptError> {
        let action = step.action();
        let invalid = |reason: String| ScriptError::InvalidStep {
            step: number,
            action,
            reason,
        };
        let quic = |source: quicprobe_quic::Error| ScriptError::Quic {
            step: number,
            action,
            source,
        };
        let failed = |message: String| ScriptError::Expectation {
            step: number,
            action,
            message,
        };
        let key = self.key();

        match step {
            Step::ClientHello {
                omit_transport_parameters,
                initial_source_connection_id,
            } => {
                let mut params = self.peer.transport_parameters();
                if let Some(hex) = initial_source_connection_id {
                    params.initial_source_connection_id =
                        Some(cid_from_hex(hex).map_err(|e| invalid(e.to_string()))?);
                }
                let datagram = if *omit_transport_parameters {
                    let mut hello = build_client_hello(&mut self.rng, &params);
                    if let HandshakeMessage::ClientHello(h) = &mut hello {
                        h.extensions.clear();
                    }
                    let data = hello.to_bytes().map_err(quic)?;
                    let frame = self.peer.crypto_frame(EncryptionLevel::Initial, data);
                    self.peer.packet(EncryptionLevel::Initial, vec![frame])
                } else {
                    self.peer.client_hello(&mut self.rng, &params)
                }
                .map_err(quic)?;
                self.deliver(datagram).map_err(quic)?;
            }
            Step::Send {
                level,
                frames,
                packet_number,
            } => {
                let level = EncryptionLevel::from(*level);
                let frames = frames
                    .iter()
                    .cloned()
                    .map(|spec| spec.into_frame(&mut self.peer, level))
                    .collect::<Result<Vec<Frame>, String>>()
                    .map_err(invalid)?;
                let datagram = match packet_number {
                    Some(pn) => self.peer.packet_with_number(level, *pn, frames),
                    None => self.peer.packet(level, frames),
                }
                .map_err(quic)?;
                self.deliver(datagram).map_err(quic)?;
            }
            Step::OpenStream {
                bidirectional,
                expect_id,
            } => {
                let id = self.server.open_stream(&key, *bidirectional).map_err(quic)?;
                self.collect().map_err(quic)?;
                if let Some(expected) = expect_id {
                    if id.0 != *expected {
                        return Err(failed(format!("opened stream {}, expected {expected}", id.0)));
                    }
                }
            }
            Step::AppSend {
                stream_id,
                data,
                fin,
                expect_error,
            } => {
                let result = self.server.stream_send(
                    &key,
                    StreamId(*stream_id),
                    Bytes::from(data.clone()),
                    *fin,
                );
                self.collect().map_err(quic)?;
                match (result, *expect_error) {
                    (Ok(()), false) => {}
                    (Err(e), true) => debug!(error = %e, "expected write error"),
                    (Ok(()), true) => return Err(failed("write succeeded".to_string())),
                    (Err(e), false) => return Err(quic(e)),
                }
            }
            Step::AppRead {
                stream_id,
                expect_data,
                expect_fin,
                expect_error,
            } => {
                let result = self.server.stream_read(&key, StreamId(*stream_id));
                self.collect().map_err(quic)?;
                match (result, *expect_error) {
                    (Ok((data, fin)), false) => {
                        if let Some(expected) = expect_data {
                            if data[..] != *expected.as_bytes() {
                                return Err(failed(format!(
                                    "read {:?}, expected {expected:?}",
                                    String::from_utf8_lossy(&data)
                                )));
                            }
                        }
                        if let Some(expected) = expect_fin {
                            if fin != *expected {
                                return Err(failed(format!("fin {fin}, expected {expected}")));
                            }
                        }
                    }
                    (Err(e), true) => debug!(error = %e, "expected read error"),
                    (Ok(_), true) => return Err(failed("read succeeded".to_string())),
                    (Err(e), false) => return Err(quic(e)),
                }
            }
            Step::Close { error_code, reason } => {
                self.server.close(&key, *error_code, reason).map_err(quic)?;
                self.collect().map_err(quic)?;
            }
            Step::Tick { timer } => {
                let timer =
                    Timer::from_name(timer).ok_or_else(|| invalid(format!("unknown timer {timer:?}")))?;
                self.server.tick(&key, timer).map_err(quic)?;
                self.collect().map_err(quic)?;
            }
            Step::ExpectEvent { events } => self.expect_events(events).map_err(failed)?,
            Step::ExpectStream {
                stream_id,
                send_state,
                recv_state,
            } => {
                let conn = self.connection().ok_or_else(|| failed("no connection".to_string()))?;
                let id = StreamId(*stream_id);
                let send = conn.send_stream_state(id).map(|s| format!("{s:?}"));
                let recv = conn.recv_stream_state(id).map(|s| format!("{s:?}"));
                for (half, expected, actual) in [("send", send_state, send), ("recv", recv_state, recv)] {
                    if let Some(expected) = expected {
                        let actual = actual.unwrap_or_else(|| "none".to_string());
                        if !actual.eq_ignore_ascii_case(expected) {
                            return Err(failed(format!(
                                "stream {stream_id} {half} state {actual}, expected {expected}"
                            )));
                        }
                    }
                }
            }
            Step::ExpectState { state, error_code } => {
                let conn = self.connection().ok_or_else(|| failed("no connection".to_string()))?;
                let actual = format!("{:?}", conn.state());
                if !actual.eq_ignore_ascii_case(state) {
                    return Err(failed(format!("connection state {actual}, expected {state}")));
                }
                if let Some(code) = error_code {
                    if !conn.error_codes().contains(code) {
                        return Err(failed(format!(
                            "error code {code:#x} not recorded (have {:?})",
                            conn.error_codes()
                        )));
                    }
                }
            }
            Step::ExpectFrame { frame, present } => self.expect_frame(frame, *present).map_err(failed)?,
        }
        Ok(())
    }

    fn deliver(&mut self, datagram: Bytes) -> quicprobe_quic::Result<()> {
        self.server.recv(self.client_addr, datagram)?;
        self.collect()
    }

    /// Move what the endpoint sent and reported into the run's logs.
    fn collect(&mut self) -> quicprobe_quic::Result<()> {
        for datagram in self.net.drain() {
            for packet in self.peer.receive(&datagram.payload)? {
                debug!(
                    level = packet.level.name(),
                    pn = packet.packet_number,
                    frames = packet.frames.len(),
                    "peer received packet"
                );
                self.frames.extend(packet.frames);
            }
        }
        self.events.extend(self.server.drain_events());
        Ok(())
    }

    /// Match `patterns` as an ordered subsequence of the unmatched events.
    fn expect_events(&mut self, patterns: &[String]) -> Result<(), String> {
        let mut cursor = self.event_cursor;
        for pattern in patterns {
            let (name, detail) = match pattern.split_once(':') {
                Some((name, detail)) => (name, Some(detail)),
                None => (pattern.as_str(), None),
            };
            let found = self.events[cursor..].iter().position(|event| {
                event.name() == name
                    && detail.map_or(true, |d| {
                        event
                            .detail()
                            .map_or(false, |actual| actual.eq_ignore_ascii_case(d))
                    })
            });
            match found {
                Some(offset) => cursor += offset + 1,
                None => {
                    let seen: Vec<String> = self.events[self.event_cursor..]
                        .iter()
                        .map(|e| match e.detail() {
                            Some(d) => format!("{}:{d}", e.name()),
                            None => e.name().to_string(),
                        })
                        .collect();
                    return Err(format!("event {pattern} not found after earlier matches; saw {seen:?}"));
                }
            }
        }
        self.event_cursor = cursor;
        Ok(())
    }

    fn expect_frame(&mut self, name: &str, present: bool) -> Result<(), String> {
        let found = self.frames[self.frame_cursor..]
            .iter()
            .position(|frame| frame.name() == name);
        match (found, present) {
            (Some(offset), true) => {
                self.frame_cursor += offset + 1;
                Ok(())
            }
            (None, false) => Ok(()),
            (Some(_), false) => Err(format!("peer received unexpected {name} frame")),
            (None, true) => Err(format!("peer did not receive a {name} frame")),
        }
    }
}

impl std::fmt::Debug for Runner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runner")
            .field("key", self.peer.key())
            .field("events", &self.events.len())
            .field("frames", &self.frames.len())
            .finish()
    }
}
