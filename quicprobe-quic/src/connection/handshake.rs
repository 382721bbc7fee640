//! # Handshake Driving (RFC 9001 Section 4)
//!
//! Feeds reassembled CRYPTO data into the handshake parser and reacts to
//! each complete message.
//!
//! ## Server
//!
//! ClientHello (Initial) → ServerHello (Initial) → Handshake keys →
//! EncryptedExtensions (Handshake) → 1-RTT keys → HANDSHAKE_DONE (1-RTT).
//!
//! ## Client
//!
//! ServerHello (Initial) → Handshake keys; EncryptedExtensions
//! (Handshake) → 1-RTT keys; HANDSHAKE_DONE confirms.
//!
//! Key derivation belongs to the crypto service; this module only tells
//! it when a level becomes available.

#![forbid(unsafe_code)]

use super::events::{Direction, Event};
use super::handlers::{issue_connection_ids, HandlerContext, PacketInfo};
use super::state::{Connection, ConnectionState};
use crate::crypto::{CryptoService, EncryptionLevel};
use crate::error::{
    Error, Result, ALERT_HANDSHAKE_FAILURE, ALERT_MISSING_EXTENSION, ALERT_UNEXPECTED_MESSAGE,
};
use crate::frames::{CryptoFrame, Frame};
use crate::services::RandomSource;
use crate::tls::{
    find_transport_parameters, select_cipher_suite, ClientHello, EncryptedExtensions, Extension,
    HandshakeMessage, Random, ServerHello, LEGACY_VERSION, SUPPORTED_CIPHER_SUITES,
};
use crate::transport::TransportParameters;
use crate::types::{ConnectionId, Side};
use bytes::Bytes;
use std::collections::VecDeque;
use tracing::{debug, info};

fn random(rng: &mut dyn RandomSource) -> Random {
    let mut bytes = [0u8; 32];
    rng.fill(&mut bytes);
    Random::from_bytes(bytes)
}

/// ClientHello offering every supported suite and carrying `params`.
pub fn build_client_hello(rng: &mut dyn RandomSource, params: &TransportParameters) -> HandshakeMessage {
    HandshakeMessage::ClientHello(ClientHello {
        client_version: LEGACY_VERSION,
        random: random(rng),
        session_id: Bytes::new(),
        cipher_suites: SUPPORTED_CIPHER_SUITES.to_vec(),
        compression_methods: Bytes::from_static(&[0]),
        extensions: vec![Extension::QuicTransportParameters(params.to_list())],
    })
}

/// ServerHello answering `hello` with `cipher_suite`.
pub fn build_server_hello(rng: &mut dyn RandomSource, hello: &ClientHello, cipher_suite: u16) -> HandshakeMessage {
    HandshakeMessage::ServerHello(ServerHello {
        server_version: LEGACY_VERSION,
        random: random(rng),
        session_id: hello.session_id.clone(),
        cipher_suite,
        compression_method: 0,
        extensions: Vec::new(),
    })
}

pub fn build_encrypted_extensions(params: &TransportParameters) -> HandshakeMessage {
    HandshakeMessage::EncryptedExtensions(EncryptedExtensions {
        extensions: vec![Extension::QuicTransportParameters(params.to_list())],
    })
}

/// Encode `message` into a CRYPTO frame queued at `level`.
pub(crate) fn send_message(
    conn: &mut Connection,
    level: EncryptionLevel,
    message: &HandshakeMessage,
    events: &mut VecDeque<Event>,
) -> Result<()> {
    let data = message.to_bytes()?;
    let frame = conn.space_mut(level).crypto.next_frame(data);
    conn.queue(level, Frame::Crypto(frame));
    debug!(cid = %conn.key_cid(), message = message.name(), level = level.name(), "handshake message queued");
    events.push_back(Event::TlsHandshake {
        cid: conn.key_cid().clone(),
        direction: Direction::Sent,
        message: message.name(),
    });
    Ok(())
}

fn install(
    conn: &Connection,
    crypto: &mut dyn CryptoService,
    level: EncryptionLevel,
    events: &mut VecDeque<Event>,
) -> Result<()> {
    crypto.install_keys(conn.key_cid(), level)?;
    debug!(cid = %conn.key_cid(), level = level.name(), "keys established");
    events.push_back(Event::KeysEstablished {
        cid: conn.key_cid().clone(),
        level,
    });
    Ok(())
}

/// CRYPTO frame: reassemble, then act on every complete message.
pub(crate) fn on_crypto_frame(
    conn: &mut Connection,
    cx: &mut HandlerContext<'_>,
    frame: &CryptoFrame,
    packet: &PacketInfo<'_>,
) -> Result<()> {
    let messages = {
        let stream = &mut conn.space_mut(packet.level).crypto;
        stream.on_frame(frame)?;
        stream.poll_messages()?
    };
    for message in messages {
        on_message(conn, cx, message, packet)?;
    }
    Ok(())
}

fn on_message(
    conn: &mut Connection,
    cx: &mut HandlerContext<'_>,
    message: HandshakeMessage,
    packet: &PacketInfo<'_>,
) -> Result<()> {
    let unexpected = Error::Crypto {
        alert: ALERT_UNEXPECTED_MESSAGE,
    };
    match (conn.side(), packet.level, message) {
        (Side::Server, EncryptionLevel::Initial, HandshakeMessage::ClientHello(hello)) => {
            if conn.handshake.hello {
                debug!(cid = %conn.key_cid(), "ignoring repeated ClientHello");
                return Ok(());
            }
            server_on_client_hello(conn, cx, &hello, packet.src_cid)
        }
        (Side::Client, EncryptionLevel::Initial, HandshakeMessage::ServerHello(hello)) => {
            if conn.handshake.hello {
                return Err(unexpected);
            }
            client_on_server_hello(conn, cx, &hello)
        }
        (Side::Client, EncryptionLevel::Handshake, HandshakeMessage::EncryptedExtensions(ee)) => {
            if conn.handshake.peer_params {
                return Err(unexpected);
            }
            client_on_encrypted_extensions(conn, cx, &ee, packet.src_cid)
        }
        (_, _, HandshakeMessage::Unknown { msg_type, .. }) => {
            // certificates, finished and tickets carry nothing we act on
            debug!(cid = %conn.key_cid(), msg_type, "ignoring handshake message");
            Ok(())
        }
        (_, level, message) => {
            debug!(cid = %conn.key_cid(), message = message.name(), level = level.name(), "unexpected handshake message");
            Err(unexpected)
        }
    }
}

/// Check the peer's initial_source_connection_id against the Source
/// Connection ID of its long header (RFC 9000 Section 7.3).
fn check_initial_scid(params: &TransportParameters, header_scid: &ConnectionId) -> Result<()> {
    match &params.initial_source_connection_id {
        Some(cid) if cid == header_scid => Ok(()),
        Some(_) => Err(Error::transport_parameter("initial_source_connection_id mismatch")),
        None => Err(Error::transport_parameter("initial_source_connection_id missing")),
    }
}

fn server_on_client_hello(
    conn: &mut Connection,
    cx: &mut HandlerContext<'_>,
    hello: &ClientHello,
    header_scid: &ConnectionId,
) -> Result<()> {
    let key = conn.key_cid().clone();
    cx.events
        .push_back(Event::TlsClientInitialRequest { cid: key.clone() });

    let params = find_transport_parameters(&hello.extensions)
        .map(|list| TransportParameters::from_list(list.iter().cloned()))
        .ok_or(Error::Crypto {
            alert: ALERT_MISSING_EXTENSION,
        })?;
    params.validate(Side::Client)?;
    check_initial_scid(&params, header_scid)?;

    let suite = select_cipher_suite(&hello.cipher_suites).ok_or(Error::Crypto {
        alert: ALERT_HANDSHAKE_FAILURE,
    })?;

    conn.handshake.hello = true;
    conn.apply_peer_params(params, cx.events);
    conn.set_state(ConnectionState::Handshaking, cx.events);

    let server_hello = build_server_hello(cx.rng, hello, suite);
    send_message(conn, EncryptionLevel::Initial, &server_hello, cx.events)?;
    install(conn, cx.crypto, EncryptionLevel::Handshake, cx.events)?;

    let ee = build_encrypted_extensions(conn.local_params());
    send_message(conn, EncryptionLevel::Handshake, &ee, cx.events)?;
    install(conn, cx.crypto, EncryptionLevel::OneRtt, cx.events)?;

    conn.queue(EncryptionLevel::OneRtt, Frame::HandshakeDone);
    let extra = cx.config.extra_connection_ids;
    issue_connection_ids(conn, cx, extra)?;
    info!(cid = %key, suite = format_args!("{suite:#06x}"), "server handshake keys ready");
    Ok(())
}

fn client_on_server_hello(
    conn: &mut Connection,
    cx: &mut HandlerContext<'_>,
    hello: &ServerHello,
) -> Result<()> {
    cx.events.push_back(Event::TlsHandshake {
        cid: conn.key_cid().clone(),
        direction: Direction::Received,
        message: "ServerHello",
    });
    if !conn.offered_suites.contains(&hello.cipher_suite) {
        return Err(Error::Crypto {
            alert: ALERT_HANDSHAKE_FAILURE,
        });
    }
    conn.handshake.hello = true;
    install(conn, cx.crypto, EncryptionLevel::Handshake, cx.events)?;
    conn.set_state(ConnectionState::Handshaking, cx.events);
    Ok(())
}

fn client_on_encrypted_extensions(
    conn: &mut Connection,
    cx: &mut HandlerContext<'_>,
    ee: &EncryptedExtensions,
    header_scid: &ConnectionId,
) -> Result<()> {
    cx.events.push_back(Event::TlsHandshake {
        cid: conn.key_cid().clone(),
        direction: Direction::Received,
        message: "EncryptedExtensions",
    });
    let params = find_transport_parameters(&ee.extensions)
        .map(|list| TransportParameters::from_list(list.iter().cloned()))
        .ok_or(Error::Crypto {
            alert: ALERT_MISSING_EXTENSION,
        })?;
    params.validate(Side::Server)?;
    if params.original_destination_connection_id.as_ref() != Some(conn.original_dcid()) {
        return Err(Error::transport_parameter(
            "original_destination_connection_id mismatch",
        ));
    }
    check_initial_scid(&params, header_scid)?;

    conn.apply_peer_params(params, cx.events);
    install(conn, cx.crypto, EncryptionLevel::OneRtt, cx.events)?;
    info!(cid = %conn.key_cid(), "client 1-RTT keys ready");
    Ok(())
}
