//! # Raw Client
//!
//! A client that builds packets frame by frame instead of running a
//! connection. Scripts and tests use it to put exactly the bytes they
//! want in front of an [`crate::Endpoint`], including bytes a well-behaved
//! client would never send.
//!
//! It derives the Initial keys of its first Destination Connection ID and
//! installs every other level up front, so it can open whatever the
//! endpoint sends back.

#![forbid(unsafe_code)]

use crate::connection::default_transport_parameters;
use crate::connection::handshake::build_client_hello;
use crate::crypto::{CryptoService, EncryptionLevel, PlaintextCrypto, INITIAL_SALT_V1};
use crate::error::{Error, Result};
use crate::frames::{parse_frames, CryptoFrame, Frame};
use crate::packet::{parse_header, seal_packet, unprotect, Packet, PacketType};
use crate::services::RandomSource;
use crate::transport::TransportParameters;
use crate::types::{ConnectionId, PacketNumber, MIN_INITIAL_PACKET_SIZE, QUIC_VERSION_1};
use bytes::Bytes;
use tracing::{debug, trace};

/// One packet the raw client opened.
#[derive(Debug, Clone, PartialEq)]
pub struct ReceivedPacket {
    pub level: EncryptionLevel,
    pub packet_number: PacketNumber,
    pub frames: Vec<Frame>,
}

#[derive(Debug, Clone)]
pub struct RawClient {
    crypto: PlaintextCrypto,
    key: ConnectionId,
    dcid: ConnectionId,
    scid: ConnectionId,
    version: u32,
    dcid_confirmed: bool,
    next_packet_number: [PacketNumber; 3],
    largest_received: [Option<PacketNumber>; 3],
    crypto_offset: [u64; 3],
}

impl RawClient {
    /// `dcid` is the Destination Connection ID of the first Initial and
    /// becomes the key cid of the server's connection.
    pub fn new(dcid: ConnectionId, scid: ConnectionId) -> Result<Self> {
        let mut crypto = PlaintextCrypto::new();
        crypto.derive_initial_keys(&dcid, INITIAL_SALT_V1, dcid.as_bytes())?;
        for level in [EncryptionLevel::Handshake, EncryptionLevel::OneRtt] {
            crypto.install_keys(&dcid, level)?;
        }
        Ok(Self {
            crypto,
            key: dcid.clone(),
            dcid,
            scid,
            version: QUIC_VERSION_1,
            dcid_confirmed: false,
            next_packet_number: [0; 3],
            largest_received: [None; 3],
            crypto_offset: [0; 3],
        })
    }

    pub fn key(&self) -> &ConnectionId {
        &self.key
    }

    /// Destination cid of the next packet
    pub fn dcid(&self) -> &ConnectionId {
        &self.dcid
    }

    pub fn scid(&self) -> &ConnectionId {
        &self.scid
    }

    pub fn set_dcid(&mut self, dcid: ConnectionId) {
        self.dcid = dcid;
        self.dcid_confirmed = true;
    }

    /// Version written into long headers
    pub fn set_version(&mut self, version: u32) {
        self.version = version;
    }

    pub fn next_packet_number(&self, level: EncryptionLevel) -> PacketNumber {
        self.next_packet_number[level.packet_number_space().index()]
    }

    /// Parameters sent in the ClientHello
    pub fn transport_parameters(&self) -> TransportParameters {
        let mut params = default_transport_parameters();
        params.initial_source_connection_id = Some(self.scid.clone());
        params
    }

    /// CRYPTO frame carrying `data` at the next offset for `level`.
    pub fn crypto_frame(&mut self, level: EncryptionLevel, data: Bytes) -> Frame {
        let slot = &mut self.crypto_offset[level.packet_number_space().index()];
        let offset = *slot;
        *slot += data.len() as u64;
        Frame::Crypto(CryptoFrame { offset, data })
    }

    /// Initial packet carrying a ClientHello with `params`.
    pub fn client_hello(&mut self, rng: &mut dyn RandomSource, params: &TransportParameters) -> Result<Bytes> {
        let hello = build_client_hello(rng, params).to_bytes()?;
        let frame = self.crypto_frame(EncryptionLevel::Initial, hello);
        self.packet(EncryptionLevel::Initial, vec![frame])
    }

    /// Seal `frames` into one packet at `level` with the next packet number.
    ///
    /// Initial packets are padded to 1200 bytes.
    pub fn packet(&mut self, level: EncryptionLevel, frames: Vec<Frame>) -> Result<Bytes> {
        let index = level.packet_number_space().index();
        let packet_number = self.next_packet_number[index];
        self.next_packet_number[index] += 1;
        self.packet_with_number(level, packet_number, frames)
    }

    /// Seal `frames` with an explicit packet number, e.g. to replay one.
    pub fn packet_with_number(
        &self,
        level: EncryptionLevel,
        packet_number: PacketNumber,
        frames: Vec<Frame>,
    ) -> Result<Bytes> {
        let min_size = if level == EncryptionLevel::Initial {
            MIN_INITIAL_PACKET_SIZE
        } else {
            0
        };
        let packet = Packet {
            packet_type: PacketType::for_level(level),
            version: self.version,
            dcid: self.dcid.clone(),
            scid: self.scid.clone(),
            token: Bytes::new(),
            packet_number,
            frames,
        };
        trace!(level = level.name(), pn = packet_number, dcid = %self.dcid, "raw packet built");
        seal_packet(&self.crypto, &self.key, &packet, None, min_size)
    }

    /// Open every packet of a datagram from the endpoint.
    ///
    /// Undecryptable packets are skipped. The Source Connection ID of the
    /// first long header becomes the destination of later packets.
    pub fn receive(&mut self, datagram: &Bytes) -> Result<Vec<ReceivedPacket>> {
        let mut packets = Vec::new();
        let mut offset = 0;
        while offset < datagram.len() {
            let rest = datagram.slice(offset..);
            let header = parse_header(&rest, self.scid.len())?;
            offset += header.packet_len;

            let level = header.packet_type.level();
            let index = level.packet_number_space().index();
            let Some(opened) = unprotect(&self.crypto, &self.key, &rest, &header, self.largest_received[index])?
            else {
                debug!(level = level.name(), "raw client could not open packet");
                continue;
            };
            if header.packet_type.is_long_header() && !self.dcid_confirmed {
                self.set_dcid(header.scid.clone());
            }
            let largest = &mut self.largest_received[index];
            *largest = Some(largest.map_or(opened.packet_number, |l| l.max(opened.packet_number)));
            packets.push(ReceivedPacket {
                level,
                packet_number: opened.packet_number,
                frames: parse_frames(&opened.payload)?,
            });
        }
        if packets.is_empty() && !datagram.is_empty() {
            debug!(len = datagram.len(), "datagram held no packet the raw client could open");
        }
        Ok(packets)
    }

    /// Every frame in `datagrams`, in arrival order.
    pub fn receive_all<'a>(&mut self, datagrams: impl IntoIterator<Item = &'a Bytes>) -> Result<Vec<Frame>> {
        let mut frames = Vec::new();
        for datagram in datagrams {
            for packet in self.receive(datagram)? {
                frames.extend(packet.frames);
            }
        }
        Ok(frames)
    }
}

/// Parse a cid written as hex, with or without a `0x` prefix.
pub fn cid_from_hex(hex: &str) -> Result<ConnectionId> {
    let hex = hex.trim_start_matches("0x");
    if hex.len() % 2 != 0 {
        return Err(Error::MalformedEncoding("odd-length hex connection ID"));
    }
    let bytes = (0..hex.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&hex[i..i + 2], 16))
        .collect::<core::result::Result<Vec<u8>, _>>()
        .map_err(|_| Error::MalformedEncoding("invalid hex connection ID"))?;
    ConnectionId::from_slice(&bytes).ok_or(Error::MalformedEncoding("connection ID longer than 20 bytes"))
}
