//! # Transport Parameters (RFC 9000 Section 18)
//!
//! Transport parameters are exchanged during the TLS handshake to
//! configure connection behavior. Each parameter is encoded as a
//! type-length-value (TLV) tuple of varint id, varint length and value.
//!
//! On the wire a parameter list is a sequence of [`TransportParameter`]
//! values; a connection keeps them in a [`TransportParameters`] record with
//! one slot per kind. Loading a list into the record is last-write-wins.

#![forbid(unsafe_code)]

use crate::buffer::{put_varint, Reader};
use crate::error::{Error, Result};
use crate::types::{ConnectionId, Side, StatelessResetToken, VarInt, MAX_CID_LENGTH};
use bytes::{BufMut, Bytes, BytesMut};

/// Transport Parameter ID (RFC 9000 Section 18.2)
pub type TransportParameterId = VarInt;

// Transport Parameter IDs
pub const TP_ORIGINAL_DESTINATION_CONNECTION_ID: TransportParameterId = 0x00;
pub const TP_MAX_IDLE_TIMEOUT: TransportParameterId = 0x01;
pub const TP_STATELESS_RESET_TOKEN: TransportParameterId = 0x02;
pub const TP_MAX_UDP_PAYLOAD_SIZE: TransportParameterId = 0x03;
pub const TP_INITIAL_MAX_DATA: TransportParameterId = 0x04;
pub const TP_INITIAL_MAX_STREAM_DATA_BIDI_LOCAL: TransportParameterId = 0x05;
pub const TP_INITIAL_MAX_STREAM_DATA_BIDI_REMOTE: TransportParameterId = 0x06;
pub const TP_INITIAL_MAX_STREAM_DATA_UNI: TransportParameterId = 0x07;
pub const TP_INITIAL_MAX_STREAMS_BIDI: TransportParameterId = 0x08;
pub const TP_INITIAL_MAX_STREAMS_UNI: TransportParameterId = 0x09;
pub const TP_ACK_DELAY_EXPONENT: TransportParameterId = 0x0a;
pub const TP_MAX_ACK_DELAY: TransportParameterId = 0x0b;
pub const TP_DISABLE_ACTIVE_MIGRATION: TransportParameterId = 0x0c;
pub const TP_PREFERRED_ADDRESS: TransportParameterId = 0x0d;
pub const TP_ACTIVE_CONNECTION_ID_LIMIT: TransportParameterId = 0x0e;
pub const TP_INITIAL_SOURCE_CONNECTION_ID: TransportParameterId = 0x0f;
pub const TP_RETRY_SOURCE_CONNECTION_ID: TransportParameterId = 0x10;

// Extension parameters
pub const TP_LOSS_BITS: TransportParameterId = 0x1057;
pub const TP_GREASE_QUIC_BIT: TransportParameterId = 0x2ab2;
pub const TP_ENABLE_TIME_STAMP: TransportParameterId = 0x7158;
pub const TP_MIN_ACK_DELAY: TransportParameterId = 0xff02_de1a;

// RFC defaults for absent parameters
pub const DEFAULT_MAX_UDP_PAYLOAD_SIZE: VarInt = 65527;
pub const DEFAULT_ACK_DELAY_EXPONENT: VarInt = 3;
pub const DEFAULT_MAX_ACK_DELAY: VarInt = 25;
pub const DEFAULT_ACTIVE_CONNECTION_ID_LIMIT: VarInt = 2;

/// Preferred Address (RFC 9000 Section 18.2)
///
/// Fixed layout: IPv4 address and port, IPv6 address and port, cid
/// length and cid, stateless reset token.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PreferredAddress {
    pub ipv4_address: [u8; 4],
    pub ipv4_port: u16,
    pub ipv6_address: [u8; 16],
    pub ipv6_port: u16,
    pub connection_id: ConnectionId,
    pub stateless_reset_token: StatelessResetToken,
}

impl PreferredAddress {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_slice(&self.ipv4_address);
        buf.put_u16(self.ipv4_port);
        buf.put_slice(&self.ipv6_address);
        buf.put_u16(self.ipv6_port);
        buf.put_u8(self.connection_id.len() as u8);
        buf.put_slice(self.connection_id.as_bytes());
        buf.put_slice(&self.stateless_reset_token);
    }

    fn decode(r: &mut Reader<'_>) -> Result<Self> {
        let ipv4_address = r.read_array()?;
        let ipv4_port = r.read_u16()?;
        let ipv6_address = r.read_array()?;
        let ipv6_port = r.read_u16()?;
        let cid_len = r.read_u8()? as usize;
        if cid_len > MAX_CID_LENGTH {
            return Err(Error::MalformedEncoding("preferred_address cid longer than 20 bytes"));
        }
        let connection_id = ConnectionId::new(r.read_bytes(cid_len)?)
            .ok_or(Error::MalformedEncoding("preferred_address cid longer than 20 bytes"))?;
        Ok(Self {
            ipv4_address,
            ipv4_port,
            ipv6_address,
            ipv6_port,
            connection_id,
            stateless_reset_token: r.read_array()?,
        })
    }
}

/// One transport parameter as carried on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TransportParameter {
    OriginalDestinationConnectionId(ConnectionId),
    MaxIdleTimeout(VarInt),
    StatelessResetToken(StatelessResetToken),
    MaxUdpPayloadSize(VarInt),
    InitialMaxData(VarInt),
    InitialMaxStreamDataBidiLocal(VarInt),
    InitialMaxStreamDataBidiRemote(VarInt),
    InitialMaxStreamDataUni(VarInt),
    InitialMaxStreamsBidi(VarInt),
    InitialMaxStreamsUni(VarInt),
    AckDelayExponent(VarInt),
    MaxAckDelay(VarInt),
    DisableActiveMigration,
    PreferredAddress(PreferredAddress),
    ActiveConnectionIdLimit(VarInt),
    InitialSourceConnectionId(ConnectionId),
    RetrySourceConnectionId(ConnectionId),
    LossBits(VarInt),
    GreaseQuicBit,
    EnableTimeStamp(VarInt),
    /// Minimum ack delay in microseconds (draft-ietf-quic-ack-frequency)
    MinAckDelay(VarInt),
    Unknown { id: TransportParameterId, value: Bytes },
}

impl TransportParameter {
    pub fn id(&self) -> TransportParameterId {
        use TransportParameter::*;
        match self {
            OriginalDestinationConnectionId(_) => TP_ORIGINAL_DESTINATION_CONNECTION_ID,
            MaxIdleTimeout(_) => TP_MAX_IDLE_TIMEOUT,
            StatelessResetToken(_) => TP_STATELESS_RESET_TOKEN,
            MaxUdpPayloadSize(_) => TP_MAX_UDP_PAYLOAD_SIZE,
            InitialMaxData(_) => TP_INITIAL_MAX_DATA,
            InitialMaxStreamDataBidiLocal(_) => TP_INITIAL_MAX_STREAM_DATA_BIDI_LOCAL,
            InitialMaxStreamDataBidiRemote(_) => TP_INITIAL_MAX_STREAM_DATA_BIDI_REMOTE,
            InitialMaxStreamDataUni(_) => TP_INITIAL_MAX_STREAM_DATA_UNI,
            InitialMaxStreamsBidi(_) => TP_INITIAL_MAX_STREAMS_BIDI,
            InitialMaxStreamsUni(_) => TP_INITIAL_MAX_STREAMS_UNI,
            AckDelayExponent(_) => TP_ACK_DELAY_EXPONENT,
            MaxAckDelay(_) => TP_MAX_ACK_DELAY,
            DisableActiveMigration => TP_DISABLE_ACTIVE_MIGRATION,
            PreferredAddress(_) => TP_PREFERRED_ADDRESS,
            ActiveConnectionIdLimit(_) => TP_ACTIVE_CONNECTION_ID_LIMIT,
            InitialSourceConnectionId(_) => TP_INITIAL_SOURCE_CONNECTION_ID,
            RetrySourceConnectionId(_) => TP_RETRY_SOURCE_CONNECTION_ID,
            LossBits(_) => TP_LOSS_BITS,
            GreaseQuicBit => TP_GREASE_QUIC_BIT,
            EnableTimeStamp(_) => TP_ENABLE_TIME_STAMP,
            MinAckDelay(_) => TP_MIN_ACK_DELAY,
            Unknown { id, .. } => *id,
        }
    }

    /// Append id, length and value.
    pub fn encode(&self, buf: &mut BytesMut) -> Result<()> {
        use TransportParameter::*;
        let mut value = BytesMut::new();
        match self {
            OriginalDestinationConnectionId(cid)
            | InitialSourceConnectionId(cid)
            | RetrySourceConnectionId(cid) => value.put_slice(cid.as_bytes()),
            StatelessResetToken(token) => value.put_slice(token),
            MaxIdleTimeout(v)
            | MaxUdpPayloadSize(v)
            | InitialMaxData(v)
            | InitialMaxStreamDataBidiLocal(v)
            | InitialMaxStreamDataBidiRemote(v)
            | InitialMaxStreamDataUni(v)
            | InitialMaxStreamsBidi(v)
            | InitialMaxStreamsUni(v)
            | AckDelayExponent(v)
            | MaxAckDelay(v)
            | ActiveConnectionIdLimit(v)
            | LossBits(v)
            | EnableTimeStamp(v)
            | MinAckDelay(v) => put_varint(&mut value, *v)?,
            DisableActiveMigration | GreaseQuicBit => {}
            PreferredAddress(addr) => addr.encode(&mut value),
            Unknown { value: raw, .. } => value.put_slice(raw),
        }
        put_varint(buf, self.id())?;
        put_varint(buf, value.len() as u64)?;
        buf.put_slice(&value);
        Ok(())
    }

    /// Decode one parameter at the reader's position.
    pub fn decode(r: &mut Reader<'_>) -> Result<Self> {
        use TransportParameter::*;
        let id = r.read_varint()?;
        let value = r.read_varint_prefixed()?;
        let mut v = Reader::new(&value, 0);

        let cid = |v: &mut Reader<'_>| -> Result<ConnectionId> {
            ConnectionId::new(v.read_rest())
                .ok_or(Error::MalformedEncoding("transport parameter cid longer than 20 bytes"))
        };

        let param = match id {
            TP_ORIGINAL_DESTINATION_CONNECTION_ID => OriginalDestinationConnectionId(cid(&mut v)?),
            TP_INITIAL_SOURCE_CONNECTION_ID => InitialSourceConnectionId(cid(&mut v)?),
            TP_RETRY_SOURCE_CONNECTION_ID => RetrySourceConnectionId(cid(&mut v)?),
            TP_STATELESS_RESET_TOKEN => StatelessResetToken(v.read_array()?),
            TP_MAX_IDLE_TIMEOUT => MaxIdleTimeout(v.read_varint()?),
            TP_MAX_UDP_PAYLOAD_SIZE => MaxUdpPayloadSize(v.read_varint()?),
            TP_INITIAL_MAX_DATA => InitialMaxData(v.read_varint()?),
            TP_INITIAL_MAX_STREAM_DATA_BIDI_LOCAL => InitialMaxStreamDataBidiLocal(v.read_varint()?),
            TP_INITIAL_MAX_STREAM_DATA_BIDI_REMOTE => InitialMaxStreamDataBidiRemote(v.read_varint()?),
            TP_INITIAL_MAX_STREAM_DATA_UNI => InitialMaxStreamDataUni(v.read_varint()?),
            TP_INITIAL_MAX_STREAMS_BIDI => InitialMaxStreamsBidi(v.read_varint()?),
            TP_INITIAL_MAX_STREAMS_UNI => InitialMaxStreamsUni(v.read_varint()?),
            TP_ACK_DELAY_EXPONENT => AckDelayExponent(v.read_varint()?),
            TP_MAX_ACK_DELAY => MaxAckDelay(v.read_varint()?),
            TP_DISABLE_ACTIVE_MIGRATION => DisableActiveMigration,
            TP_PREFERRED_ADDRESS => PreferredAddress(self::PreferredAddress::decode(&mut v)?),
            TP_ACTIVE_CONNECTION_ID_LIMIT => ActiveConnectionIdLimit(v.read_varint()?),
            TP_LOSS_BITS => LossBits(v.read_varint()?),
            TP_GREASE_QUIC_BIT => GreaseQuicBit,
            TP_ENABLE_TIME_STAMP => EnableTimeStamp(v.read_varint()?),
            TP_MIN_ACK_DELAY => MinAckDelay(v.read_varint()?),
            _ => return Ok(Unknown { id, value }),
        };

        if !v.is_empty() {
            return Err(Error::MalformedEncoding("transport parameter value has trailing bytes"));
        }
        Ok(param)
    }
}

/// Encode a parameter list (the body of the quic_transport_parameters
/// TLS extension).
pub fn encode_list(params: &[TransportParameter], buf: &mut BytesMut) -> Result<()> {
    for param in params {
        param.encode(buf)?;
    }
    Ok(())
}

/// Decode a parameter list occupying all of `data`.
pub fn decode_list(data: &Bytes) -> Result<Vec<TransportParameter>> {
    let mut r = Reader::new(data, 0);
    let mut out = Vec::new();
    while !r.is_empty() {
        out.push(TransportParameter::decode(&mut r)?);
    }
    Ok(out)
}

/// Transport Parameters Record (RFC 9000 Section 18)
///
/// One optional slot per parameter kind. Absent slots take the RFC
/// default through the accessor methods.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransportParameters {
    // Connection IDs
    pub original_destination_connection_id: Option<ConnectionId>,
    pub initial_source_connection_id: Option<ConnectionId>,
    pub retry_source_connection_id: Option<ConnectionId>,

    // Stateless Reset
    pub stateless_reset_token: Option<StatelessResetToken>,

    // Idle Timeout (milliseconds)
    pub max_idle_timeout: Option<VarInt>,

    // Flow Control
    pub initial_max_data: Option<VarInt>,
    pub initial_max_stream_data_bidi_local: Option<VarInt>,
    pub initial_max_stream_data_bidi_remote: Option<VarInt>,
    pub initial_max_stream_data_uni: Option<VarInt>,

    // Stream Limits
    pub initial_max_streams_bidi: Option<VarInt>,
    pub initial_max_streams_uni: Option<VarInt>,

    pub max_udp_payload_size: Option<VarInt>,

    // ACK Parameters
    pub ack_delay_exponent: Option<VarInt>,
    pub max_ack_delay: Option<VarInt>,
    pub min_ack_delay: Option<VarInt>,

    // Migration
    pub disable_active_migration: Option<()>,
    pub preferred_address: Option<PreferredAddress>,

    pub active_connection_id_limit: Option<VarInt>,

    // Extensions
    pub loss_bits: Option<VarInt>,
    pub grease_quic_bit: Option<()>,
    pub enable_time_stamp: Option<VarInt>,

    /// Unrecognized parameters, keyed by id (last write wins)
    pub unknown: Vec<(TransportParameterId, Bytes)>,
}

impl TransportParameters {
    /// Store one parameter, replacing any earlier value of the same kind.
    pub fn set(&mut self, param: TransportParameter) {
        use TransportParameter::*;
        match param {
            OriginalDestinationConnectionId(c) => self.original_destination_connection_id = Some(c),
            MaxIdleTimeout(v) => self.max_idle_timeout = Some(v),
            StatelessResetToken(t) => self.stateless_reset_token = Some(t),
            MaxUdpPayloadSize(v) => self.max_udp_payload_size = Some(v),
            InitialMaxData(v) => self.initial_max_data = Some(v),
            InitialMaxStreamDataBidiLocal(v) => self.initial_max_stream_data_bidi_local = Some(v),
            InitialMaxStreamDataBidiRemote(v) => self.initial_max_stream_data_bidi_remote = Some(v),
            InitialMaxStreamDataUni(v) => self.initial_max_stream_data_uni = Some(v),
            InitialMaxStreamsBidi(v) => self.initial_max_streams_bidi = Some(v),
            InitialMaxStreamsUni(v) => self.initial_max_streams_uni = Some(v),
            AckDelayExponent(v) => self.ack_delay_exponent = Some(v),
            MaxAckDelay(v) => self.max_ack_delay = Some(v),
            DisableActiveMigration => self.disable_active_migration = Some(()),
            PreferredAddress(a) => self.preferred_address = Some(a),
            ActiveConnectionIdLimit(v) => self.active_connection_id_limit = Some(v),
            InitialSourceConnectionId(c) => self.initial_source_connection_id = Some(c),
            RetrySourceConnectionId(c) => self.retry_source_connection_id = Some(c),
            LossBits(v) => self.loss_bits = Some(v),
            GreaseQuicBit => self.grease_quic_bit = Some(()),
            EnableTimeStamp(v) => self.enable_time_stamp = Some(v),
            MinAckDelay(v) => self.min_ack_delay = Some(v),
            Unknown { id, value } => {
                self.unknown.retain(|(existing, _)| *existing != id);
                self.unknown.push((id, value));
            }
        }
    }

    pub fn from_list(params: impl IntoIterator<Item = TransportParameter>) -> Self {
        let mut record = Self::default();
        for param in params {
            record.set(param);
        }
        record
    }

    /// Parameters present in the record, in id order of the RFC table.
    pub fn to_list(&self) -> Vec<TransportParameter> {
        use TransportParameter::*;
        let mut out = Vec::new();
        let mut push = |p: Option<TransportParameter>| out.extend(p);
        push(self.original_destination_connection_id.clone().map(OriginalDestinationConnectionId));
        push(self.max_idle_timeout.map(MaxIdleTimeout));
        push(self.stateless_reset_token.map(StatelessResetToken));
        push(self.max_udp_payload_size.map(MaxUdpPayloadSize));
        push(self.initial_max_data.map(InitialMaxData));
        push(self.initial_max_stream_data_bidi_local.map(InitialMaxStreamDataBidiLocal));
        push(self.initial_max_stream_data_bidi_remote.map(InitialMaxStreamDataBidiRemote));
        push(self.initial_max_stream_data_uni.map(InitialMaxStreamDataUni));
        push(self.initial_max_streams_bidi.map(InitialMaxStreamsBidi));
        push(self.initial_max_streams_uni.map(InitialMaxStreamsUni));
        push(self.ack_delay_exponent.map(AckDelayExponent));
        push(self.max_ack_delay.map(MaxAckDelay));
        push(self.disable_active_migration.map(|_| DisableActiveMigration));
        push(self.preferred_address.clone().map(PreferredAddress));
        push(self.active_connection_id_limit.map(ActiveConnectionIdLimit));
        push(self.initial_source_connection_id.clone().map(InitialSourceConnectionId));
        push(self.retry_source_connection_id.clone().map(RetrySourceConnectionId));
        push(self.loss_bits.map(LossBits));
        push(self.grease_quic_bit.map(|_| GreaseQuicBit));
        push(self.enable_time_stamp.map(EnableTimeStamp));
        push(self.min_ack_delay.map(MinAckDelay));
        for (id, value) in &self.unknown {
            push(Some(Unknown {
                id: *id,
                value: value.clone(),
            }));
        }
        out
    }

    pub fn encode(&self, buf: &mut BytesMut) -> Result<()> {
        encode_list(&self.to_list(), buf)
    }

    pub fn decode(data: &Bytes) -> Result<Self> {
        Ok(Self::from_list(decode_list(data)?))
    }

    /// Validate parameters received from a peer playing `sender`.
    ///
    /// Checks that all parameters are within valid ranges per RFC 9000
    /// Section 18.2 and that a client sent none of the server-only ones.
    pub fn validate(&self, sender: Side) -> Result<()> {
        if self.max_udp_payload_size.map_or(false, |size| size < 1200) {
            return Err(Error::transport_parameter("max_udp_payload_size below 1200"));
        }
        if self.ack_delay_exponent.map_or(false, |exp| exp > 20) {
            return Err(Error::transport_parameter("ack_delay_exponent above 20"));
        }
        if self.max_ack_delay.map_or(false, |delay| delay >= 1 << 14) {
            return Err(Error::transport_parameter("max_ack_delay of 2^14 or more"));
        }
        if self.active_connection_id_limit.map_or(false, |limit| limit < 2) {
            return Err(Error::transport_parameter("active_connection_id_limit below 2"));
        }
        if let Some(min) = self.min_ack_delay {
            if min > self.max_ack_delay().saturating_mul(1000) {
                return Err(Error::transport_parameter("min_ack_delay above max_ack_delay"));
            }
        }
        if sender.is_client()
            && (self.original_destination_connection_id.is_some()
                || self.stateless_reset_token.is_some()
                || self.preferred_address.is_some()
                || self.retry_source_connection_id.is_some())
        {
            return Err(Error::transport_parameter("server-only parameter sent by client"));
        }
        Ok(())
    }

    pub fn max_udp_payload_size(&self) -> VarInt {
        self.max_udp_payload_size.unwrap_or(DEFAULT_MAX_UDP_PAYLOAD_SIZE)
    }

    pub fn ack_delay_exponent(&self) -> VarInt {
        self.ack_delay_exponent.unwrap_or(DEFAULT_ACK_DELAY_EXPONENT)
    }

    /// Max ack delay in milliseconds
    pub fn max_ack_delay(&self) -> VarInt {
        self.max_ack_delay.unwrap_or(DEFAULT_MAX_ACK_DELAY)
    }

    pub fn active_connection_id_limit(&self) -> VarInt {
        self.active_connection_id_limit
            .unwrap_or(DEFAULT_ACTIVE_CONNECTION_ID_LIMIT)
    }

    pub fn initial_max_data(&self) -> VarInt {
        self.initial_max_data.unwrap_or(0)
    }

    pub fn initial_max_streams_bidi(&self) -> VarInt {
        self.initial_max_streams_bidi.unwrap_or(0)
    }

    pub fn initial_max_streams_uni(&self) -> VarInt {
        self.initial_max_streams_uni.unwrap_or(0)
    }

    /// Limit the holder of these parameters places on data we send on a
    /// stream, from the holder's point of view of who opened it.
    pub fn initial_max_stream_data(&self, opened_by_holder: bool, bidirectional: bool) -> VarInt {
        let value = match (bidirectional, opened_by_holder) {
            (true, true) => self.initial_max_stream_data_bidi_local,
            (true, false) => self.initial_max_stream_data_bidi_remote,
            (false, _) => self.initial_max_stream_data_uni,
        };
        value.unwrap_or(0)
    }
}
