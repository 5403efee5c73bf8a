//! Wire codec for the NatNet protocol.
//!
//! Every message is framed as `[message id: u16][payload length: u16][payload]`, little-endian.
//! Payload layouts depend on the negotiated [`Version`]; each optional field or record is gated
//! through [`features::Feature`] so there is exactly one decode routine per payload type.
//!
//! Decoding is pure: [`decode`] reads nothing but the byte slice and the version, and a failure
//! inside any sub-record fails the whole message. Datagram transports use [`decode_datagram`],
//! which additionally treats a short header as malformed.
//!
//! ```rust
//! use natnet::protocol::{self, Message};
//! use natnet::types::Version;
//!
//! let bytes = protocol::encode(&Message::KeepAlive, Version::LATEST).unwrap();
//! let (message, consumed) = protocol::decode(&bytes, Version::LATEST).unwrap();
//! assert_eq!(message, Message::KeepAlive);
//! assert_eq!(consumed, 4);
//! ```

pub mod buffer;
pub mod command;
pub mod data;
pub mod description;
pub mod features;
pub mod server_info;

use tracing::{debug, trace};

use self::buffer::{Reader, Writer};
use self::data::MoCapData;
use self::description::MoCapDescription;
use self::server_info::{ClientHello, EchoRequest, EchoResponse, ServerInfo};
use crate::types::Version;
use crate::{NatNetError, Result};

/// Size of the `[id][length]` header.
pub const HEADER_SIZE: usize = 4;

/// Largest payload the 16-bit length field can describe.
pub const MAX_PAYLOAD: usize = u16::MAX as usize;

/// Version-parameterized payload codec.
pub trait WireFormat: Sized {
    fn encode(&self, writer: &mut Writer, version: Version);

    fn decode(reader: &mut Reader<'_>, version: Version) -> Result<Self>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum MessageId {
    Connect = 0,
    ServerInfo = 1,
    Request = 2,
    Response = 3,
    RequestModelDef = 4,
    ModelDef = 5,
    RequestFrameOfData = 6,
    FrameOfData = 7,
    MessageString = 8,
    Disconnect = 9,
    KeepAlive = 10,
    DisconnectByTimeout = 11,
    EchoRequest = 12,
    EchoResponse = 13,
    Discovery = 14,
    UnrecognizedRequest = 100,
}

impl TryFrom<u16> for MessageId {
    type Error = NatNetError;

    fn try_from(value: u16) -> Result<Self> {
        Ok(match value {
            0 => MessageId::Connect,
            1 => MessageId::ServerInfo,
            2 => MessageId::Request,
            3 => MessageId::Response,
            4 => MessageId::RequestModelDef,
            5 => MessageId::ModelDef,
            6 => MessageId::RequestFrameOfData,
            7 => MessageId::FrameOfData,
            8 => MessageId::MessageString,
            9 => MessageId::Disconnect,
            10 => MessageId::KeepAlive,
            11 => MessageId::DisconnectByTimeout,
            12 => MessageId::EchoRequest,
            13 => MessageId::EchoResponse,
            14 => MessageId::Discovery,
            100 => MessageId::UnrecognizedRequest,
            other => {
                return Err(NatNetError::malformed("header", format!("unknown message id {other}")));
            }
        })
    }
}

/// Every message either side of the protocol sends.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Connect(ClientHello),
    ServerInfo(ServerInfo),
    /// Text command bytes, see [`command::Command`].
    Request(Vec<u8>),
    Response(Vec<u8>),
    ModelDefRequest,
    ModelDef(MoCapDescription),
    FrameOfDataRequest,
    FrameOfData(MoCapData),
    MessageString(String),
    Disconnect,
    KeepAlive,
    DisconnectByTimeout,
    EchoRequest(EchoRequest),
    EchoResponse(EchoResponse),
    Discovery(ClientHello),
    /// The server did not understand a request; carries whatever it echoed back.
    UnrecognizedRequest(Vec<u8>),
}

impl Message {
    pub fn id(&self) -> MessageId {
        match self {
            Message::Connect(_) => MessageId::Connect,
            Message::ServerInfo(_) => MessageId::ServerInfo,
            Message::Request(_) => MessageId::Request,
            Message::Response(_) => MessageId::Response,
            Message::ModelDefRequest => MessageId::RequestModelDef,
            Message::ModelDef(_) => MessageId::ModelDef,
            Message::FrameOfDataRequest => MessageId::RequestFrameOfData,
            Message::FrameOfData(_) => MessageId::FrameOfData,
            Message::MessageString(_) => MessageId::MessageString,
            Message::Disconnect => MessageId::Disconnect,
            Message::KeepAlive => MessageId::KeepAlive,
            Message::DisconnectByTimeout => MessageId::DisconnectByTimeout,
            Message::EchoRequest(_) => MessageId::EchoRequest,
            Message::EchoResponse(_) => MessageId::EchoResponse,
            Message::Discovery(_) => MessageId::Discovery,
            Message::UnrecognizedRequest(_) => MessageId::UnrecognizedRequest,
        }
    }

    fn encode_payload(&self, writer: &mut Writer, version: Version) {
        match self {
            Message::Connect(hello) | Message::Discovery(hello) => hello.encode(writer, version),
            Message::ServerInfo(info) => info.encode(writer, version),
            Message::Request(bytes)
            | Message::Response(bytes)
            | Message::UnrecognizedRequest(bytes) => writer.write_bytes(bytes),
            Message::ModelDef(description) => description.encode(writer, version),
            Message::FrameOfData(data) => data.encode(writer, version),
            Message::MessageString(text) => {
                writer.write_bytes(text.split('\0').next().unwrap_or_default().as_bytes());
                writer.write_u8(0);
            }
            Message::EchoRequest(echo) => echo.encode(writer, version),
            Message::EchoResponse(echo) => echo.encode(writer, version),
            Message::ModelDefRequest
            | Message::FrameOfDataRequest
            | Message::Disconnect
            | Message::KeepAlive
            | Message::DisconnectByTimeout => {}
        }
    }

    fn decode_payload(id: MessageId, reader: &mut Reader<'_>, version: Version) -> Result<Self> {
        Ok(match id {
            MessageId::Connect => Message::Connect(ClientHello::decode(reader, version)?),
            MessageId::Discovery => Message::Discovery(ClientHello::decode(reader, version)?),
            MessageId::ServerInfo => Message::ServerInfo(ServerInfo::decode(reader, version)?),
            MessageId::Request => Message::Request(reader.read_rest().to_vec()),
            MessageId::Response => Message::Response(reader.read_rest().to_vec()),
            MessageId::UnrecognizedRequest => {
                Message::UnrecognizedRequest(reader.read_rest().to_vec())
            }
            MessageId::RequestModelDef => Message::ModelDefRequest,
            MessageId::ModelDef => Message::ModelDef(MoCapDescription::decode(reader, version)?),
            MessageId::RequestFrameOfData => Message::FrameOfDataRequest,
            MessageId::FrameOfData => Message::FrameOfData(MoCapData::decode(reader, version)?),
            MessageId::MessageString => {
                let rest = reader.read_rest();
                let end = rest.iter().position(|&b| b == 0).unwrap_or(rest.len());
                Message::MessageString(String::from_utf8_lossy(&rest[..end]).into_owned())
            }
            MessageId::Disconnect => Message::Disconnect,
            MessageId::KeepAlive => Message::KeepAlive,
            MessageId::DisconnectByTimeout => Message::DisconnectByTimeout,
            MessageId::EchoRequest => Message::EchoRequest(EchoRequest::decode(reader, version)?),
            MessageId::EchoResponse => Message::EchoResponse(EchoResponse::decode(reader, version)?),
        })
    }
}

/// Encodes a framed message.
///
/// Fails with [`NatNetError::Oversized`] when the payload does not fit the 16-bit length field.
pub fn encode(message: &Message, version: Version) -> Result<Vec<u8>> {
    let mut writer = Writer::with_capacity(64);
    writer.write_u16(message.id() as u16);
    writer.write_u16(0);
    message.encode_payload(&mut writer, version);

    let size = writer.len() - HEADER_SIZE;
    let length = u16::try_from(size)
        .map_err(|_| NatNetError::Oversized { size, max: MAX_PAYLOAD })?;
    writer.set_u16(2, length);
    Ok(writer.into_inner())
}

/// Decodes one framed message from the front of `bytes`.
///
/// Returns the message and the number of bytes it occupied. Fewer than [`HEADER_SIZE`] bytes
/// yield [`NatNetError::Incomplete`]; a declared length past the end of the buffer, an unknown
/// id or any failing sub-record yield [`NatNetError::Malformed`].
pub fn decode(bytes: &[u8], version: Version) -> Result<(Message, usize)> {
    if bytes.len() < HEADER_SIZE {
        return Err(NatNetError::Incomplete { needed: HEADER_SIZE, available: bytes.len() });
    }
    let mut header = Reader::new(&bytes[..HEADER_SIZE]);
    let raw_id = header.read_u16()?;
    let length = usize::from(header.read_u16()?);
    let available = bytes.len() - HEADER_SIZE;
    if length > available {
        return Err(NatNetError::malformed(
            "header",
            format!("payload length {length} exceeds the {available} bytes received"),
        ));
    }
    let id = MessageId::try_from(raw_id)?;

    let mut reader = Reader::new(&bytes[HEADER_SIZE..HEADER_SIZE + length]);
    let message = Message::decode_payload(id, &mut reader, version)?;
    if reader.remaining() > 0 {
        trace!(?id, unread = reader.remaining(), "Payload longer than its decoded content");
    }
    Ok((message, HEADER_SIZE + length))
}

/// Decodes a whole datagram. A datagram too short for a header is malformed, not incomplete.
pub fn decode_datagram(datagram: &[u8], version: Version) -> Result<Message> {
    match decode(datagram, version) {
        Ok((message, consumed)) => {
            if consumed < datagram.len() {
                debug!(
                    id = ?message.id(),
                    trailing = datagram.len() - consumed,
                    "Ignoring bytes after the framed message"
                );
            }
            Ok(message)
        }
        Err(NatNetError::Incomplete { needed, available }) => Err(NatNetError::malformed(
            "datagram",
            format!("{available} bytes is shorter than the {needed} byte header"),
        )),
        Err(other) => Err(other),
    }
}
