//! Protocol Definition Module
//!
//! Every message on the wire is a fixed-format header followed by a body of
//! exactly `size` bytes:
//!
//! ```text
//! Binary:
//! +----------+---------+-------------+----------+--------+-----------+
//! | Magic(4) | Size(2) | Reserved(1) | Flags(1) | Id(2)  | Body      |
//! +----------+---------+-------------+----------+--------+-----------+
//!
//! JSON:
//! {"msz":<size>,"mid":"<MessageId>","mflags":<flags>}<body>
//! ```
//!
//! When the `Secure` flag is set the body is a [`SecureMessageContainer`]
//! holding the encrypted body of message `Id`.
//!
//! ## Handshake
//!
//! ```text
//! Client                                   Server
//!   |-- TCP connect ---------------------->|
//!   |<----- SvPublicKeyChallenge(size) ----|
//!   |-- ClPublicKeyRespond(public key) --->|
//!   |<----- SvAuthChallenge(wrapped key) --|   [server now sends secured]
//!   |-- ClAuthRespond(login, password) --->|
//!   |<----- SvAuthResult(result, msg) -----|   [client now sends secured]
//! ```

#[macro_use]
pub mod wire;
pub mod catalog;
pub mod error;
pub mod messages;
pub mod secure;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::crypto::SymmetricProvider;

pub use catalog::MessageCatalog;
pub use error::{ConfigError, ProtocolError};
pub use messages::*;
pub use secure::SecureMessageContainer;
pub use wire::WireObject;

/// Magic bytes to identify our protocol
pub const PROTOCOL_MAGIC: &[u8; 4] = b"LNC1";

/// Binary header length in bytes
pub const HEADER_SIZE: usize = 10;

/// Largest body a header can describe
pub const MAX_BODY_SIZE: usize = u16::MAX as usize;

/// Upper bound on a JSON header object, guards the byte-wise scan
const MAX_JSON_HEADER_SIZE: usize = 256;

/// Wire format used for headers and bodies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Protocol {
    #[default]
    Binary,
    Json,
}

impl FromStr for Protocol {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "binary" => Ok(Protocol::Binary),
            "json" => Ok(Protocol::Json),
            other => Err(ConfigError::NotSupported(format!("protocol '{}'", other))),
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Binary => f.write_str("binary"),
            Protocol::Json => f.write_str("json"),
        }
    }
}

wire_enum! {
    /// Message type identifiers
    pub enum MessageId: u16 {
        SvPublicKeyChallenge = 1,
        ClPublicKeyRespond = 2,
        SvAuthChallenge = 3,
        ClAuthRespond = 4,
        SvAuthResult = 5,
        ClDisconnect = 6,
        SvDisconnect = 7,
        ClUserlistRequest = 8,
        SvUserlistRespond = 9,
        SvUserlistUpdate = 10,
        CsChatMessage = 11,
        ClFileTransferRequest = 12,
        SvFileTransferRequest = 13,
        ClFileTransferRespond = 14,
        SvFileTransferResult = 15,
        CsFileTransferData = 16,
        CsFileTransferVerificationResult = 17,
        CsFileTransferInterruption = 18,
    }
}

/// Header flag bits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageFlags(u8);

impl MessageFlags {
    pub const NONE: MessageFlags = MessageFlags(0);
    pub const SECURE: MessageFlags = MessageFlags(1);

    pub fn from_bits(bits: u8) -> Self {
        MessageFlags(bits)
    }

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn contains(self, other: MessageFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_secure(self) -> bool {
        self.contains(MessageFlags::SECURE)
    }
}

/// Prefix preceding every message body
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    /// Exact byte length of the body that follows
    pub size: u16,
    pub flags: MessageFlags,
    pub id: MessageId,
}

#[derive(Serialize, Deserialize)]
struct JsonHeader {
    msz: u16,
    mid: MessageId,
    mflags: u8,
}

impl MessageHeader {
    pub fn new(id: MessageId, flags: MessageFlags, body_len: usize) -> Result<Self, ProtocolError> {
        let size = u16::try_from(body_len)
            .map_err(|_| ProtocolError::MessageTooLarge(body_len, MAX_BODY_SIZE))?;
        Ok(Self { size, flags, id })
    }

    pub fn save(&self, protocol: Protocol) -> Result<Vec<u8>, ProtocolError> {
        match protocol {
            Protocol::Binary => {
                let mut out = Vec::with_capacity(HEADER_SIZE);
                out.extend_from_slice(PROTOCOL_MAGIC);
                out.extend_from_slice(&self.size.to_le_bytes());
                out.push(0);
                out.push(self.flags.bits());
                out.extend_from_slice(&self.id.value().to_le_bytes());
                Ok(out)
            }
            Protocol::Json => Ok(serde_json::to_vec(&JsonHeader {
                msz: self.size,
                mid: self.id,
                mflags: self.flags.bits(),
            })?),
        }
    }

    /// Parse a complete header
    pub fn load(bytes: &[u8], protocol: Protocol) -> Result<Self, ProtocolError> {
        match protocol {
            Protocol::Binary => {
                if bytes.len() != HEADER_SIZE {
                    return Err(ProtocolError::load(format!(
                        "binary header must be {} bytes, got {}",
                        HEADER_SIZE,
                        bytes.len()
                    )));
                }
                if &bytes[..4] != PROTOCOL_MAGIC {
                    return Err(ProtocolError::InvalidMagic);
                }
                let size = u16::from_le_bytes([bytes[4], bytes[5]]);
                let flags = MessageFlags::from_bits(bytes[7]);
                let raw_id = u16::from_le_bytes([bytes[8], bytes[9]]);
                let id = MessageId::try_from(raw_id)
                    .map_err(|_| ProtocolError::UnknownMessageType(raw_id))?;
                Ok(Self { size, flags, id })
            }
            Protocol::Json => {
                let header: JsonHeader = serde_json::from_slice(bytes)
                    .map_err(|e| ProtocolError::load(format!("invalid JSON header: {}", e)))?;
                Ok(Self {
                    size: header.msz,
                    flags: MessageFlags::from_bits(header.mflags),
                    id: header.mid,
                })
            }
        }
    }

    /// Read one header from the stream
    pub async fn read<R>(reader: &mut R, protocol: Protocol) -> Result<Self, ProtocolError>
    where
        R: AsyncRead + Unpin,
    {
        match protocol {
            Protocol::Binary => {
                let mut bytes = [0u8; HEADER_SIZE];
                reader.read_exact(&mut bytes).await?;
                Self::load(&bytes, protocol)
            }
            Protocol::Json => {
                let bytes = read_json_object(reader).await?;
                Self::load(&bytes, protocol)
            }
        }
    }
}

/// Read a single flat JSON object byte by byte, stopping right after its
/// closing brace so the body bytes stay in the stream.
async fn read_json_object<R>(reader: &mut R) -> Result<Vec<u8>, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let mut out = Vec::with_capacity(64);

    let mut first = reader.read_u8().await?;
    while first.is_ascii_whitespace() {
        first = reader.read_u8().await?;
    }
    if first != b'{' {
        return Err(ProtocolError::load(format!(
            "expected '{{' at start of JSON header, got 0x{:02x}",
            first
        )));
    }
    out.push(first);

    let mut depth = 1usize;
    let mut in_string = false;
    let mut escaped = false;

    while depth > 0 {
        let byte = reader.read_u8().await?;
        out.push(byte);
        if out.len() > MAX_JSON_HEADER_SIZE {
            return Err(ProtocolError::load("JSON header too long"));
        }

        if in_string {
            match byte {
                _ if escaped => escaped = false,
                b'\\' => escaped = true,
                b'"' => in_string = false,
                _ => {}
            }
            continue;
        }

        match byte {
            b'"' => in_string = true,
            b'{' | b'[' => depth += 1,
            b'}' | b']' => depth -= 1,
            _ => {}
        }
    }

    Ok(out)
}

/// A header with its raw, still encoded body
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub header: MessageHeader,
    pub body: Vec<u8>,
}

impl Frame {
    pub fn to_bytes(&self, protocol: Protocol) -> Result<Vec<u8>, ProtocolError> {
        let mut out = self.header.save(protocol)?;
        out.extend_from_slice(&self.body);
        Ok(out)
    }

    /// Read a header and exactly `size` body bytes
    pub async fn read<R>(reader: &mut R, protocol: Protocol) -> Result<Self, ProtocolError>
    where
        R: AsyncRead + Unpin,
    {
        let header = MessageHeader::read(reader, protocol).await?;
        let mut body = vec![0u8; header.size as usize];
        reader.read_exact(&mut body).await?;
        Ok(Self { header, body })
    }
}

/// Turns typed messages into frames and back, applying the session cipher
/// when one is supplied.
#[derive(Clone)]
pub struct MessageCodec {
    catalog: Arc<MessageCatalog>,
    protocol: Protocol,
}

impl MessageCodec {
    pub fn new(catalog: Arc<MessageCatalog>, protocol: Protocol) -> Self {
        Self { catalog, protocol }
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    pub fn catalog(&self) -> &MessageCatalog {
        &self.catalog
    }

    /// Encode a message into a complete frame. With a cipher the body is
    /// wrapped in a secure container under a freshly generated IV.
    pub fn encode(
        &self,
        message: &Message,
        cipher: Option<&mut dyn SymmetricProvider>,
    ) -> Result<Frame, ProtocolError> {
        let id = self.catalog.id_of(message)?;
        let (flags, body) = match cipher {
            Some(cipher) => {
                cipher.generate_iv();
                let container = SecureMessageContainer::store(message, &*cipher, self.protocol)?;
                (MessageFlags::SECURE, container.save(self.protocol)?)
            }
            None => (MessageFlags::NONE, message.save(self.protocol)?),
        };
        let header = MessageHeader::new(id, flags, body.len())?;
        Ok(Frame { header, body })
    }

    /// Decode a frame. Secure frames require the session cipher.
    pub fn decode(
        &self,
        frame: &Frame,
        cipher: Option<&mut dyn SymmetricProvider>,
    ) -> Result<Message, ProtocolError> {
        if frame.header.flags.is_secure() {
            let cipher = cipher.ok_or_else(|| {
                ProtocolError::load(format!(
                    "secure {} received before a session key was established",
                    frame.header.id
                ))
            })?;
            let container = SecureMessageContainer::load(&frame.body, self.protocol)?;
            container.extract(frame.header.id, &self.catalog, cipher, self.protocol)
        } else {
            self.catalog.load(frame.header.id, &frame.body, self.protocol)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::AesProvider;

    fn codec(protocol: Protocol) -> MessageCodec {
        MessageCodec::new(Arc::new(MessageCatalog::standard().unwrap()), protocol)
    }

    #[test]
    fn test_binary_header_layout() {
        let header = MessageHeader::new(MessageId::CsChatMessage, MessageFlags::SECURE, 0x0102).unwrap();
        let bytes = header.save(Protocol::Binary).unwrap();
        assert_eq!(
            bytes,
            vec![b'L', b'N', b'C', b'1', 0x02, 0x01, 0, 1, 11, 0]
        );
    }

    #[test]
    fn test_header_roundtrip_both_protocols() {
        for protocol in [Protocol::Binary, Protocol::Json] {
            for &id in MessageId::ALL {
                for (flags, size) in [(MessageFlags::NONE, 0u16), (MessageFlags::SECURE, 65535), (MessageFlags::from_bits(3), 1234)] {
                    let header = MessageHeader { size, flags, id };
                    let bytes = header.save(protocol).unwrap();
                    assert_eq!(MessageHeader::load(&bytes, protocol).unwrap(), header);
                }
            }
        }
    }

    #[test]
    fn test_json_header_keys() {
        let header = MessageHeader::new(MessageId::SvAuthResult, MessageFlags::NONE, 42).unwrap();
        let text = String::from_utf8(header.save(Protocol::Json).unwrap()).unwrap();
        assert_eq!(text, r#"{"msz":42,"mid":"SvAuthResult","mflags":0}"#);

        let numeric = MessageHeader::load(br#"{"msz":42,"mid":5,"mflags":0}"#, Protocol::Json).unwrap();
        assert_eq!(numeric, header);
    }

    #[test]
    fn test_bad_magic() {
        let mut bytes = MessageHeader::new(MessageId::ClDisconnect, MessageFlags::NONE, 0)
            .unwrap()
            .save(Protocol::Binary)
            .unwrap();
        bytes[0] = b'X';
        assert!(matches!(
            MessageHeader::load(&bytes, Protocol::Binary),
            Err(ProtocolError::InvalidMagic)
        ));
    }

    #[test]
    fn test_unknown_binary_id() {
        let mut bytes = MessageHeader::new(MessageId::ClDisconnect, MessageFlags::NONE, 0)
            .unwrap()
            .save(Protocol::Binary)
            .unwrap();
        bytes[8] = 0xEE;
        assert!(matches!(
            MessageHeader::load(&bytes, Protocol::Binary),
            Err(ProtocolError::UnknownMessageType(0x00EE))
        ));
    }

    #[test]
    fn test_json_header_wrong_types() {
        assert!(matches!(
            MessageHeader::load(br#"{"msz":"12","mid":"CsChatMessage","mflags":0}"#, Protocol::Json),
            Err(ProtocolError::MessageLoad(_))
        ));
        assert!(matches!(
            MessageHeader::load(br#"{"msz":12,"mid":"Nope","mflags":0}"#, Protocol::Json),
            Err(ProtocolError::MessageLoad(_))
        ));
        assert!(matches!(
            MessageHeader::load(br#"{"msz":12,"mflags":0}"#, Protocol::Json),
            Err(ProtocolError::MessageLoad(_))
        ));
    }

    #[test]
    fn test_body_too_large() {
        assert!(matches!(
            MessageHeader::new(MessageId::CsFileTransferData, MessageFlags::NONE, 70_000),
            Err(ProtocolError::MessageTooLarge(70_000, MAX_BODY_SIZE))
        ));
    }

    #[tokio::test]
    async fn test_frames_read_back_to_back() {
        for protocol in [Protocol::Binary, Protocol::Json] {
            let codec = codec(protocol);
            let first: Message = CsChatMessage {
                username: "alice".into(),
                message: "{not json} \"quoted\"".into(),
            }
            .into();
            let second: Message = ClDisconnect {}.into();

            let mut stream = Vec::new();
            stream.extend(codec.encode(&first, None).unwrap().to_bytes(protocol).unwrap());
            stream.extend(codec.encode(&second, None).unwrap().to_bytes(protocol).unwrap());

            let mut reader = &stream[..];
            let frame = Frame::read(&mut reader, protocol).await.unwrap();
            assert_eq!(codec.decode(&frame, None).unwrap(), first);
            let frame = Frame::read(&mut reader, protocol).await.unwrap();
            assert_eq!(codec.decode(&frame, None).unwrap(), second);

            let err = Frame::read(&mut reader, protocol).await.unwrap_err();
            assert!(err.is_connection_reset());
        }
    }

    #[test]
    fn test_secure_frame_roundtrip() {
        for protocol in [Protocol::Binary, Protocol::Json] {
            let codec = codec(protocol);
            let mut sender = AesProvider::new();
            let mut receiver = AesProvider::new();
            receiver.set_key(sender.key()).unwrap();

            let message: Message = CsChatMessage {
                username: "bob".into(),
                message: "secret".into(),
            }
            .into();
            let frame = codec.encode(&message, Some(&mut sender)).unwrap();
            assert!(frame.header.flags.is_secure());
            assert_eq!(frame.header.id, MessageId::CsChatMessage);
            assert_eq!(frame.header.size as usize, frame.body.len());

            assert_eq!(codec.decode(&frame, Some(&mut receiver)).unwrap(), message);
            assert!(matches!(
                codec.decode(&frame, None),
                Err(ProtocolError::MessageLoad(_))
            ));
        }
    }

    #[test]
    fn test_fresh_iv_per_message() {
        let codec = codec(Protocol::Binary);
        let mut cipher = AesProvider::new();
        let message: Message = ClUserlistRequest {}.into();
        let first = codec.encode(&message, Some(&mut cipher)).unwrap();
        let second = codec.encode(&message, Some(&mut cipher)).unwrap();
        assert_ne!(first.body, second.body);
    }
}
