//! Message variants.
//!
//! Each variant is a plain struct that round-trips through both wire formats.
//! JSON field keys are fixed by the `serde` renames below.

use std::any::TypeId;
use std::fmt;

use serde::{Deserialize, Serialize};

use super::wire::{BinaryReader, BinaryWriter, WireField, WireObject};
use super::{Protocol, ProtocolError};

/// A message body type that can be registered in the catalog.
pub trait Payload: WireObject + Default + Into<Message> + 'static {
    const NAME: &'static str;
}

/// Server-assigned file transfer session id. Zero is never assigned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FileTransferId(pub u32);

impl FileTransferId {
    pub const INVALID: FileTransferId = FileTransferId(0);

    pub fn is_valid(self) -> bool {
        self.0 != 0
    }
}

impl fmt::Display for FileTransferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

impl WireField for FileTransferId {
    fn write(&self, w: &mut BinaryWriter) -> Result<(), ProtocolError> {
        self.0.write(w)
    }

    fn read(r: &mut BinaryReader<'_>) -> Result<Self, ProtocolError> {
        Ok(FileTransferId(u32::read(r)?))
    }
}

wire_enum! {
    #[derive(Default)]
    pub enum AuthResult: u8 {
        #[default]
        Accepted = 0,
        InvalidCredentials = 1,
        AlreadyLoggedIn = 2,
        AccessDenied = 3,
    }
}

wire_enum! {
    #[derive(Default)]
    pub enum FileTransferResult: u8 {
        #[default]
        Accepted = 0,
        Rejected = 1,
        ReceiverUnavailable = 2,
    }
}

wire_enum! {
    #[derive(Default)]
    pub enum VerificationResult: u8 {
        #[default]
        Success = 0,
        ChecksumMismatch = 1,
    }
}

wire_enum! {
    #[derive(Default)]
    pub enum InterruptionKind: u8 {
        #[default]
        Cancel = 0,
        Disconnect = 1,
    }
}

/// Declares a message struct, its binary layout (fields in declaration
/// order) and its conversion into [`Message`].
macro_rules! payload {
    (
        $(#[$meta:meta])*
        $name:ident {
            $($(#[$fmeta:meta])* $field:ident : $ty:ty),* $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
        pub struct $name {
            $($(#[$fmeta])* pub $field: $ty),*
        }

        impl WireObject for $name {
            #[allow(unused_variables)]
            fn save_binary(&self, w: &mut BinaryWriter) -> Result<(), ProtocolError> {
                $(WireField::write(&self.$field, w)?;)*
                Ok(())
            }

            #[allow(unused_variables)]
            fn load_binary(r: &mut BinaryReader<'_>) -> Result<Self, ProtocolError> {
                Ok(Self {
                    $($field: WireField::read(r)?),*
                })
            }
        }

        impl Payload for $name {
            const NAME: &'static str = stringify!($name);
        }

        impl From<$name> for Message {
            fn from(payload: $name) -> Self {
                Message::$name(payload)
            }
        }
    };
}

payload! {
    /// Server asks the client for a public key of the given size
    SvPublicKeyChallenge {
        #[serde(rename = "key_size")]
        key_size: u32,
    }
}

payload! {
    ClPublicKeyRespond {
        #[serde(rename = "key")]
        key: String,
    }
}

payload! {
    /// Session key encrypted with the client's public key
    SvAuthChallenge {
        #[serde(rename = "session_key", with = "crate::protocol::wire::base64_bytes")]
        session_key: Vec<u8>,
    }
}

payload! {
    ClAuthRespond {
        #[serde(rename = "login")]
        login: String,
        #[serde(rename = "password")]
        password: String,
    }
}

payload! {
    SvAuthResult {
        #[serde(rename = "result")]
        result: AuthResult,
        #[serde(rename = "msg")]
        message: String,
    }
}

payload! {
    ClDisconnect {}
}

payload! {
    SvDisconnect {}
}

payload! {
    ClUserlistRequest {}
}

payload! {
    SvUserlistRespond {
        #[serde(rename = "users")]
        users: Vec<String>,
    }
}

payload! {
    SvUserlistUpdate {
        #[serde(rename = "conn")]
        connected: Vec<String>,
        #[serde(rename = "disconn")]
        disconnected: Vec<String>,
    }
}

payload! {
    /// Chat line. The server overwrites `username` with the sender's login.
    CsChatMessage {
        #[serde(rename = "usr")]
        username: String,
        #[serde(rename = "msg")]
        message: String,
    }
}

payload! {
    ClFileTransferRequest {
        #[serde(rename = "usr")]
        receiver: String,
        #[serde(rename = "file_name")]
        file_name: String,
        #[serde(rename = "file_size")]
        file_size: u64,
        #[serde(rename = "file_hash", with = "crate::protocol::wire::base64_bytes")]
        file_hash: Vec<u8>,
        #[serde(rename = "block_size")]
        block_size: u32,
        /// Client-local correlator until the server assigns a session id
        #[serde(rename = "token", with = "crate::protocol::wire::decimal_u64")]
        token: u64,
    }
}

payload! {
    SvFileTransferRequest {
        #[serde(rename = "usr")]
        sender: String,
        #[serde(rename = "file_name")]
        file_name: String,
        #[serde(rename = "file_size")]
        file_size: u64,
        #[serde(rename = "file_hash", with = "crate::protocol::wire::base64_bytes")]
        file_hash: Vec<u8>,
        #[serde(rename = "block_size")]
        block_size: u32,
        #[serde(rename = "sid")]
        session_id: FileTransferId,
    }
}

payload! {
    ClFileTransferRespond {
        #[serde(rename = "result")]
        result: FileTransferResult,
        #[serde(rename = "sid")]
        session_id: FileTransferId,
        /// Receiver's block size, never larger than the proposed one
        #[serde(rename = "block_size")]
        block_size: u32,
    }
}

payload! {
    SvFileTransferResult {
        #[serde(rename = "result")]
        result: FileTransferResult,
        #[serde(rename = "sid")]
        session_id: FileTransferId,
        #[serde(rename = "token", with = "crate::protocol::wire::decimal_u64")]
        token: u64,
        #[serde(rename = "block_size")]
        block_size: u32,
    }
}

payload! {
    CsFileTransferData {
        #[serde(rename = "sid")]
        session_id: FileTransferId,
        #[serde(rename = "data", with = "crate::protocol::wire::base64_bytes")]
        data: Vec<u8>,
    }
}

payload! {
    CsFileTransferVerificationResult {
        #[serde(rename = "result")]
        result: VerificationResult,
        #[serde(rename = "sid")]
        session_id: FileTransferId,
    }
}

payload! {
    CsFileTransferInterruption {
        #[serde(rename = "int")]
        kind: InterruptionKind,
        #[serde(rename = "sid")]
        session_id: FileTransferId,
        #[serde(rename = "token", with = "crate::protocol::wire::decimal_u64")]
        token: u64,
    }
}

macro_rules! message_enum {
    ($($variant:ident),+ $(,)?) => {
        /// Any protocol message
        #[derive(Debug, Clone, PartialEq, Eq)]
        pub enum Message {
            $($variant($variant)),+
        }

        impl Message {
            /// Variant name
            pub fn name(&self) -> &'static str {
                match self {
                    $(Message::$variant(_) => $variant::NAME),+
                }
            }

            /// Type of the payload, used by the catalog to find the id
            pub(crate) fn payload_type(&self) -> TypeId {
                match self {
                    $(Message::$variant(_) => TypeId::of::<$variant>()),+
                }
            }

            /// Encode the body only
            pub fn save(&self, protocol: Protocol) -> Result<Vec<u8>, ProtocolError> {
                match self {
                    $(Message::$variant(payload) => payload.save(protocol)),+
                }
            }
        }
    };
}

message_enum! {
    SvPublicKeyChallenge,
    ClPublicKeyRespond,
    SvAuthChallenge,
    ClAuthRespond,
    SvAuthResult,
    ClDisconnect,
    SvDisconnect,
    ClUserlistRequest,
    SvUserlistRespond,
    SvUserlistUpdate,
    CsChatMessage,
    ClFileTransferRequest,
    SvFileTransferRequest,
    ClFileTransferRespond,
    SvFileTransferResult,
    CsFileTransferData,
    CsFileTransferVerificationResult,
    CsFileTransferInterruption,
}

impl Message {
    /// Messages a client may send before it has authenticated
    pub fn is_handshake(&self) -> bool {
        matches!(
            self,
            Message::ClPublicKeyRespond(_) | Message::ClAuthRespond(_) | Message::ClDisconnect(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::MessageCatalog;

    fn samples() -> Vec<Message> {
        let long = "ж".repeat(20_000);
        vec![
            SvPublicKeyChallenge { key_size: 2048 }.into(),
            ClPublicKeyRespond { key: "-----BEGIN PUBLIC KEY-----\nabc\n".into() }.into(),
            SvAuthChallenge { session_key: vec![] }.into(),
            SvAuthChallenge { session_key: (0..=255).collect() }.into(),
            ClAuthRespond { login: "a.0".into(), password: "secret!".into() }.into(),
            SvAuthResult { result: AuthResult::AlreadyLoggedIn, message: "no".into() }.into(),
            ClDisconnect {}.into(),
            SvDisconnect {}.into(),
            ClUserlistRequest {}.into(),
            SvUserlistRespond { users: vec![] }.into(),
            SvUserlistRespond { users: vec!["alice".into(), "".into(), "bob".into()] }.into(),
            SvUserlistUpdate { connected: vec!["carol".into()], disconnected: vec![] }.into(),
            CsChatMessage { username: String::new(), message: long }.into(),
            ClFileTransferRequest {
                receiver: "bob".into(),
                file_name: "report.pdf".into(),
                file_size: u64::MAX,
                file_hash: vec![0xAB; 32],
                block_size: 8192,
                token: u64::MAX - 1,
            }
            .into(),
            SvFileTransferRequest {
                sender: "alice".into(),
                file_name: "report.pdf".into(),
                file_size: 420042,
                file_hash: vec![1, 2, 3],
                block_size: 8192,
                session_id: FileTransferId(7),
            }
            .into(),
            ClFileTransferRespond {
                result: FileTransferResult::Rejected,
                session_id: FileTransferId(7),
                block_size: 4096,
            }
            .into(),
            SvFileTransferResult {
                result: FileTransferResult::Accepted,
                session_id: FileTransferId(u32::MAX),
                token: 9_007_199_254_740_993,
                block_size: 4096,
            }
            .into(),
            CsFileTransferData { session_id: FileTransferId(7), data: vec![] }.into(),
            CsFileTransferData { session_id: FileTransferId(7), data: vec![0u8; 8192] }.into(),
            CsFileTransferVerificationResult {
                result: VerificationResult::ChecksumMismatch,
                session_id: FileTransferId(7),
            }
            .into(),
            CsFileTransferInterruption {
                kind: InterruptionKind::Cancel,
                session_id: FileTransferId::INVALID,
                token: 42,
            }
            .into(),
        ]
    }

    #[test]
    fn test_every_message_roundtrips_in_both_protocols() {
        let catalog = MessageCatalog::standard().unwrap();
        for protocol in [Protocol::Binary, Protocol::Json] {
            for message in samples() {
                let id = catalog.id_of(&message).unwrap();
                let body = message.save(protocol).unwrap();
                let loaded = catalog.load(id, &body, protocol).unwrap();
                assert_eq!(loaded, message, "{} over {}", message.name(), protocol);
            }
        }
    }

    #[test]
    fn test_chat_json_keys() {
        let message = CsChatMessage { username: "alice".into(), message: "hi".into() };
        let json: serde_json::Value = serde_json::from_slice(&message.save(Protocol::Json).unwrap()).unwrap();
        assert_eq!(json, serde_json::json!({"usr": "alice", "msg": "hi"}));
    }

    #[test]
    fn test_file_request_json_encodings() {
        let message = ClFileTransferRequest {
            receiver: "bob".into(),
            file_name: "a.txt".into(),
            file_size: 3,
            file_hash: vec![0xFF, 0x00],
            block_size: 1024,
            token: 18_446_744_073_709_551_615,
        };
        let json: serde_json::Value = serde_json::from_slice(&message.save(Protocol::Json).unwrap()).unwrap();
        assert_eq!(json["usr"], "bob");
        assert_eq!(json["file_name"], "a.txt");
        assert_eq!(json["file_size"], 3);
        assert_eq!(json["file_hash"], "/wA=");
        assert_eq!(json["block_size"], 1024);
        assert_eq!(json["token"], "18446744073709551615");
    }

    #[test]
    fn test_json_load_failures() {
        let bad_token = br#"{"int":"Cancel","sid":1,"token":42}"#;
        assert!(matches!(
            CsFileTransferInterruption::load(bad_token, Protocol::Json),
            Err(ProtocolError::MessageLoad(_))
        ));

        let bad_base64 = br#"{"sid":1,"data":"***"}"#;
        assert!(CsFileTransferData::load(bad_base64, Protocol::Json).is_err());

        let missing_key = br#"{"usr":"alice"}"#;
        assert!(CsChatMessage::load(missing_key, Protocol::Json).is_err());

        let bad_enum = br#"{"result":"Maybe","sid":1}"#;
        assert!(CsFileTransferVerificationResult::load(bad_enum, Protocol::Json).is_err());

        let numeric_enum = br#"{"result":1,"sid":1}"#;
        assert_eq!(
            CsFileTransferVerificationResult::load(numeric_enum, Protocol::Json).unwrap().result,
            VerificationResult::ChecksumMismatch
        );
    }

    #[test]
    fn test_binary_load_failures() {
        // Enum byte out of range
        assert!(SvAuthResult::load(&[9, 0, 0], Protocol::Binary).is_err());
        // Trailing garbage
        assert!(ClDisconnect::load(&[0], Protocol::Binary).is_err());
        // Truncated
        assert!(SvPublicKeyChallenge::load(&[0, 8], Protocol::Binary).is_err());
    }
}
