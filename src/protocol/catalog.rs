//! Bidirectional registry between message ids and message variants.

use std::any::TypeId;
use std::collections::HashMap;

use super::messages::*;
use super::{ConfigError, MessageId, Protocol, ProtocolError};

type LoadFn = fn(&[u8], Protocol) -> Result<Message, ProtocolError>;

struct Entry {
    name: &'static str,
    type_id: TypeId,
    create: fn() -> Message,
    load: LoadFn,
}

fn create_as<P: Payload>() -> Message {
    P::default().into()
}

fn load_as<P: Payload>(body: &[u8], protocol: Protocol) -> Result<Message, ProtocolError> {
    P::load(body, protocol).map(Into::into)
}

/// Message catalog.
///
/// The id to variant mapping is a bijection: registering the same pair twice
/// is allowed, any other collision is a [`ConfigError`].
#[derive(Default)]
pub struct MessageCatalog {
    by_id: HashMap<MessageId, Entry>,
    by_type: HashMap<TypeId, MessageId>,
}

impl MessageCatalog {
    /// Empty catalog
    pub fn new() -> Self {
        Self::default()
    }

    /// Catalog with every protocol message registered under its standard id
    pub fn standard() -> Result<Self, ConfigError> {
        let mut catalog = Self::new();
        catalog.register::<SvPublicKeyChallenge>(MessageId::SvPublicKeyChallenge)?;
        catalog.register::<ClPublicKeyRespond>(MessageId::ClPublicKeyRespond)?;
        catalog.register::<SvAuthChallenge>(MessageId::SvAuthChallenge)?;
        catalog.register::<ClAuthRespond>(MessageId::ClAuthRespond)?;
        catalog.register::<SvAuthResult>(MessageId::SvAuthResult)?;
        catalog.register::<ClDisconnect>(MessageId::ClDisconnect)?;
        catalog.register::<SvDisconnect>(MessageId::SvDisconnect)?;
        catalog.register::<ClUserlistRequest>(MessageId::ClUserlistRequest)?;
        catalog.register::<SvUserlistRespond>(MessageId::SvUserlistRespond)?;
        catalog.register::<SvUserlistUpdate>(MessageId::SvUserlistUpdate)?;
        catalog.register::<CsChatMessage>(MessageId::CsChatMessage)?;
        catalog.register::<ClFileTransferRequest>(MessageId::ClFileTransferRequest)?;
        catalog.register::<SvFileTransferRequest>(MessageId::SvFileTransferRequest)?;
        catalog.register::<ClFileTransferRespond>(MessageId::ClFileTransferRespond)?;
        catalog.register::<SvFileTransferResult>(MessageId::SvFileTransferResult)?;
        catalog.register::<CsFileTransferData>(MessageId::CsFileTransferData)?;
        catalog.register::<CsFileTransferVerificationResult>(MessageId::CsFileTransferVerificationResult)?;
        catalog.register::<CsFileTransferInterruption>(MessageId::CsFileTransferInterruption)?;
        Ok(catalog)
    }

    pub fn register<P: Payload>(&mut self, id: MessageId) -> Result<(), ConfigError> {
        let type_id = TypeId::of::<P>();

        if let Some(existing) = self.by_id.get(&id) {
            if existing.type_id == type_id {
                return Ok(());
            }
            return Err(ConfigError::IdConflict {
                id,
                existing: existing.name,
                requested: P::NAME,
            });
        }

        if let Some(&existing) = self.by_type.get(&type_id) {
            return Err(ConfigError::VariantConflict {
                variant: P::NAME,
                existing,
                requested: id,
            });
        }

        self.by_id.insert(
            id,
            Entry {
                name: P::NAME,
                type_id,
                create: create_as::<P>,
                load: load_as::<P>,
            },
        );
        self.by_type.insert(type_id, id);
        Ok(())
    }

    /// Blank instance of the variant registered for `id`
    pub fn create(&self, id: MessageId) -> Result<Message, ProtocolError> {
        self.entry(id).map(|entry| (entry.create)())
    }

    /// Decode a plaintext body as the variant registered for `id`
    pub fn load(&self, id: MessageId, body: &[u8], protocol: Protocol) -> Result<Message, ProtocolError> {
        let entry = self.entry(id)?;
        (entry.load)(body, protocol)
    }

    /// Id registered for the message's variant
    pub fn id_of(&self, message: &Message) -> Result<MessageId, ProtocolError> {
        self.by_type
            .get(&message.payload_type())
            .copied()
            .ok_or_else(|| ProtocolError::UnregisteredMessage(message.name()))
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    fn entry(&self, id: MessageId) -> Result<&Entry, ProtocolError> {
        self.by_id
            .get(&id)
            .ok_or(ProtocolError::UnknownMessageType(id.value()))
    }
}
