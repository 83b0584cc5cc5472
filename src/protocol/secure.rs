//! Encrypted message container.

use std::io::Cursor;

use serde::{Deserialize, Serialize};

use crate::crypto::SymmetricProvider;

use super::wire::{BinaryReader, BinaryWriter, WireField, WireObject};
use super::{Message, MessageCatalog, MessageId, Protocol, ProtocolError};

/// IV and ciphertext of one serialized message.
///
/// The container is itself a wire object (`{iv, cdata}`) and travels as the
/// body of a header carrying the `Secure` flag and the inner message id.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecureMessageContainer {
    #[serde(rename = "iv", with = "crate::protocol::wire::base64_bytes")]
    pub iv: Vec<u8>,
    #[serde(rename = "cdata", with = "crate::protocol::wire::base64_bytes")]
    pub cipher_text: Vec<u8>,
}

impl SecureMessageContainer {
    /// Serialize `message` and encrypt it under the provider's current key
    /// and IV. The IV is captured into the container.
    pub fn store(
        message: &Message,
        provider: &dyn SymmetricProvider,
        protocol: Protocol,
    ) -> Result<Self, ProtocolError> {
        let plain = message.save(protocol)?;
        let mut cipher_text = Vec::with_capacity(provider.encrypted_size(plain.len()));
        provider.encrypt(&mut cipher_text, &mut Cursor::new(&plain), plain.len())?;
        Ok(Self {
            iv: provider.iv().to_vec(),
            cipher_text,
        })
    }

    /// Decrypt with the provider's key and the stored IV, then decode as the
    /// variant registered for `id`. A wrong key surfaces as a load failure.
    pub fn extract(
        &self,
        id: MessageId,
        catalog: &MessageCatalog,
        provider: &mut dyn SymmetricProvider,
        protocol: Protocol,
    ) -> Result<Message, ProtocolError> {
        provider
            .set_iv(&self.iv)
            .map_err(|e| ProtocolError::load(format!("secure container IV: {}", e)))?;

        let mut plain = Vec::with_capacity(self.cipher_text.len());
        provider
            .decrypt(
                &mut plain,
                &mut Cursor::new(&self.cipher_text),
                self.cipher_text.len(),
            )
            .map_err(|e| ProtocolError::load(format!("secure container decrypt: {}", e)))?;

        catalog.load(id, &plain, protocol)
    }
}

impl WireObject for SecureMessageContainer {
    fn save_binary(&self, w: &mut BinaryWriter) -> Result<(), ProtocolError> {
        self.iv.write(w)?;
        self.cipher_text.write(w)
    }

    fn load_binary(r: &mut BinaryReader<'_>) -> Result<Self, ProtocolError> {
        Ok(Self {
            iv: Vec::read(r)?,
            cipher_text: Vec::read(r)?,
        })
    }
}
