//! Asymmetric providers used for the session key exchange.

use rand::rngs::OsRng;
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey, LineEnding};
use rsa::traits::PublicKeyParts;
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use sha2::Sha256;
use tracing::debug;

use super::{CryptoError, KeySizes};

/// Default RSA modulus size in bits
pub const DEFAULT_RSA_KEY_SIZE: usize = 2048;

/// Public-key cipher used to wrap the session key.
///
/// Input to [`encrypt`](AsymmetricProvider::encrypt) is bounded by the key
/// size, so this is only ever used for short secrets.
pub trait AsymmetricProvider: Send {
    /// Algorithm name as registered in the factory
    fn name(&self) -> &'static str;

    fn legal_key_sizes(&self) -> KeySizes;

    fn key_size(&self) -> usize;

    /// Change the key size. A different size discards the current key pair
    /// and generates a new one.
    fn set_key_size(&mut self, bits: usize) -> Result<(), CryptoError>;

    /// Export key material as an interchange string. A key pair is generated
    /// first if none exists yet.
    fn export_key(&mut self, include_private: bool) -> Result<String, CryptoError>;

    /// Import key material produced by [`export_key`](AsymmetricProvider::export_key).
    /// Importing a public key leaves the provider able to encrypt only.
    fn import_key(&mut self, key: &str) -> Result<(), CryptoError>;

    fn encrypt(&self, data: &[u8]) -> Result<Vec<u8>, CryptoError>;

    fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>, CryptoError>;
}

/// RSA with OAEP/SHA-256 padding, keys exchanged as PEM.
pub struct RsaProvider {
    key_size: usize,
    private_key: Option<RsaPrivateKey>,
    public_key: Option<RsaPublicKey>,
}

impl RsaProvider {
    pub const KEY_SIZES: KeySizes = KeySizes::new(1024, 4096, 1024);

    /// Provider with the default key size. No key is generated until one is
    /// needed.
    pub fn new() -> Self {
        Self {
            key_size: DEFAULT_RSA_KEY_SIZE,
            private_key: None,
            public_key: None,
        }
    }

    fn generate(&mut self) -> Result<(), CryptoError> {
        debug!("Generating {}-bit RSA key pair", self.key_size);
        let private_key = RsaPrivateKey::new(&mut OsRng, self.key_size)?;
        self.public_key = Some(RsaPublicKey::from(&private_key));
        self.private_key = Some(private_key);
        Ok(())
    }

    fn padding() -> Oaep {
        Oaep::new::<Sha256>()
    }
}

impl Default for RsaProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl AsymmetricProvider for RsaProvider {
    fn name(&self) -> &'static str {
        "RSA"
    }

    fn legal_key_sizes(&self) -> KeySizes {
        Self::KEY_SIZES
    }

    fn key_size(&self) -> usize {
        self.key_size
    }

    fn set_key_size(&mut self, bits: usize) -> Result<(), CryptoError> {
        if !Self::KEY_SIZES.contains(bits) {
            return Err(CryptoError::InvalidKeySize(bits));
        }
        if bits != self.key_size || self.private_key.is_none() {
            self.key_size = bits;
            self.generate()?;
        }
        Ok(())
    }

    fn export_key(&mut self, include_private: bool) -> Result<String, CryptoError> {
        if self.public_key.is_none() {
            self.generate()?;
        }

        if include_private {
            let private_key = self
                .private_key
                .as_ref()
                .ok_or(CryptoError::MissingPrivateKey)?;
            let pem = private_key
                .to_pkcs8_pem(LineEnding::LF)
                .map_err(|e| CryptoError::KeyEncoding(e.to_string()))?;
            return Ok(pem.as_str().to_owned());
        }

        let public_key = self.public_key.as_ref().ok_or(CryptoError::KeyNotSet)?;
        public_key
            .to_public_key_pem(LineEnding::LF)
            .map_err(|e| CryptoError::KeyEncoding(e.to_string()))
    }

    fn import_key(&mut self, key: &str) -> Result<(), CryptoError> {
        let (private_key, public_key) = match RsaPrivateKey::from_pkcs8_pem(key) {
            Ok(private_key) => {
                let public_key = RsaPublicKey::from(&private_key);
                (Some(private_key), public_key)
            }
            Err(_) => {
                let public_key = RsaPublicKey::from_public_key_pem(key)
                    .map_err(|e| CryptoError::KeyEncoding(e.to_string()))?;
                (None, public_key)
            }
        };

        let bits = public_key.size() * 8;
        if !Self::KEY_SIZES.contains(bits) {
            return Err(CryptoError::InvalidKeySize(bits));
        }

        self.key_size = bits;
        self.private_key = private_key;
        self.public_key = Some(public_key);
        Ok(())
    }

    fn encrypt(&self, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let public_key = self.public_key.as_ref().ok_or(CryptoError::KeyNotSet)?;
        Ok(public_key.encrypt(&mut OsRng, Self::padding(), data)?)
    }

    fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let private_key = self
            .private_key
            .as_ref()
            .ok_or(CryptoError::MissingPrivateKey)?;
        Ok(private_key.decrypt(Self::padding(), data)?)
    }
}
