//! Session Cryptography Module
//!
//! Two provider families are used by the handshake and by every secured
//! message afterwards:
//!
//! - [`AsymmetricProvider`]: exchanges the session key. The client exports a
//!   public key, the server encrypts a freshly generated session key with it.
//! - [`SymmetricProvider`]: encrypts message bodies with the session key once
//!   the handshake is complete.
//!
//! Providers are created by name through a [`CryptoFactory`], which is built
//! once at startup and handed to the server or client that needs it.

pub mod asymmetric;
pub mod symmetric;

use std::collections::HashMap;

use thiserror::Error;

use crate::protocol::ConfigError;

pub use asymmetric::{AsymmetricProvider, RsaProvider, DEFAULT_RSA_KEY_SIZE};
pub use symmetric::{AesProvider, SymmetricProvider};

/// Crypto errors
#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("Invalid key size: {0} bits")]
    InvalidKeySize(usize),

    #[error("Invalid IV length: {0} bytes (expected {1})")]
    InvalidIv(usize, usize),

    #[error("No key has been set")]
    KeyNotSet,

    #[error("Private key is not available")]
    MissingPrivateKey,

    #[error("RSA error: {0}")]
    Rsa(#[from] rsa::Error),

    #[error("Key encoding error: {0}")]
    KeyEncoding(String),

    #[error("Invalid padding")]
    Padding,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Set of legal key sizes in bits, described as an inclusive stepped range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeySizes {
    pub min: usize,
    pub max: usize,
    pub step: usize,
}

impl KeySizes {
    pub const fn new(min: usize, max: usize, step: usize) -> Self {
        Self { min, max, step }
    }

    pub fn contains(&self, bits: usize) -> bool {
        if bits < self.min || bits > self.max {
            return false;
        }
        self.step == 0 || (bits - self.min) % self.step == 0
    }

    /// Every legal size, smallest first
    pub fn iter(&self) -> impl Iterator<Item = usize> {
        let step = self.step.max(1);
        (self.min..=self.max).step_by(step)
    }
}

type AsymmetricCtor = fn() -> Box<dyn AsymmetricProvider>;
type SymmetricCtor = fn() -> Box<dyn SymmetricProvider>;

/// Registry of crypto provider constructors keyed by algorithm name.
pub struct CryptoFactory {
    asymmetric: HashMap<String, AsymmetricCtor>,
    symmetric: HashMap<String, SymmetricCtor>,
}

impl CryptoFactory {
    /// Factory with the built-in providers registered
    pub fn new() -> Self {
        let mut factory = Self::empty();
        factory.register_asymmetric("RSA", || Box::new(RsaProvider::new()));
        factory.register_symmetric("AES", || Box::new(AesProvider::new()));
        factory.register_symmetric("Rijndael", || Box::new(AesProvider::new()));
        factory
    }

    pub fn empty() -> Self {
        Self {
            asymmetric: HashMap::new(),
            symmetric: HashMap::new(),
        }
    }

    pub fn register_asymmetric(&mut self, name: &str, ctor: AsymmetricCtor) {
        self.asymmetric.insert(name.to_ascii_uppercase(), ctor);
    }

    pub fn register_symmetric(&mut self, name: &str, ctor: SymmetricCtor) {
        self.symmetric.insert(name.to_ascii_uppercase(), ctor);
    }

    pub fn create_asymmetric(&self, name: &str) -> Result<Box<dyn AsymmetricProvider>, ConfigError> {
        self.asymmetric
            .get(&name.to_ascii_uppercase())
            .map(|ctor| ctor())
            .ok_or_else(|| unsupported(name, self.asymmetric_algorithms()))
    }

    pub fn create_symmetric(&self, name: &str) -> Result<Box<dyn SymmetricProvider>, ConfigError> {
        self.symmetric
            .get(&name.to_ascii_uppercase())
            .map(|ctor| ctor())
            .ok_or_else(|| unsupported(name, self.symmetric_algorithms()))
    }

    pub fn asymmetric_algorithms(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.asymmetric.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn symmetric_algorithms(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.symmetric.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

fn unsupported(name: &str, available: Vec<&str>) -> ConfigError {
    ConfigError::NotSupported(format!("{} (available: {})", name, available.join(", ")))
}

impl Default for CryptoFactory {
    fn default() -> Self {
        Self::new()
    }
}
