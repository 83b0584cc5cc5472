//! User accounts.
//!
//! The server only needs to look an account up by login and check a password
//! against it. [`MemoryAccountStore`] is the bundled implementation; any
//! persistent store can be plugged in through [`AccountStore`].

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::validation::{validate_login, validate_password, ValidationError};

const SALT_SIZE: usize = 16;

#[derive(Error, Debug)]
pub enum AccountError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("Account '{0}' already exists")]
    Exists(String),

    #[error("Malformed password hash: {0}")]
    MalformedHash(String),
}

/// Account permission bits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct AccessFlags(u8);

impl AccessFlags {
    pub const NONE: AccessFlags = AccessFlags(0);
    pub const BANNED: AccessFlags = AccessFlags(1);

    pub fn contains(self, other: AccessFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_banned(self) -> bool {
        self.contains(AccessFlags::BANNED)
    }

    pub fn insert(&mut self, other: AccessFlags) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: AccessFlags) {
        self.0 &= !other.0;
    }
}

/// Salted SHA-256 of a password, rendered as `hex(salt):hex(digest)`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PasswordHash {
    salt: Vec<u8>,
    digest: Vec<u8>,
}

impl PasswordHash {
    /// Hash with a fresh random salt
    pub fn new(password: &str) -> Self {
        let mut salt = vec![0u8; SALT_SIZE];
        OsRng.fill_bytes(&mut salt);
        Self::with_salt(password, salt)
    }

    pub fn with_salt(password: &str, salt: Vec<u8>) -> Self {
        let digest = Self::digest(&salt, password);
        Self { salt, digest }
    }

    pub fn verify(&self, password: &str) -> bool {
        Self::digest(&self.salt, password) == self.digest
    }

    fn digest(salt: &[u8], password: &str) -> Vec<u8> {
        let mut hasher = Sha256::new();
        hasher.update(salt);
        hasher.update(password.as_bytes());
        hasher.finalize().to_vec()
    }
}

impl fmt::Display for PasswordHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", hex::encode(&self.salt), hex::encode(&self.digest))
    }
}

impl FromStr for PasswordHash {
    type Err = AccountError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (salt, digest) = s
            .split_once(':')
            .ok_or_else(|| AccountError::MalformedHash(s.to_string()))?;
        let salt = hex::decode(salt).map_err(|e| AccountError::MalformedHash(e.to_string()))?;
        let digest = hex::decode(digest).map_err(|e| AccountError::MalformedHash(e.to_string()))?;
        if digest.len() != 32 {
            return Err(AccountError::MalformedHash(format!(
                "digest must be 32 bytes, got {}",
                digest.len()
            )));
        }
        Ok(Self { salt, digest })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserAccount {
    pub login: String,
    pub password_hash: PasswordHash,
    pub access: AccessFlags,
}

/// Lookup-by-login and password verification
pub trait AccountStore: Send {
    fn find(&self, login: &str) -> Option<&UserAccount>;

    /// Passwords are stored trimmed, so the candidate is trimmed the same way
    fn verify(&self, account: &UserAccount, password: &str) -> bool {
        account.password_hash.verify(password.trim())
    }
}

#[derive(Debug, Default)]
pub struct MemoryAccountStore {
    accounts: HashMap<String, UserAccount>,
}

impl MemoryAccountStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new account after validating login and password
    pub fn register(&mut self, login: &str, password: &str) -> Result<(), AccountError> {
        let login = validate_login(login)?;
        let password = validate_password(password)?;
        self.insert(UserAccount {
            login: login.to_string(),
            password_hash: PasswordHash::new(password),
            access: AccessFlags::NONE,
        })
    }

    pub fn insert(&mut self, account: UserAccount) -> Result<(), AccountError> {
        if self.accounts.contains_key(&account.login) {
            return Err(AccountError::Exists(account.login));
        }
        self.accounts.insert(account.login.clone(), account);
        Ok(())
    }

    pub fn set_access(&mut self, login: &str, access: AccessFlags) -> bool {
        match self.accounts.get_mut(login) {
            Some(account) => {
                account.access = access;
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.accounts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.accounts.is_empty()
    }
}

impl AccountStore for MemoryAccountStore {
    fn find(&self, login: &str) -> Option<&UserAccount> {
        self.accounts.get(login)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_password_hash_verify() {
        let hash = PasswordHash::new("hunter22");
        assert!(hash.verify("hunter22"));
        assert!(!hash.verify("hunter23"));

        // Salted: same password, different hash
        assert_ne!(hash, PasswordHash::new("hunter22"));
    }

    #[test]
    fn test_password_hash_text_roundtrip() {
        let hash = PasswordHash::with_salt("secret1", vec![7u8; 16]);
        let text = hash.to_string();
        assert!(text.starts_with("07070707070707070707070707070707:"));
        let parsed: PasswordHash = text.parse().unwrap();
        assert_eq!(parsed, hash);
        assert!(parsed.verify("secret1"));

        assert!("nocolon".parse::<PasswordHash>().is_err());
        assert!("00:zz".parse::<PasswordHash>().is_err());
        assert!("00:0011".parse::<PasswordHash>().is_err());
    }

    #[test]
    fn test_register_and_find() {
        let mut store = MemoryAccountStore::new();
        store.register("alice", "password1").unwrap();
        assert!(matches!(
            store.register("alice", "password2"),
            Err(AccountError::Exists(_))
        ));
        assert!(matches!(
            store.register("A", "password1"),
            Err(AccountError::Validation(_))
        ));

        let account = store.find("alice").unwrap();
        assert!(store.verify(account, "password1"));
        assert!(!store.verify(account, "password2"));
        assert!(store.find("bob").is_none());
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_padded_password_verifies_as_registered() {
        let mut store = MemoryAccountStore::new();
        store.register("alice", "  password1  ").unwrap();

        let account = store.find("alice").unwrap();
        assert!(store.verify(account, "  password1  "));
        assert!(store.verify(account, "password1"));
        assert!(!store.verify(account, "  password2  "));
    }

    #[test]
    fn test_access_flags() {
        let mut store = MemoryAccountStore::new();
        store.register("mallory", "password1").unwrap();
        assert!(!store.find("mallory").unwrap().access.is_banned());

        assert!(store.set_access("mallory", AccessFlags::BANNED));
        assert!(store.find("mallory").unwrap().access.is_banned());
        assert!(!store.set_access("nobody", AccessFlags::BANNED));

        let mut flags = AccessFlags::BANNED;
        flags.remove(AccessFlags::BANNED);
        assert_eq!(flags, AccessFlags::NONE);
        flags.insert(AccessFlags::BANNED);
        assert!(flags.is_banned());
    }
}
