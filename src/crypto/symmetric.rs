//! Symmetric providers used to secure message bodies.

use std::io::{Read, Write};

use aes::{Aes128, Aes192, Aes256};
use cbc::cipher::block_padding::Pkcs7;
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use rand::rngs::OsRng;
use rand::RngCore;

use super::{CryptoError, KeySizes};

/// Block cipher in CBC mode with block-aligned padding.
///
/// Encryption and decryption always use the provider's current key and IV.
/// Callers must refresh the IV (see [`generate_iv`](SymmetricProvider::generate_iv))
/// before encrypting each independent message.
pub trait SymmetricProvider: Send {
    /// Algorithm name as registered in the factory
    fn name(&self) -> &'static str;

    fn legal_key_sizes(&self) -> KeySizes;

    /// Cipher block size in bytes
    fn block_size(&self) -> usize;

    fn key_size(&self) -> usize;

    /// Change the key size, generating a fresh random key of that size
    fn set_key_size(&mut self, bits: usize) -> Result<(), CryptoError>;

    fn key(&self) -> &[u8];

    /// Replace the raw key. The key size follows the key length.
    fn set_key(&mut self, key: &[u8]) -> Result<(), CryptoError>;

    fn iv(&self) -> &[u8];

    fn set_iv(&mut self, iv: &[u8]) -> Result<(), CryptoError>;

    fn generate_key(&mut self);

    fn generate_iv(&mut self);

    /// Read `count` plaintext bytes from `src` and write the ciphertext to `dst`.
    /// Returns the number of bytes written.
    fn encrypt(&self, dst: &mut dyn Write, src: &mut dyn Read, count: usize) -> Result<usize, CryptoError>;

    /// Read `count` ciphertext bytes from `src` and write the plaintext to `dst`.
    /// Returns the number of bytes written.
    fn decrypt(&self, dst: &mut dyn Write, src: &mut dyn Read, count: usize) -> Result<usize, CryptoError>;

    /// Ciphertext length produced for `plain_size` bytes of input
    fn encrypted_size(&self, plain_size: usize) -> usize {
        let block = self.block_size();
        (plain_size / block + 1) * block
    }
}

const AES_BLOCK_SIZE: usize = 16;

/// AES in CBC mode with PKCS#7 padding.
pub struct AesProvider {
    key: Vec<u8>,
    iv: [u8; AES_BLOCK_SIZE],
}

impl AesProvider {
    pub const KEY_SIZES: KeySizes = KeySizes::new(128, 256, 64);

    /// Provider with a random 256-bit key and a random IV
    pub fn new() -> Self {
        let mut provider = Self {
            key: vec![0u8; 32],
            iv: [0u8; AES_BLOCK_SIZE],
        };
        provider.generate_key();
        provider.generate_iv();
        provider
    }

    fn encrypt_bytes(&self, plain: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let cipher_text = match self.key.len() {
            16 => cbc::Encryptor::<Aes128>::new_from_slices(&self.key, &self.iv)
                .map(|c| c.encrypt_padded_vec_mut::<Pkcs7>(plain)),
            24 => cbc::Encryptor::<Aes192>::new_from_slices(&self.key, &self.iv)
                .map(|c| c.encrypt_padded_vec_mut::<Pkcs7>(plain)),
            32 => cbc::Encryptor::<Aes256>::new_from_slices(&self.key, &self.iv)
                .map(|c| c.encrypt_padded_vec_mut::<Pkcs7>(plain)),
            other => return Err(CryptoError::InvalidKeySize(other * 8)),
        };
        cipher_text.map_err(|_| CryptoError::InvalidKeySize(self.key.len() * 8))
    }

    fn decrypt_bytes(&self, cipher_text: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let plain = match self.key.len() {
            16 => cbc::Decryptor::<Aes128>::new_from_slices(&self.key, &self.iv)
                .map(|c| c.decrypt_padded_vec_mut::<Pkcs7>(cipher_text)),
            24 => cbc::Decryptor::<Aes192>::new_from_slices(&self.key, &self.iv)
                .map(|c| c.decrypt_padded_vec_mut::<Pkcs7>(cipher_text)),
            32 => cbc::Decryptor::<Aes256>::new_from_slices(&self.key, &self.iv)
                .map(|c| c.decrypt_padded_vec_mut::<Pkcs7>(cipher_text)),
            other => return Err(CryptoError::InvalidKeySize(other * 8)),
        };
        plain
            .map_err(|_| CryptoError::InvalidKeySize(self.key.len() * 8))?
            .map_err(|_| CryptoError::Padding)
    }
}

impl Default for AesProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl SymmetricProvider for AesProvider {
    fn name(&self) -> &'static str {
        "AES"
    }

    fn legal_key_sizes(&self) -> KeySizes {
        Self::KEY_SIZES
    }

    fn block_size(&self) -> usize {
        AES_BLOCK_SIZE
    }

    fn key_size(&self) -> usize {
        self.key.len() * 8
    }

    fn set_key_size(&mut self, bits: usize) -> Result<(), CryptoError> {
        if !Self::KEY_SIZES.contains(bits) {
            return Err(CryptoError::InvalidKeySize(bits));
        }
        self.key = vec![0u8; bits / 8];
        self.generate_key();
        Ok(())
    }

    fn key(&self) -> &[u8] {
        &self.key
    }

    fn set_key(&mut self, key: &[u8]) -> Result<(), CryptoError> {
        if !Self::KEY_SIZES.contains(key.len() * 8) {
            return Err(CryptoError::InvalidKeySize(key.len() * 8));
        }
        self.key = key.to_vec();
        Ok(())
    }

    fn iv(&self) -> &[u8] {
        &self.iv
    }

    fn set_iv(&mut self, iv: &[u8]) -> Result<(), CryptoError> {
        if iv.len() != AES_BLOCK_SIZE {
            return Err(CryptoError::InvalidIv(iv.len(), AES_BLOCK_SIZE));
        }
        self.iv.copy_from_slice(iv);
        Ok(())
    }

    fn generate_key(&mut self) {
        OsRng.fill_bytes(&mut self.key);
    }

    fn generate_iv(&mut self) {
        OsRng.fill_bytes(&mut self.iv);
    }

    fn encrypt(&self, dst: &mut dyn Write, src: &mut dyn Read, count: usize) -> Result<usize, CryptoError> {
        let mut plain = vec![0u8; count];
        src.read_exact(&mut plain)?;
        let cipher_text = self.encrypt_bytes(&plain)?;
        dst.write_all(&cipher_text)?;
        Ok(cipher_text.len())
    }

    fn decrypt(&self, dst: &mut dyn Write, src: &mut dyn Read, count: usize) -> Result<usize, CryptoError> {
        if count % AES_BLOCK_SIZE != 0 {
            return Err(CryptoError::Padding);
        }
        let mut cipher_text = vec![0u8; count];
        src.read_exact(&mut cipher_text)?;
        let plain = self.decrypt_bytes(&cipher_text)?;
        dst.write_all(&plain)?;
        Ok(plain.len())
    }
}
