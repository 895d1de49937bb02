use base64::{engine::general_purpose::STANDARD, Engine as _};
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    XChaCha20Poly1305, XNonce,
};
use rand::RngCore;

use crate::constants::{KDF_CONTEXT_CONVERSATION_KEY, NONCE_SIZE, SYMMETRIC_KEY_SIZE};
use crate::error::CryptoError;

pub type SymmetricKey = [u8; SYMMETRIC_KEY_SIZE];

pub fn generate_symmetric_key() -> SymmetricKey {
    let mut key = [0u8; SYMMETRIC_KEY_SIZE];
    rand::rngs::OsRng.fill_bytes(&mut key);
    key
}

pub fn generate_nonce() -> [u8; NONCE_SIZE] {
    let mut nonce = [0u8; NONCE_SIZE];
    rand::rngs::OsRng.fill_bytes(&mut nonce);
    nonce
}

// Returns nonce || ciphertext (24 bytes nonce prepended)
pub fn encrypt(key: &SymmetricKey, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let nonce_bytes = generate_nonce();
    let ciphertext = encrypt_with_nonce(key, &nonce_bytes, plaintext)?;

    let mut output = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    output.extend_from_slice(&nonce_bytes);
    output.extend_from_slice(&ciphertext);
    Ok(output)
}

pub fn decrypt(key: &SymmetricKey, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if data.len() < NONCE_SIZE {
        return Err(CryptoError::DecryptionFailed);
    }

    let (nonce_bytes, ciphertext) = data.split_at(NONCE_SIZE);
    let mut nonce = [0u8; NONCE_SIZE];
    nonce.copy_from_slice(nonce_bytes);
    decrypt_with_nonce(key, &nonce, ciphertext)
}

fn encrypt_with_nonce(
    key: &SymmetricKey,
    nonce: &[u8; NONCE_SIZE],
    plaintext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let cipher = XChaCha20Poly1305::new(key.into());
    cipher
        .encrypt(XNonce::from_slice(nonce), plaintext)
        .map_err(|_| CryptoError::EncryptionFailed)
}

fn decrypt_with_nonce(
    key: &SymmetricKey,
    nonce: &[u8; NONCE_SIZE],
    ciphertext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let cipher = XChaCha20Poly1305::new(key.into());
    cipher
        .decrypt(XNonce::from_slice(nonce), ciphertext)
        .map_err(|_| CryptoError::DecryptionFailed)
}

pub fn derive_key_from_passphrase(passphrase: &[u8], context: &str) -> SymmetricKey {
    let mut hasher = blake3::Hasher::new_derive_key(context);
    hasher.update(passphrase);
    let hash = hasher.finalize();
    let mut key = [0u8; SYMMETRIC_KEY_SIZE];
    key.copy_from_slice(&hash.as_bytes()[..SYMMETRIC_KEY_SIZE]);
    key
}

/// Per-conversation symmetric key. Supplied by the key-management layer and
/// held in memory only.
#[derive(Clone, PartialEq, Eq)]
pub struct Keyword(SymmetricKey);

impl Keyword {
    pub fn from_bytes(key: SymmetricKey) -> Self {
        Self(key)
    }

    /// Derive the key from a shared keyword string.
    pub fn from_passphrase(passphrase: &str) -> Self {
        Self(derive_key_from_passphrase(
            passphrase.as_bytes(),
            KDF_CONTEXT_CONVERSATION_KEY,
        ))
    }

    pub fn from_hex(hex_str: &str) -> Result<Self, CryptoError> {
        let bytes = hex::decode(hex_str.trim())
            .map_err(|e| CryptoError::InvalidEncoding(e.to_string()))?;
        if bytes.len() != SYMMETRIC_KEY_SIZE {
            return Err(CryptoError::InvalidKeyLength);
        }
        let mut key = [0u8; SYMMETRIC_KEY_SIZE];
        key.copy_from_slice(&bytes);
        Ok(Self(key))
    }

    pub fn as_key(&self) -> &SymmetricKey {
        &self.0
    }
}

impl std::fmt::Debug for Keyword {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Keyword(..)")
    }
}

/// Per-file key material. The raw key and nonce never leave the client; the
/// `encrypted_*` fields are sealed with the conversation keyword and travel in
/// the message envelope.
#[derive(Clone)]
pub struct FileSecret {
    key: SymmetricKey,
    nonce: [u8; NONCE_SIZE],
    pub encrypted_key: String,
    pub encrypted_iv: String,
}

impl std::fmt::Debug for FileSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileSecret")
            .field("encrypted_key", &self.encrypted_key)
            .field("encrypted_iv", &self.encrypted_iv)
            .finish_non_exhaustive()
    }
}

/// Encryption capability consumed by the engine.
///
/// Text payloads travel as base64 strings; file payloads as raw bytes with
/// their key and IV sealed separately.
pub trait CryptoAdapter: Send + Sync {
    fn encrypt(&self, plaintext: &[u8], key: &Keyword) -> Result<String, CryptoError>;

    fn decrypt(&self, payload: &[u8], key: &Keyword) -> Result<Vec<u8>, CryptoError>;

    /// Decrypt a base64 text payload as received in message records.
    fn decrypt_text(&self, payload: &str, key: &Keyword) -> Result<Vec<u8>, CryptoError> {
        let raw = STANDARD
            .decode(payload.trim())
            .map_err(|e| CryptoError::InvalidEncoding(e.to_string()))?;
        self.decrypt(&raw, key)
    }

    /// Generate fresh per-file key material sealed under `key`.
    fn seal_file_secret(&self, key: &Keyword) -> Result<FileSecret, CryptoError>;

    fn encrypt_file(&self, bytes: &[u8], secret: &FileSecret) -> Result<Vec<u8>, CryptoError>;

    fn decrypt_file(
        &self,
        bytes: &[u8],
        encrypted_key: &str,
        encrypted_iv: &str,
        key: &Keyword,
    ) -> Result<Vec<u8>, CryptoError>;
}

/// XChaCha20-Poly1305 implementation of [`CryptoAdapter`].
#[derive(Debug, Default, Clone, Copy)]
pub struct XChaChaAdapter;

impl XChaChaAdapter {
    fn open_sealed<const N: usize>(&self, sealed: &str, key: &Keyword) -> Result<[u8; N], CryptoError> {
        let plain = self.decrypt_text(sealed, key)?;
        if plain.len() != N {
            return Err(CryptoError::InvalidKeyLength);
        }
        let mut out = [0u8; N];
        out.copy_from_slice(&plain);
        Ok(out)
    }
}

impl CryptoAdapter for XChaChaAdapter {
    fn encrypt(&self, plaintext: &[u8], key: &Keyword) -> Result<String, CryptoError> {
        let sealed = encrypt(key.as_key(), plaintext)?;
        Ok(STANDARD.encode(sealed))
    }

    fn decrypt(&self, payload: &[u8], key: &Keyword) -> Result<Vec<u8>, CryptoError> {
        decrypt(key.as_key(), payload)
    }

    fn seal_file_secret(&self, key: &Keyword) -> Result<FileSecret, CryptoError> {
        let file_key = generate_symmetric_key();
        let nonce = generate_nonce();
        Ok(FileSecret {
            encrypted_key: self.encrypt(&file_key, key)?,
            encrypted_iv: self.encrypt(&nonce, key)?,
            key: file_key,
            nonce,
        })
    }

    fn encrypt_file(&self, bytes: &[u8], secret: &FileSecret) -> Result<Vec<u8>, CryptoError> {
        encrypt_with_nonce(&secret.key, &secret.nonce, bytes)
    }

    fn decrypt_file(
        &self,
        bytes: &[u8],
        encrypted_key: &str,
        encrypted_iv: &str,
        key: &Keyword,
    ) -> Result<Vec<u8>, CryptoError> {
        let file_key: SymmetricKey = self.open_sealed(encrypted_key, key)?;
        let nonce: [u8; NONCE_SIZE] = self.open_sealed(encrypted_iv, key)?;
        decrypt_with_nonce(&file_key, &nonce, bytes)
    }
}
