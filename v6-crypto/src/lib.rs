//! Hybrid RSA/AES payload encryption between organizations.
//!
//! Every message in flight (task input, run result) is encrypted for a
//! single receiving organization using that organization's RSA public key.
//! A fresh AES-256 key encrypts the payload itself; only the small AES key
//! is RSA-wrapped, so payloads of any size cost one RSA operation.

use std::path::Path;

use aes::Aes256;
use base64::Engine;
use ctr::cipher::{KeyIvInit, StreamCipher};
use rand::rngs::OsRng;
use rsa::pkcs1::{DecodeRsaPrivateKey, EncodeRsaPrivateKey};
use rsa::pkcs8::{DecodePublicKey, EncodePublicKey};
use rsa::{Pkcs1v15Encrypt, RsaPrivateKey, RsaPublicKey};
use thiserror::Error;

type Aes256Ctr = ctr::Ctr128BE<Aes256>;

const SEPARATOR: char = '$';
const RSA_KEY_BITS: usize = 4096;
const AES_KEY_LEN: usize = 32;
const AES_IV_LEN: usize = 16;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("private key file not found: {0}")]
    KeyFileNotFound(String),
    #[error("failed to load private key: {0}")]
    KeyLoad(String),
    #[error("failed to generate key: {0}")]
    KeyGenerate(String),
    #[error("invalid peer public key: {0}")]
    BadPeerKey(String),
    #[error("malformed ciphertext envelope (expected 3 '$'-joined fields)")]
    BadEnvelope,
    #[error("base64 decode failed: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("rsa operation failed: {0}")]
    Rsa(String),
}

fn b64(data: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(data)
}

fn un_b64(data: &str) -> Result<Vec<u8>, CryptoError> {
    Ok(base64::engine::general_purpose::STANDARD.decode(data)?)
}

/// Loads/generates an RSA-4096 keypair and performs hybrid RSA/AES
/// encryption and decryption of arbitrary byte payloads.
///
/// `Cryptor` is a plain value owned by whichever process holds the
/// private key (the node agent); it is never a process-wide singleton.
pub struct Cryptor {
    private_key: RsaPrivateKey,
}

impl Cryptor {
    /// Load an existing private key from `path`, generating and
    /// persisting a new one if the file does not exist.
    pub fn load_or_generate(path: &Path) -> Result<Self, CryptoError> {
        if path.exists() {
            Self::load(path)
        } else {
            Self::generate(path)
        }
    }

    /// Load an existing private key from `path`. Fails (the caller is
    /// expected to treat this as fatal on node boot) if the file is
    /// absent or unreadable.
    pub fn load(path: &Path) -> Result<Self, CryptoError> {
        if !path.exists() {
            return Err(CryptoError::KeyFileNotFound(path.display().to_string()));
        }
        log::debug!("loading private key from {}", path.display());
        let pem = std::fs::read_to_string(path)
            .map_err(|e| CryptoError::KeyLoad(e.to_string()))?;
        let private_key = RsaPrivateKey::from_pkcs1_pem(&pem)
            .map_err(|e| CryptoError::KeyLoad(e.to_string()))?;
        Ok(Cryptor { private_key })
    }

    fn generate(path: &Path) -> Result<Self, CryptoError> {
        log::info!("generating new RSA-{} key at {}", RSA_KEY_BITS, path.display());
        let private_key = RsaPrivateKey::new(&mut OsRng, RSA_KEY_BITS)
            .map_err(|e| CryptoError::KeyGenerate(e.to_string()))?;
        let pem = private_key
            .to_pkcs1_pem(rsa::pkcs8::LineEnding::LF)
            .map_err(|e| CryptoError::KeyGenerate(e.to_string()))?;
        std::fs::write(path, pem.as_bytes()).map_err(|e| CryptoError::KeyGenerate(e.to_string()))?;
        Ok(Cryptor { private_key })
    }

    /// This node's public key, PEM `SubjectPublicKeyInfo`, base64-framed.
    pub fn public_key_str(&self) -> Result<String, CryptoError> {
        let public_key = RsaPublicKey::from(&self.private_key);
        let pem = public_key
            .to_public_key_pem(rsa::pkcs8::LineEnding::LF)
            .map_err(|e| CryptoError::Rsa(e.to_string()))?;
        Ok(b64(pem.as_bytes()))
    }

    /// Returns true iff `peer_pubkey_b64` equals this node's own public key.
    pub fn verify_public_key(&self, peer_pubkey_b64: &str) -> Result<bool, CryptoError> {
        Ok(self.public_key_str()? == peer_pubkey_b64)
    }

    /// Encrypt `data` for the organization whose (base64-framed PEM)
    /// public key is `peer_pubkey_b64`.
    pub fn encrypt(data: &[u8], peer_pubkey_b64: &str) -> Result<String, CryptoError> {
        let pem_bytes = un_b64(peer_pubkey_b64)?;
        let pem = String::from_utf8(pem_bytes)
            .map_err(|e| CryptoError::BadPeerKey(e.to_string()))?;
        let pubkey = RsaPublicKey::from_public_key_pem(&pem)
            .map_err(|e| CryptoError::BadPeerKey(e.to_string()))?;

        let mut shared_key = [0u8; AES_KEY_LEN];
        let mut iv = [0u8; AES_IV_LEN];
        rand::RngCore::fill_bytes(&mut OsRng, &mut shared_key);
        rand::RngCore::fill_bytes(&mut OsRng, &mut iv);

        let mut ciphertext = data.to_vec();
        let mut cipher = Aes256Ctr::new((&shared_key).into(), (&iv).into());
        cipher.apply_keystream(&mut ciphertext);

        let enc_key = pubkey
            .encrypt(&mut OsRng, Pkcs1v15Encrypt, &shared_key)
            .map_err(|e| CryptoError::Rsa(e.to_string()))?;

        Ok([b64(&enc_key), b64(&iv), b64(&ciphertext)].join(&SEPARATOR.to_string()))
    }

    /// Decrypt a payload produced by [`Cryptor::encrypt`] using this
    /// node's private key.
    pub fn decrypt(&self, envelope: &str) -> Result<Vec<u8>, CryptoError> {
        let parts: Vec<&str> = envelope.split(SEPARATOR).collect();
        if parts.len() != 3 {
            return Err(CryptoError::BadEnvelope);
        }
        let enc_key = un_b64(parts[0])?;
        let iv = un_b64(parts[1])?;
        let ciphertext = un_b64(parts[2])?;

        let shared_key = self
            .private_key
            .decrypt(Pkcs1v15Encrypt, &enc_key)
            .map_err(|e| CryptoError::Rsa(e.to_string()))?;

        let mut plaintext = ciphertext;
        let mut cipher = Aes256Ctr::new(shared_key.as_slice().into(), iv.as_slice().into());
        cipher.apply_keystream(&mut plaintext);
        Ok(plaintext)
    }
}

/// Encrypt/decrypt for collaborations with `encrypted = false`: a plain
/// base64 framing with no key-wrapping, no separators. Distinct wire shape
/// from [`Cryptor`]'s 3-field envelope, never to be confused with it.
pub struct DummyCryptor;

impl DummyCryptor {
    pub fn encrypt(data: &[u8]) -> String {
        b64(data)
    }

    pub fn decrypt(data: &str) -> Result<Vec<u8>, CryptoError> {
        un_b64(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn round_trip_encrypt_decrypt() {
        let dir = tempdir().unwrap();
        let key_path = dir.path().join("privkey.pem");
        let cryptor = Cryptor::load_or_generate(&key_path).unwrap();
        let pubkey_b64 = cryptor.public_key_str().unwrap();

        let envelope = Cryptor::encrypt(b"hello", &pubkey_b64).unwrap();
        assert_eq!(envelope.matches(SEPARATOR).count(), 2);

        let plaintext = cryptor.decrypt(&envelope).unwrap();
        assert_eq!(plaintext, b"hello");
    }

    #[test]
    fn verify_public_key_detects_mismatch() {
        let dir = tempdir().unwrap();
        let cryptor_a = Cryptor::load_or_generate(&dir.path().join("a.pem")).unwrap();
        let cryptor_b = Cryptor::load_or_generate(&dir.path().join("b.pem")).unwrap();

        assert!(cryptor_a
            .verify_public_key(&cryptor_a.public_key_str().unwrap())
            .unwrap());
        assert!(!cryptor_a
            .verify_public_key(&cryptor_b.public_key_str().unwrap())
            .unwrap());
    }

    #[test]
    fn dummy_cryptor_is_single_field_base64() {
        let envelope = DummyCryptor::encrypt(b"plain");
        assert_eq!(envelope.matches(SEPARATOR).count(), 0);
        assert_eq!(DummyCryptor::decrypt(&envelope).unwrap(), b"plain");
    }

    #[test]
    fn load_missing_key_file_errors() {
        let dir = tempdir().unwrap();
        let missing = dir.path().join("nope.pem");
        assert!(matches!(
            Cryptor::load(&missing),
            Err(CryptoError::KeyFileNotFound(_))
        ));
    }
}
