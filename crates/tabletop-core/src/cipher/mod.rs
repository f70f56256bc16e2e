//! Cipher service: the credential primitives behind the handshake.
//!
//! Two independent credential shapes are supported:
//!
//! - **Symmetric** ([`symmetric`]) – a 128-bit AES key derived from a password
//!   and a salt with PBKDF2-HMAC-SHA1.  Anyone who knows the password and is
//!   given the salt derives bit-identical key material.
//! - **Asymmetric** ([`asymmetric`]) – a long-lived Ed25519 key pair stored as
//!   two flat files, used to prove *possession* of a key rather than
//!   *knowledge* of a password.
//!
//! [`mac`] builds on the symmetric side to store `(salt, derived secret)`
//! blobs that let the server check a password without ever keeping it.
//!
//! Malformed input (truncated blobs, corrupt key bytes, bad padding) is
//! reported as a [`CipherError`] or, for the validation helpers, as a plain
//! `false`; none of it panics.

pub mod asymmetric;
pub mod mac;
pub mod symmetric;

use std::path::PathBuf;

use thiserror::Error;

pub use asymmetric::{KeyPair, KeyPairStore};
pub use ed25519_dalek::{SigningKey, VerifyingKey};
pub use mac::SaltedMac;
pub use symmetric::{SymmetricKey, SymmetricDecryptor, SymmetricEncryptor};

/// Errors produced by the cipher service.
#[derive(Debug, Error)]
pub enum CipherError {
    /// A key or IV had the wrong number of bytes.
    #[error("invalid key or IV length: {0}")]
    InvalidLength(String),

    /// Decryption produced bytes whose PKCS#7 padding is wrong (usually the wrong key).
    #[error("bad padding in decrypted data")]
    BadPadding,

    /// A MAC-with-salt blob's length prefixes do not match its contents.
    #[error("malformed MAC blob: {0}")]
    MalformedMac(String),

    /// Key material could not be encoded or decoded.
    #[error("invalid key encoding: {0}")]
    KeyEncoding(String),

    /// A signature was not 64 bytes or did not verify.
    #[error("signature verification failed")]
    BadSignature,

    /// Reading or writing a key file failed.
    #[error("I/O error accessing key file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// A credential: either a password-derived secret or a key pair.
#[derive(Debug, Clone)]
pub enum Key {
    Symmetric(SymmetricKey),
    /// `private` is absent when only the peer's public key is known.
    Asymmetric {
        public: ed25519_dalek::VerifyingKey,
        private: Option<ed25519_dalek::SigningKey>,
    },
}

impl Key {
    /// Derives a symmetric key from a shared password and a known salt.
    pub fn from_shared(password: &str, salt: &[u8]) -> Self {
        Key::Symmetric(SymmetricKey::derive(password, salt))
    }

    /// Derives a symmetric key from a shared password and a fresh salt.
    pub fn from_shared_new_salt(password: &str) -> Self {
        Key::Symmetric(SymmetricKey::with_new_salt(password))
    }

    /// Wraps a peer's public key given in its text form.
    ///
    /// # Errors
    ///
    /// Returns [`CipherError::KeyEncoding`] if the text is not a valid public key.
    pub fn from_public_key_text(text: &str) -> Result<Self, CipherError> {
        Ok(Key::Asymmetric {
            public: asymmetric::decode_public_key_text(text)?,
            private: None,
        })
    }

    pub fn from_key_pair(pair: &KeyPair) -> Self {
        Key::Asymmetric {
            public: pair.verifying_key(),
            private: Some(pair.signing_key().clone()),
        }
    }

    pub fn is_symmetric(&self) -> bool {
        matches!(self, Key::Symmetric(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_from_shared_is_symmetric() {
        let key = Key::from_shared("secret", b"salt");
        assert!(key.is_symmetric());
    }

    #[test]
    fn test_key_from_public_key_text_rejects_garbage() {
        assert!(matches!(
            Key::from_public_key_text("not a key"),
            Err(CipherError::KeyEncoding(_))
        ));
    }

    #[test]
    fn test_key_from_key_pair_keeps_private_half() {
        let pair = KeyPair::generate();
        match Key::from_key_pair(&pair) {
            Key::Asymmetric { public, private } => {
                assert_eq!(public, pair.verifying_key());
                assert!(private.is_some());
            }
            Key::Symmetric(_) => panic!("expected an asymmetric key"),
        }
    }
}
