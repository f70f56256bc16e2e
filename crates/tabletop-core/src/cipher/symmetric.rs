//! Password-derived AES keys and the bound encrypt/decrypt primitives.

use std::fmt;

use aes::Aes128;
use cbc::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use rand::rngs::OsRng;
use rand::RngCore;
use sha1::Sha1;

use super::CipherError;

/// PBKDF2 rounds.  Changing this invalidates every stored password MAC.
pub const KEY_ITERATIONS: u32 = 2000;

/// Derived key length in bytes (AES-128).
pub const KEY_LEN: usize = 16;

/// Default salt length in bytes.
pub const DEFAULT_SALT_SIZE: usize = 128;

/// AES block size; also the IV length.
pub const BLOCK_SIZE: usize = 16;

type Aes128CbcEnc = cbc::Encryptor<Aes128>;
type Aes128CbcDec = cbc::Decryptor<Aes128>;

/// Returns `size` bytes from the operating system's secure RNG.
pub fn create_salt(size: usize) -> Vec<u8> {
    let mut salt = vec![0u8; size];
    OsRng.fill_bytes(&mut salt);
    salt
}

/// A fresh random initialisation vector.
pub fn create_iv() -> [u8; BLOCK_SIZE] {
    let mut iv = [0u8; BLOCK_SIZE];
    OsRng.fill_bytes(&mut iv);
    iv
}

/// A secret derived from `(password, salt)`, together with that salt.
#[derive(Clone, PartialEq, Eq)]
pub struct SymmetricKey {
    secret: [u8; KEY_LEN],
    salt: Vec<u8>,
}

impl SymmetricKey {
    /// PBKDF2-HMAC-SHA1 over `password` and `salt`.
    ///
    /// Deterministic: identical inputs always give identical secrets.
    pub fn derive(password: &str, salt: &[u8]) -> Self {
        let mut secret = [0u8; KEY_LEN];
        pbkdf2::pbkdf2_hmac::<Sha1>(password.as_bytes(), salt, KEY_ITERATIONS, &mut secret);
        Self {
            secret,
            salt: salt.to_vec(),
        }
    }

    /// Derives with a fresh [`DEFAULT_SALT_SIZE`]-byte salt.
    pub fn with_new_salt(password: &str) -> Self {
        Self::derive(password, &create_salt(DEFAULT_SALT_SIZE))
    }

    pub fn secret(&self) -> &[u8] {
        &self.secret
    }

    pub fn salt(&self) -> &[u8] {
        &self.salt
    }

    /// Builds an encryptor bound to this key and `iv`.
    ///
    /// # Errors
    ///
    /// Returns [`CipherError::InvalidLength`] if `iv` is not [`BLOCK_SIZE`] bytes.
    pub fn encryptor(&self, iv: &[u8]) -> Result<SymmetricEncryptor, CipherError> {
        check_iv(iv)?;
        Ok(SymmetricEncryptor {
            secret: self.secret,
            iv: iv.to_vec(),
        })
    }

    /// Builds a decryptor bound to this key and `iv`.
    ///
    /// # Errors
    ///
    /// Returns [`CipherError::InvalidLength`] if `iv` is not [`BLOCK_SIZE`] bytes.
    pub fn decryptor(&self, iv: &[u8]) -> Result<SymmetricDecryptor, CipherError> {
        check_iv(iv)?;
        Ok(SymmetricDecryptor {
            secret: self.secret,
            iv: iv.to_vec(),
        })
    }
}

impl fmt::Debug for SymmetricKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SymmetricKey")
            .field("secret", &"<redacted>")
            .field("salt_len", &self.salt.len())
            .finish()
    }
}

fn check_iv(iv: &[u8]) -> Result<(), CipherError> {
    if iv.len() != BLOCK_SIZE {
        return Err(CipherError::InvalidLength(format!(
            "IV must be {BLOCK_SIZE} bytes, got {}",
            iv.len()
        )));
    }
    Ok(())
}

/// AES-128-CBC encryption with PKCS#7 padding under a fixed key and IV.
pub struct SymmetricEncryptor {
    secret: [u8; KEY_LEN],
    iv: Vec<u8>,
}

impl SymmetricEncryptor {
    /// Encrypts `plaintext`; the output length is the next multiple of [`BLOCK_SIZE`].
    ///
    /// # Errors
    ///
    /// Returns [`CipherError::InvalidLength`] if the bound key or IV is malformed.
    pub fn encode(&self, plaintext: &[u8]) -> Result<Vec<u8>, CipherError> {
        let cipher = Aes128CbcEnc::new_from_slices(&self.secret, &self.iv)
            .map_err(|e| CipherError::InvalidLength(e.to_string()))?;
        Ok(cipher.encrypt_padded_vec_mut::<Pkcs7>(plaintext))
    }
}

/// The inverse of [`SymmetricEncryptor`].
pub struct SymmetricDecryptor {
    secret: [u8; KEY_LEN],
    iv: Vec<u8>,
}

impl SymmetricDecryptor {
    /// Decrypts `ciphertext` and strips its padding.
    ///
    /// # Errors
    ///
    /// Returns [`CipherError::BadPadding`] when the data was produced with a
    /// different key or IV, or is not a whole number of blocks.
    pub fn decode(&self, ciphertext: &[u8]) -> Result<Vec<u8>, CipherError> {
        let cipher = Aes128CbcDec::new_from_slices(&self.secret, &self.iv)
            .map_err(|e| CipherError::InvalidLength(e.to_string()))?;
        cipher
            .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
            .map_err(|_| CipherError::BadPadding)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_salt_has_requested_size() {
        assert_eq!(create_salt(32).len(), 32);
        assert_eq!(create_salt(0).len(), 0);
    }

    #[test]
    fn test_create_salt_is_random() {
        assert_ne!(create_salt(DEFAULT_SALT_SIZE), create_salt(DEFAULT_SALT_SIZE));
    }

    #[test]
    fn test_derive_is_deterministic() {
        // Arrange
        let salt = create_salt(DEFAULT_SALT_SIZE);

        // Act
        let a = SymmetricKey::derive("hunter2", &salt);
        let b = SymmetricKey::derive("hunter2", &salt);

        // Assert
        assert_eq!(a.secret(), b.secret());
        assert_eq!(a, b);
    }

    #[test]
    fn test_derive_depends_on_password_and_salt() {
        let salt = create_salt(16);
        let base = SymmetricKey::derive("hunter2", &salt);
        assert_ne!(base.secret(), SymmetricKey::derive("hunter3", &salt).secret());
        assert_ne!(base.secret(), SymmetricKey::derive("hunter2", &create_salt(16)).secret());
    }

    #[test]
    fn test_derive_matches_pbkdf2_hmac_sha1_reference() {
        let mut expected = [0u8; KEY_LEN];
        pbkdf2::pbkdf2_hmac::<Sha1>(b"password", b"salt", KEY_ITERATIONS, &mut expected);
        assert_eq!(SymmetricKey::derive("password", b"salt").secret(), &expected);
    }

    #[test]
    fn test_encode_then_decode_returns_plaintext() {
        // Arrange
        let key = SymmetricKey::with_new_salt("campaign password");
        let iv = create_iv();
        let plaintext = b"The dragon sleeps beneath the mountain.";

        // Act
        let ciphertext = key.encryptor(&iv).unwrap().encode(plaintext).unwrap();
        let decoded = key.decryptor(&iv).unwrap().decode(&ciphertext).unwrap();

        // Assert
        assert_eq!(decoded, plaintext);
        assert_eq!(ciphertext.len() % BLOCK_SIZE, 0);
        assert_ne!(&ciphertext[..plaintext.len()], plaintext);
    }

    #[test]
    fn test_decode_with_wrong_key_fails_or_differs() {
        let iv = create_iv();
        let right = SymmetricKey::derive("right", b"salt");
        let wrong = SymmetricKey::derive("wrong", b"salt");
        let ciphertext = right.encryptor(&iv).unwrap().encode(b"secret").unwrap();

        // A wrong key yields bad padding almost always; if the padding happens
        // to look valid the bytes still cannot match.
        match wrong.decryptor(&iv).unwrap().decode(&ciphertext) {
            Err(e) => assert!(matches!(e, CipherError::BadPadding)),
            Ok(bytes) => assert_ne!(bytes, b"secret"),
        }
    }

    #[test]
    fn test_decode_truncated_ciphertext_is_bad_padding() {
        let key = SymmetricKey::derive("pw", b"salt");
        let iv = create_iv();
        let result = key.decryptor(&iv).unwrap().decode(&[1, 2, 3]);
        assert!(matches!(result, Err(CipherError::BadPadding)));
    }

    #[test]
    fn test_encryptor_rejects_short_iv() {
        let key = SymmetricKey::derive("pw", b"salt");
        assert!(matches!(
            key.encryptor(&[0u8; 8]),
            Err(CipherError::InvalidLength(_))
        ));
    }

    #[test]
    fn test_debug_output_redacts_secret() {
        let key = SymmetricKey::derive("pw", b"salt");
        let text = format!("{key:?}");
        assert!(text.contains("redacted"));
    }
}
