//! Salted password MACs.
//!
//! A MAC-with-salt blob stores what is needed to check a password later
//! without storing the password itself:
//!
//! ```text
//! [salt_len:4][salt:salt_len][mac_len:4][mac:mac_len]
//! ```
//!
//! Both lengths are big-endian signed 32-bit integers.  `mac` is the
//! PBKDF2-derived secret for `(password, salt)`.  To validate a supplied
//! password the verifier re-derives with the stored salt and compares the
//! whole regenerated blob in constant time.

use subtle::ConstantTimeEq;
use tracing::warn;

use super::symmetric::{SymmetricKey, DEFAULT_SALT_SIZE};
use super::CipherError;

/// Builds a blob for `password` with a fresh random salt.
pub fn generate_mac_and_salt(password: &str) -> Vec<u8> {
    let key = SymmetricKey::with_new_salt(password);
    encode_blob(key.salt(), key.secret())
}

/// Builds a blob for `password` with the given `salt`.
pub fn generate_mac_with_salt(password: &str, salt: &[u8]) -> Vec<u8> {
    let key = SymmetricKey::derive(password, salt);
    encode_blob(key.salt(), key.secret())
}

/// Checks `password` against a stored blob.
///
/// A malformed blob is logged and treated as a failed check.
pub fn validate_mac(mac_with_salt: &[u8], password: &str) -> bool {
    match parse_blob(mac_with_salt) {
        Ok((salt, _)) => generate_mac_with_salt(password, salt)
            .as_slice()
            .ct_eq(mac_with_salt)
            .into(),
        Err(e) => {
            warn!("failed to decode stored login credentials: {e}");
            false
        }
    }
}

/// Extracts the salt from a blob.
///
/// # Errors
///
/// Returns [`CipherError::MalformedMac`] if the length prefixes are inconsistent.
pub fn mac_salt(mac_with_salt: &[u8]) -> Result<Vec<u8>, CipherError> {
    parse_blob(mac_with_salt).map(|(salt, _)| salt.to_vec())
}

fn encode_blob(salt: &[u8], mac: &[u8]) -> Vec<u8> {
    let mut blob = Vec::with_capacity(8 + salt.len() + mac.len());
    blob.extend_from_slice(&(salt.len() as i32).to_be_bytes());
    blob.extend_from_slice(salt);
    blob.extend_from_slice(&(mac.len() as i32).to_be_bytes());
    blob.extend_from_slice(mac);
    blob
}

/// Splits a blob into `(salt, mac)`.
fn parse_blob(blob: &[u8]) -> Result<(&[u8], &[u8]), CipherError> {
    let (salt, rest) = read_field(blob, "salt")?;
    let (mac, _) = read_field(rest, "mac")?;
    Ok((salt, mac))
}

fn read_field<'a>(bytes: &'a [u8], what: &str) -> Result<(&'a [u8], &'a [u8]), CipherError> {
    if bytes.len() < 4 {
        return Err(CipherError::MalformedMac(format!("missing {what} length")));
    }
    let len = i32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    let len = usize::try_from(len)
        .map_err(|_| CipherError::MalformedMac(format!("negative {what} length {len}")))?;
    let rest = &bytes[4..];
    if rest.len() < len {
        return Err(CipherError::MalformedMac(format!(
            "{what} length {len} exceeds remaining {} bytes",
            rest.len()
        )));
    }
    Ok(rest.split_at(len))
}

/// A stored password check: owns a MAC-with-salt blob, never the password.
#[derive(Clone, PartialEq, Eq)]
pub struct SaltedMac(Vec<u8>);

impl SaltedMac {
    /// Derives a blob for `password` with a fresh salt.  The caller can drop
    /// the plaintext afterwards.
    pub fn from_password(password: &str) -> Self {
        Self(generate_mac_and_salt(password))
    }

    /// Wraps a previously stored blob.
    pub fn from_blob(blob: Vec<u8>) -> Self {
        Self(blob)
    }

    pub fn matches(&self, password: &str) -> bool {
        validate_mac(&self.0, password)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl std::fmt::Debug for SaltedMac {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SaltedMac({} bytes)", self.0.len())
    }
}
