//! Ed25519 key pairs for possession-based logins.
//!
//! Key material is persisted as two flat files in the application config
//! directory:
//!
//! - `public.key` – the public key as PEM text (SubjectPublicKeyInfo), the
//!   same text a player hands to the GM to be authorized.
//! - `private.key` – the raw PKCS#8 DER bytes of the private key.
//!
//! A text blob holding several public keys (e.g. an authorized-keys file)
//! can be split with [`split_public_keys`]; lines starting with `#` are
//! comments.

use std::fs;
use std::path::{Path, PathBuf};

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use ed25519_dalek::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use rand::RngCore;
use tracing::{info, warn};

use super::CipherError;
use crate::domain::asset::hex_digest;

pub const PUBLIC_KEY_FIRST_LINE: &str = "-----BEGIN PUBLIC KEY-----";
pub const PUBLIC_KEY_LAST_LINE: &str = "-----END PUBLIC KEY-----";

pub const PUBLIC_KEY_FILE: &str = "public.key";
pub const PRIVATE_KEY_FILE: &str = "private.key";

/// A signing key and the verifying key derived from it.
#[derive(Debug, Clone)]
pub struct KeyPair {
    signing: SigningKey,
}

impl KeyPair {
    /// Generates a new pair from the operating system's secure RNG.
    pub fn generate() -> Self {
        let mut secret = [0u8; 32];
        OsRng.fill_bytes(&mut secret);
        Self {
            signing: SigningKey::from_bytes(&secret),
        }
    }

    pub fn signing_key(&self) -> &SigningKey {
        &self.signing
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing.verifying_key()
    }

    /// The public half in its PEM text form.
    ///
    /// # Errors
    ///
    /// Returns [`CipherError::KeyEncoding`] if the key cannot be DER-encoded.
    pub fn public_key_text(&self) -> Result<String, CipherError> {
        public_key_text(&self.verifying_key())
    }

    /// Signs `message`, returning the 64-byte signature.
    pub fn sign(&self, message: &[u8]) -> Vec<u8> {
        self.signing.sign(message).to_bytes().to_vec()
    }
}

/// Checks a signature produced by [`KeyPair::sign`].
///
/// A signature of the wrong length is logged and treated as invalid.
pub fn verify_signature(public: &VerifyingKey, message: &[u8], signature: &[u8]) -> bool {
    let signature = match Signature::from_slice(signature) {
        Ok(s) => s,
        Err(e) => {
            warn!("malformed signature: {e}");
            return false;
        }
    };
    public.verify(message, &signature).is_ok()
}

/// Encodes a public key as PEM text wrapped at 64 columns.
///
/// # Errors
///
/// Returns [`CipherError::KeyEncoding`] if the key cannot be DER-encoded.
pub fn public_key_text(public: &VerifyingKey) -> Result<String, CipherError> {
    let der = public
        .to_public_key_der()
        .map_err(|e| CipherError::KeyEncoding(e.to_string()))?;
    let encoded = STANDARD.encode(der.as_bytes());
    let mut text = String::with_capacity(encoded.len() + 64);
    text.push_str(PUBLIC_KEY_FIRST_LINE);
    text.push('\n');
    for line in encoded.as_bytes().chunks(64) {
        // base64 output is ASCII, so each chunk is valid UTF-8.
        text.push_str(&String::from_utf8_lossy(line));
        text.push('\n');
    }
    text.push_str(PUBLIC_KEY_LAST_LINE);
    text.push('\n');
    Ok(text)
}

/// Parses the text produced by [`public_key_text`].
///
/// # Errors
///
/// Returns [`CipherError::KeyEncoding`] if the markers are missing or the
/// body is not a valid Ed25519 public key.
pub fn decode_public_key_text(text: &str) -> Result<VerifyingKey, CipherError> {
    let trimmed = text.trim();
    let body = trimmed
        .strip_prefix(PUBLIC_KEY_FIRST_LINE)
        .and_then(|rest| rest.strip_suffix(PUBLIC_KEY_LAST_LINE))
        .ok_or_else(|| CipherError::KeyEncoding("not a public key text".to_string()))?;
    let compact: String = body.chars().filter(|c| !c.is_whitespace()).collect();
    let der = STANDARD
        .decode(compact)
        .map_err(|e| CipherError::KeyEncoding(e.to_string()))?;
    VerifyingKey::from_public_key_der(&der).map_err(|e| CipherError::KeyEncoding(e.to_string()))
}

/// MD5 fingerprint of a public key text, ignoring all whitespace.
///
/// # Errors
///
/// Returns [`CipherError::KeyEncoding`] if `text` lacks the BEGIN/END markers.
pub fn public_key_fingerprint(text: &str) -> Result<String, CipherError> {
    let trimmed = text.trim();
    if !trimmed.starts_with(PUBLIC_KEY_FIRST_LINE) || !trimmed.ends_with(PUBLIC_KEY_LAST_LINE) {
        return Err(CipherError::KeyEncoding("not a public key text".to_string()));
    }
    let compact: String = trimmed.chars().filter(|c| !c.is_whitespace()).collect();
    Ok(hex_digest(compact.as_bytes()))
}

/// Splits a text holding several public keys into one text per key.
///
/// Blank lines and `#` comment lines are dropped; text after the last END
/// marker is ignored.
pub fn split_public_keys(concatenated: &str) -> Vec<String> {
    let mut keys = Vec::new();
    let mut current = String::new();
    for line in concatenated.lines() {
        let stripped = line.trim();
        if stripped.is_empty() || stripped.starts_with('#') {
            continue;
        }
        current.push_str(stripped);
        current.push('\n');
        if stripped == PUBLIC_KEY_LAST_LINE {
            keys.push(std::mem::take(&mut current));
        }
    }
    keys
}

/// Joins key texts so that [`split_public_keys`] recovers them.
pub fn concatenate_public_keys<S: AsRef<str>>(keys: &[S]) -> String {
    keys.iter()
        .map(|k| k.as_ref().trim_end())
        .collect::<Vec<_>>()
        .join("\n\n")
}

// ── Key files ─────────────────────────────────────────────────────────────────

/// Location of the two key files.
#[derive(Debug, Clone)]
pub struct KeyPairStore {
    public_path: PathBuf,
    private_path: PathBuf,
}

impl KeyPairStore {
    pub fn new(public_path: impl Into<PathBuf>, private_path: impl Into<PathBuf>) -> Self {
        Self {
            public_path: public_path.into(),
            private_path: private_path.into(),
        }
    }

    /// The standard file names inside `dir`.
    pub fn in_dir(dir: &Path) -> Self {
        Self::new(dir.join(PUBLIC_KEY_FILE), dir.join(PRIVATE_KEY_FILE))
    }

    pub fn public_path(&self) -> &Path {
        &self.public_path
    }

    pub fn exists(&self) -> bool {
        self.public_path.is_file() && self.private_path.is_file()
    }

    /// Writes both files, creating the directory when needed and replacing
    /// any previous pair.
    ///
    /// # Errors
    ///
    /// Returns [`CipherError::Io`] on file-system failures and
    /// [`CipherError::KeyEncoding`] if the key cannot be encoded.
    pub fn write(&self, pair: &KeyPair) -> Result<(), CipherError> {
        let private_der = pair
            .signing_key()
            .to_pkcs8_der()
            .map_err(|e| CipherError::KeyEncoding(e.to_string()))?;
        let public_text = pair.public_key_text()?;

        for path in [&self.public_path, &self.private_path] {
            if let Some(dir) = path.parent() {
                fs::create_dir_all(dir).map_err(|source| CipherError::Io {
                    path: dir.to_path_buf(),
                    source,
                })?;
            }
        }
        fs::write(&self.public_path, public_text).map_err(|source| CipherError::Io {
            path: self.public_path.clone(),
            source,
        })?;
        fs::write(&self.private_path, private_der.as_bytes()).map_err(|source| {
            CipherError::Io {
                path: self.private_path.clone(),
                source,
            }
        })?;
        Ok(())
    }

    /// Reads the pair back and checks that both halves belong together.
    ///
    /// # Errors
    ///
    /// Returns [`CipherError::Io`] if a file is missing or unreadable and
    /// [`CipherError::KeyEncoding`] for corrupt or mismatched key bytes.
    pub fn read(&self) -> Result<KeyPair, CipherError> {
        let public_text =
            fs::read_to_string(&self.public_path).map_err(|source| CipherError::Io {
                path: self.public_path.clone(),
                source,
            })?;
        let private_der = fs::read(&self.private_path).map_err(|source| CipherError::Io {
            path: self.private_path.clone(),
            source,
        })?;

        let signing = SigningKey::from_pkcs8_der(&private_der)
            .map_err(|e| CipherError::KeyEncoding(e.to_string()))?;
        let public = decode_public_key_text(&public_text)?;
        if signing.verifying_key() != public {
            return Err(CipherError::KeyEncoding(
                "public key file does not match private key".to_string(),
            ));
        }
        Ok(KeyPair { signing })
    }

    /// Reads the stored pair, generating and persisting one on first use.
    ///
    /// # Errors
    ///
    /// Same as [`read`](Self::read) and [`write`](Self::write).
    pub fn load_or_generate(&self) -> Result<KeyPair, CipherError> {
        if self.exists() {
            return self.read();
        }
        self.regenerate()
    }

    /// Generates a new pair and overwrites both files.
    ///
    /// # Errors
    ///
    /// Same as [`write`](Self::write).
    pub fn regenerate(&self) -> Result<KeyPair, CipherError> {
        let pair = KeyPair::generate();
        self.write(&pair)?;
        info!("generated new key pair at {}", self.public_path.display());
        Ok(pair)
    }
}
