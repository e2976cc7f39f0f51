//! Link identity: a P-256 key pair, the dsId derived from it, and the
//! handshake auth token.

use std::path::Path;

use base64::engine::general_purpose::{STANDARD_NO_PAD, URL_SAFE_NO_PAD};
use base64::Engine;
use p256::elliptic_curve::sec1::ToEncodedPoint;
use p256::{PublicKey, SecretKey};
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};

use crate::error::{HandshakeError, PersistenceError};

/// The link's long-lived key pair.
#[derive(Clone)]
pub struct LinkKeys {
    secret: SecretKey,
}

impl LinkKeys {
    pub fn generate() -> Self {
        Self {
            secret: SecretKey::random(&mut OsRng),
        }
    }

    /// Read the key file at `path`, or generate a key pair and write it
    /// there.  The file holds the base64url secret scalar followed by the
    /// base64url public point.
    pub fn load_or_create(path: &Path) -> Result<Self, PersistenceError> {
        if path.exists() {
            let raw = std::fs::read_to_string(path)?;
            let keys = Self::parse(&raw)?;
            tracing::debug!(path = %path.display(), "loaded link keys");
            return Ok(keys);
        }
        let keys = Self::generate();
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir)?;
        }
        std::fs::write(path, keys.serialize())?;
        tracing::info!(path = %path.display(), "generated new link keys");
        Ok(keys)
    }

    fn parse(raw: &str) -> Result<Self, PersistenceError> {
        let encoded = raw
            .split_whitespace()
            .next()
            .ok_or_else(|| PersistenceError::InvalidKey("empty key file".into()))?;
        let bytes = decode_b64(encoded).ok_or_else(|| PersistenceError::InvalidKey("secret is not base64".into()))?;
        let secret = SecretKey::from_slice(&bytes).map_err(|e| PersistenceError::InvalidKey(e.to_string()))?;
        Ok(Self { secret })
    }

    fn serialize(&self) -> String {
        format!(
            "{} {}",
            URL_SAFE_NO_PAD.encode(self.secret.to_bytes()),
            self.public_key_b64()
        )
    }

    /// Uncompressed SEC1 public point (65 bytes).
    pub fn encoded_public_key(&self) -> Vec<u8> {
        self.secret.public_key().to_encoded_point(false).as_bytes().to_vec()
    }

    pub fn public_key_b64(&self) -> String {
        URL_SAFE_NO_PAD.encode(self.encoded_public_key())
    }

    /// `name-<base64url(sha256(public key))>`
    pub fn ds_id(&self, name: &str) -> String {
        let digest = Sha256::digest(self.encoded_public_key());
        format!("{name}-{}", URL_SAFE_NO_PAD.encode(digest))
    }

    /// ECDH with the broker's temporary key (base64url SEC1 point).
    pub fn shared_secret(&self, temp_key: &str) -> Result<Vec<u8>, HandshakeError> {
        let bytes =
            decode_b64(temp_key).ok_or_else(|| HandshakeError::Crypto("tempKey is not base64".into()))?;
        let peer = PublicKey::from_sec1_bytes(&bytes).map_err(|e| HandshakeError::Crypto(e.to_string()))?;
        let shared = p256::ecdh::diffie_hellman(self.secret.to_nonzero_scalar(), peer.as_affine());
        Ok(shared.raw_secret_bytes().to_vec())
    }
}

impl std::fmt::Debug for LinkKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LinkKeys")
            .field("public_key", &self.public_key_b64())
            .finish_non_exhaustive()
    }
}

/// `base64url(sha256(salt ‖ shared))`
pub fn auth_token(salt: &str, shared: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(shared);
    URL_SAFE_NO_PAD.encode(hasher.finalize())
}

/// Brokers differ on padding and alphabet.
fn decode_b64(input: &str) -> Option<Vec<u8>> {
    let trimmed = input.trim().trim_end_matches('=');
    URL_SAFE_NO_PAD
        .decode(trimmed)
        .or_else(|_| STANDARD_NO_PAD.decode(trimmed))
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn public_key_is_uncompressed_point() {
        let keys = LinkKeys::generate();
        let point = keys.encoded_public_key();
        assert_eq!(point.len(), 65);
        assert_eq!(point[0], 0x04);
    }

    #[test]
    fn ds_id_is_name_plus_hash() {
        let keys = LinkKeys::generate();
        let id = keys.ds_id("rng");
        assert!(id.starts_with("rng-"));
        // 32-byte digest, unpadded base64url
        assert_eq!(id.len(), "rng-".len() + 43);
        assert_eq!(id, keys.ds_id("rng"));
    }

    #[test]
    fn ecdh_agrees_on_both_sides() {
        let link = LinkKeys::generate();
        let broker = LinkKeys::generate();
        let a = link.shared_secret(&broker.public_key_b64()).unwrap();
        let b = broker.shared_secret(&link.public_key_b64()).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 32);
    }

    #[test]
    fn bad_temp_key_is_a_crypto_error() {
        let keys = LinkKeys::generate();
        assert!(matches!(keys.shared_secret("!!!"), Err(HandshakeError::Crypto(_))));
        assert!(matches!(keys.shared_secret("AAAA"), Err(HandshakeError::Crypto(_))));
    }

    #[test]
    fn auth_token_depends_on_salt_and_secret() {
        let t1 = auth_token("0x100", &[1, 2, 3]);
        assert_eq!(t1, auth_token("0x100", &[1, 2, 3]));
        assert_eq!(t1.len(), 43);
        assert_ne!(t1, auth_token("0x101", &[1, 2, 3]));
        assert_ne!(t1, auth_token("0x100", &[1, 2, 4]));
    }

    #[test]
    fn key_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join(".keys");
        let first = LinkKeys::load_or_create(&path).unwrap();
        assert!(path.exists());
        let second = LinkKeys::load_or_create(&path).unwrap();
        assert_eq!(first.ds_id("x"), second.ds_id("x"));
    }

    #[test]
    fn corrupt_key_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".keys");
        std::fs::write(&path, "not-a-key").unwrap();
        assert!(matches!(
            LinkKeys::load_or_create(&path),
            Err(PersistenceError::InvalidKey(_))
        ));
    }
}
