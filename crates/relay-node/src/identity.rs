//! Node identity
//!
//! A relay node is identified by an Ed25519 verifying key; its [`PeerId`] is
//! the 32 key bytes. The signing key is persisted as 32 raw bytes so the
//! node keeps its identity across restarts.
//!
//! Peers prove they own the id they claim in `Hello` by signing the nonce the
//! relay sends back in `Welcome`. The signed message binds the nonce to the
//! relay's own id, so a signature collected by one relay is useless at
//! another.

use crate::error::{NodeError, Result};
use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use relay_core::PeerId;
use std::fs;
use std::io::Write;
use std::path::Path;
use tracing::info;

/// Ed25519 key length in bytes
pub const KEY_LEN: usize = 32;

/// Handshake nonce length in bytes
pub const NONCE_LEN: usize = 32;

/// Domain separation prefix for handshake signatures
const HANDSHAKE_CONTEXT: &[u8] = b"circuit-relay/handshake/v1";

fn handshake_message(relay: &PeerId, nonce: &[u8; NONCE_LEN]) -> Vec<u8> {
    let mut msg = Vec::with_capacity(HANDSHAKE_CONTEXT.len() + KEY_LEN + NONCE_LEN);
    msg.extend_from_slice(HANDSHAKE_CONTEXT);
    msg.extend_from_slice(relay.as_bytes());
    msg.extend_from_slice(nonce);
    msg
}

/// Fresh random handshake nonce
#[must_use]
pub fn handshake_nonce() -> [u8; NONCE_LEN] {
    use rand_core::{OsRng, RngCore};
    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);
    nonce
}

/// Check that `signature` was made by `peer` over `nonce` issued by `relay`
///
/// # Errors
///
/// Returns [`NodeError::Identity`] if `peer` is not a valid Ed25519 key or
/// the signature does not verify.
pub fn verify_handshake(
    peer: &PeerId,
    relay: &PeerId,
    nonce: &[u8; NONCE_LEN],
    signature: &[u8],
) -> Result<()> {
    let key = VerifyingKey::from_bytes(peer.as_bytes())
        .map_err(|_| NodeError::identity("peer id is not an Ed25519 key"))?;
    let signature = Signature::from_slice(signature)
        .map_err(|_| NodeError::identity("malformed handshake signature"))?;
    key.verify_strict(&handshake_message(relay, nonce), &signature)
        .map_err(|_| NodeError::identity("handshake signature does not verify"))
}

/// Node identity backed by an Ed25519 signing key
#[derive(Clone)]
pub struct Identity {
    signing_key: SigningKey,
    peer_id: PeerId,
}

impl Identity {
    /// Generate a random identity
    #[must_use]
    pub fn generate() -> Self {
        use rand_core::OsRng;
        Self::from_signing_key(SigningKey::generate(&mut OsRng))
    }

    /// Create an identity from raw signing key bytes
    #[must_use]
    pub fn from_bytes(bytes: &[u8; KEY_LEN]) -> Self {
        Self::from_signing_key(SigningKey::from_bytes(bytes))
    }

    fn from_signing_key(signing_key: SigningKey) -> Self {
        let peer_id = PeerId::from_bytes(signing_key.verifying_key().to_bytes());
        Self {
            signing_key,
            peer_id,
        }
    }

    /// Load the identity stored at `path`
    ///
    /// # Errors
    ///
    /// Returns [`NodeError::Identity`] if the file cannot be read or does
    /// not hold exactly 32 bytes.
    pub fn load(path: &Path) -> Result<Self> {
        let bytes = fs::read(path).map_err(|e| {
            NodeError::Identity(format!("cannot read {}: {e}", path.display()).into())
        })?;
        let key: [u8; KEY_LEN] = bytes.as_slice().try_into().map_err(|_| {
            NodeError::Identity(
                format!(
                    "{} holds {} bytes, expected {KEY_LEN}",
                    path.display(),
                    bytes.len()
                )
                .into(),
            )
        })?;
        Ok(Self::from_bytes(&key))
    }

    /// Write the signing key to `path`, readable by the owner only on Unix
    ///
    /// # Errors
    ///
    /// Returns an error if the file or its parent directory cannot be
    /// written.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut options = fs::OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            // Owner-only from creation, never readable under the umask
            options.mode(0o600);
        }
        let mut file = options.open(path)?;
        file.write_all(&self.signing_key.to_bytes())?;
        file.sync_all()?;

        #[cfg(unix)]
        {
            // An existing file keeps its old mode on open
            use std::os::unix::fs::PermissionsExt;
            file.set_permissions(fs::Permissions::from_mode(0o600))?;
        }
        Ok(())
    }

    /// Load the identity at `path`, or generate and persist a new one if the
    /// file does not exist
    ///
    /// # Errors
    ///
    /// Returns an error if an existing file is invalid or a new one cannot be
    /// written.
    pub fn load_or_generate(path: &Path) -> Result<Self> {
        if path.exists() {
            let identity = Self::load(path)?;
            info!(peer = %identity.peer_id, path = %path.display(), "loaded identity");
            Ok(identity)
        } else {
            let identity = Self::generate();
            identity.save(path)?;
            info!(peer = %identity.peer_id, path = %path.display(), "generated identity");
            Ok(identity)
        }
    }

    /// Sign the handshake nonce `relay` sent in `Welcome`
    #[must_use]
    pub fn sign_handshake(&self, relay: &PeerId, nonce: &[u8; NONCE_LEN]) -> Vec<u8> {
        self.signing_key
            .sign(&handshake_message(relay, nonce))
            .to_bytes()
            .to_vec()
    }

    /// The node's peer id (Ed25519 verifying key)
    #[must_use]
    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Identity")
            .field("peer_id", &self.peer_id.fmt_short())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_identity_unique() {
        let a = Identity::generate();
        let b = Identity::generate();
        assert_ne!(a.peer_id(), b.peer_id());
    }

    #[test]
    fn test_load_or_generate_persists() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("keys/relay.key");

        let first = Identity::load_or_generate(&path).unwrap();
        assert_eq!(fs::read(&path).unwrap().len(), KEY_LEN);
        let second = Identity::load_or_generate(&path).unwrap();
        assert_eq!(first.peer_id(), second.peer_id());
    }

    #[cfg(unix)]
    #[test]
    fn test_key_file_mode() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let path = dir.path().join("relay.key");
        Identity::generate().save(&path).unwrap();

        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[cfg(unix)]
    #[test]
    fn test_save_tightens_existing_file() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let path = dir.path().join("relay.key");
        fs::write(&path, b"stale contents that are longer than a key").unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o644)).unwrap();

        let identity = Identity::generate();
        identity.save(&path).unwrap();

        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
        assert_eq!(Identity::load(&path).unwrap().peer_id(), identity.peer_id());
    }

    #[test]
    fn test_load_rejects_wrong_length() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("relay.key");
        fs::write(&path, [7u8; 31]).unwrap();

        let err = Identity::load(&path).unwrap_err();
        assert!(matches!(err, NodeError::Identity(_)));
        assert!(!err.is_transient());
    }

    #[test]
    fn test_handshake_signature_verifies() {
        let peer = Identity::from_bytes(&[1u8; KEY_LEN]);
        let relay = Identity::from_bytes(&[2u8; KEY_LEN]).peer_id();
        let nonce = handshake_nonce();

        let signature = peer.sign_handshake(&relay, &nonce);
        verify_handshake(&peer.peer_id(), &relay, &nonce, &signature).unwrap();
    }

    #[test]
    fn test_handshake_rejects_wrong_signer() {
        let victim = Identity::from_bytes(&[1u8; KEY_LEN]);
        let impostor = Identity::from_bytes(&[3u8; KEY_LEN]);
        let relay = Identity::from_bytes(&[2u8; KEY_LEN]).peer_id();
        let nonce = handshake_nonce();

        let signature = impostor.sign_handshake(&relay, &nonce);
        let err = verify_handshake(&victim.peer_id(), &relay, &nonce, &signature).unwrap_err();
        assert!(matches!(err, NodeError::Identity(_)));
    }

    #[test]
    fn test_handshake_bound_to_relay_and_nonce() {
        let peer = Identity::from_bytes(&[1u8; KEY_LEN]);
        let relay = Identity::from_bytes(&[2u8; KEY_LEN]).peer_id();
        let other_relay = Identity::from_bytes(&[4u8; KEY_LEN]).peer_id();
        let nonce = handshake_nonce();
        let signature = peer.sign_handshake(&relay, &nonce);

        assert!(verify_handshake(&peer.peer_id(), &other_relay, &nonce, &signature).is_err());
        assert!(verify_handshake(&peer.peer_id(), &relay, &handshake_nonce(), &signature).is_err());
        assert!(verify_handshake(&peer.peer_id(), &relay, &nonce, &signature[..63]).is_err());
    }

    #[test]
    fn test_debug_hides_key() {
        let identity = Identity::from_bytes(&[9u8; KEY_LEN]);
        let debug = format!("{identity:?}");
        assert!(debug.contains(&identity.peer_id().fmt_short()));
        assert!(!debug.contains(&hex::encode([9u8; KEY_LEN])));
    }
}
