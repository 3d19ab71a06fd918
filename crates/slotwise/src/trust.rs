//! Signature verification against pinned trust anchors.
//!
//! Keys are distributed out of band (agent configuration); nothing embedded in
//! an artifact is ever used as a trust anchor. Release signatures cover the
//! canonical manifest bytes. Package signatures cover a domain-separated
//! message built from the package content hash and are checked by the
//! server-side audit.

use std::path::Path;

use ed25519_dalek::{Signature, Signer as _, SigningKey, Verifier as _, VerifyingKey};
use rand::rngs::OsRng;

use crate::error::{Error, Result};
use crate::hash::ContentHash;
use crate::manifest::Manifest;

const PACKAGE_DOMAIN: &[u8] = b"slotwise-package-v1:";

/// Pinned set of publisher public keys.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrustedKeys {
    keys: Vec<VerifyingKey>,
}

impl TrustedKeys {
    /// Build from hex-encoded Ed25519 public keys.
    ///
    /// # Errors
    ///
    /// Returns a validation error if any key is not 32 hex-encoded bytes or
    /// not a valid curve point.
    pub fn from_hex<S: AsRef<str>>(keys: &[S]) -> Result<Self> {
        let keys = keys
            .iter()
            .map(|k| parse_public_key(k.as_ref()))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { keys })
    }

    /// Build from already parsed keys.
    #[must_use]
    pub fn new(keys: Vec<VerifyingKey>) -> Self {
        Self { keys }
    }

    /// Whether no keys are pinned.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Number of pinned keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// Verify `signature_hex` over `message` against any pinned key.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SignatureInvalid`] if no key is pinned, the signature
    /// is malformed, or no pinned key accepts it.
    pub fn verify(&self, message: &[u8], signature_hex: &str) -> Result<()> {
        if self.keys.is_empty() {
            return Err(Error::signature("no trusted keys configured"));
        }
        let signature = parse_signature(signature_hex)?;
        if self
            .keys
            .iter()
            .any(|key| key.verify_strict(message, &signature).is_ok())
        {
            Ok(())
        } else {
            Err(Error::signature("no trusted key accepts the signature"))
        }
    }

    /// Verify a release signature and parse the manifest it covers.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SignatureInvalid`] if the signature does not verify
    /// or the signed bytes are not a canonical manifest.
    pub fn verify_manifest(&self, manifest_bytes: &[u8], signature_hex: &str) -> Result<Manifest> {
        self.verify(manifest_bytes, signature_hex)?;
        Manifest::from_canonical(manifest_bytes)
            .map_err(|e| Error::signature(format!("signed manifest rejected: {e}")))
    }

    /// Verify a package signature.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SignatureInvalid`] if the signature does not verify.
    pub fn verify_package(&self, content_hash: &ContentHash, signature_hex: &str) -> Result<()> {
        self.verify(&package_message(content_hash), signature_hex)
    }
}

/// Publisher signing key.
#[derive(Debug)]
pub struct ReleaseSigner {
    key: SigningKey,
}

impl ReleaseSigner {
    /// Generate a fresh key.
    #[must_use]
    pub fn generate() -> Self {
        Self {
            key: SigningKey::generate(&mut OsRng),
        }
    }

    /// Build from a 32-byte hex secret.
    ///
    /// # Errors
    ///
    /// Returns a validation error if the secret is malformed.
    pub fn from_hex(secret_hex: &str) -> Result<Self> {
        let mut secret = [0u8; 32];
        hex::decode_to_slice(secret_hex.trim(), &mut secret)
            .map_err(|e| Error::validation(format!("invalid signing key: {e}")))?;
        Ok(Self {
            key: SigningKey::from_bytes(&secret),
        })
    }

    /// Load a hex secret from a file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or is malformed.
    pub fn load(path: &Path) -> Result<Self> {
        Self::from_hex(&std::fs::read_to_string(path)?)
    }

    /// Hex secret, for writing key files.
    #[must_use]
    pub fn secret_hex(&self) -> String {
        hex::encode(self.key.to_bytes())
    }

    /// Hex public key to pin on devices.
    #[must_use]
    pub fn public_key_hex(&self) -> String {
        hex::encode(self.key.verifying_key().to_bytes())
    }

    /// Trust set containing only this signer's key.
    #[must_use]
    pub fn trusted_keys(&self) -> TrustedKeys {
        TrustedKeys::new(vec![self.key.verifying_key()])
    }

    /// Sign arbitrary bytes, returning a hex signature.
    #[must_use]
    pub fn sign(&self, message: &[u8]) -> String {
        hex::encode(self.key.sign(message).to_bytes())
    }

    /// Sign a package content hash.
    #[must_use]
    pub fn sign_package(&self, content_hash: &ContentHash) -> String {
        self.sign(&package_message(content_hash))
    }
}

fn package_message(content_hash: &ContentHash) -> Vec<u8> {
    let mut message = PACKAGE_DOMAIN.to_vec();
    message.extend_from_slice(content_hash.to_hex().as_bytes());
    message
}

fn parse_public_key(hex_key: &str) -> Result<VerifyingKey> {
    let mut bytes = [0u8; 32];
    hex::decode_to_slice(hex_key.trim(), &mut bytes)
        .map_err(|e| Error::validation(format!("invalid trusted key {hex_key}: {e}")))?;
    VerifyingKey::from_bytes(&bytes)
        .map_err(|e| Error::validation(format!("invalid trusted key {hex_key}: {e}")))
}

fn parse_signature(signature_hex: &str) -> Result<Signature> {
    let mut bytes = [0u8; 64];
    hex::decode_to_slice(signature_hex, &mut bytes)
        .map_err(|e| Error::signature(format!("malformed signature: {e}")))?;
    Ok(Signature::from_bytes(&bytes))
}
