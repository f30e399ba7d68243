//! Signing key material and the process-wide key ring.
//!
//! # Purpose
//! Turn configured key material into ready-to-use jsonwebtoken keys, each
//! addressed by a stable id, and hand them out for signing and verification.
//!
//! # Key invariants
//! - Key ids are unique within a ring and a ring always holds at least one key.
//! - The public half of every key verifies signatures made by its private half;
//!   this is checked once when the key is loaded.
//! - A ring is immutable after construction. It is shared as `Arc<KeyRing>` and
//!   read concurrently without locks.
//!
//! # Security
//! - Private material never leaves this module except as opaque
//!   `jsonwebtoken::EncodingKey` values, and `Debug` output omits it.
//! - Symmetric keys are usable for signing but never published.
use crate::errors::{TokenError, TokenResult};
use ed25519_dalek::pkcs8::{DecodePrivateKey, DecodePublicKey};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey};
use rand::Rng;
use rsa::pkcs1::DecodeRsaPublicKey;
use rsa::traits::PublicKeyParts;
use std::collections::HashSet;

const SELF_TEST_MESSAGE: &[u8] = b"iam-key-pair-self-test";
const MIN_SHARED_SECRET_LEN: usize = 32;

/// Secret part of a configured key, as read from configuration.
#[derive(Clone)]
pub enum KeySecret {
    /// PEM-encoded private key (PKCS#1 or PKCS#8) and public key (PKCS#1 or SPKI).
    Pem {
        private_key_pem: Vec<u8>,
        public_key_pem: Vec<u8>,
    },
    /// Shared secret for HMAC algorithms.
    Shared(Vec<u8>),
}

/// One configured key before parsing.
#[derive(Clone)]
pub struct KeyMaterial {
    pub id: String,
    pub algorithm: Algorithm,
    pub secret: KeySecret,
}

impl std::fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyMaterial")
            .field("id", &self.id)
            .field("algorithm", &self.algorithm)
            .finish_non_exhaustive()
    }
}

/// Public half of a signing key in the form needed for key-set publication.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublicKey {
    /// Big-endian RSA modulus and exponent.
    Rsa { n: Vec<u8>, e: Vec<u8> },
    /// Raw 32-byte Ed25519 public key.
    Ed25519([u8; 32]),
    /// HMAC secret; there is no public half.
    Shared,
}

/// A parsed, validated signing key.
#[derive(Clone)]
pub struct SigningKey {
    id: String,
    algorithm: Algorithm,
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    public_key: PublicKey,
}

impl std::fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SigningKey")
            .field("id", &self.id)
            .field("algorithm", &self.algorithm)
            .finish_non_exhaustive()
    }
}

impl SigningKey {
    /// Parse key material and check that its two halves belong together.
    ///
    /// # Errors
    /// - `TokenError::Configuration` for an empty id, unsupported algorithm,
    ///   unparseable PEM, a short shared secret, or mismatched key halves.
    pub fn from_material(material: KeyMaterial) -> TokenResult<Self> {
        let KeyMaterial {
            id,
            algorithm,
            secret,
        } = material;
        if id.trim().is_empty() {
            return Err(TokenError::Configuration("key id must not be empty".into()));
        }
        let config_err =
            |what: &str, err: &dyn std::fmt::Display| TokenError::Configuration(format!("key {id}: {what}: {err}"));

        let (encoding_key, decoding_key, public_key) = match (family(algorithm), secret) {
            (Some(KeyFamily::Rsa), KeySecret::Pem {
                private_key_pem,
                public_key_pem,
            }) => {
                let encoding_key = EncodingKey::from_rsa_pem(&private_key_pem)
                    .map_err(|err| config_err("parse RSA private key", &err))?;
                let decoding_key = DecodingKey::from_rsa_pem(&public_key_pem)
                    .map_err(|err| config_err("parse RSA public key", &err))?;
                let public_key = rsa_components(&public_key_pem)
                    .map_err(|err| config_err("read RSA public components", &err))?;
                (encoding_key, decoding_key, public_key)
            }
            (Some(KeyFamily::Ed25519), KeySecret::Pem {
                private_key_pem,
                public_key_pem,
            }) => {
                let encoding_key = EncodingKey::from_ed_pem(&private_key_pem)
                    .map_err(|err| config_err("parse Ed25519 private key", &err))?;
                let decoding_key = DecodingKey::from_ed_pem(&public_key_pem)
                    .map_err(|err| config_err("parse Ed25519 public key", &err))?;
                let public = ed25519_public(&private_key_pem, &public_key_pem)
                    .map_err(|err| config_err("read Ed25519 key pair", &err))?;
                (encoding_key, decoding_key, PublicKey::Ed25519(public))
            }
            (Some(KeyFamily::Hmac), KeySecret::Shared(secret)) => {
                if secret.len() < MIN_SHARED_SECRET_LEN {
                    return Err(TokenError::Configuration(format!(
                        "key {id}: shared secret must be at least {MIN_SHARED_SECRET_LEN} bytes"
                    )));
                }
                (
                    EncodingKey::from_secret(&secret),
                    DecodingKey::from_secret(&secret),
                    PublicKey::Shared,
                )
            }
            (Some(_), _) => {
                return Err(TokenError::Configuration(format!(
                    "key {id}: material does not match algorithm {algorithm:?}"
                )));
            }
            (None, _) => {
                return Err(TokenError::Configuration(format!(
                    "key {id}: unsupported algorithm {algorithm:?}"
                )));
            }
        };

        let key = Self {
            id,
            algorithm,
            encoding_key,
            decoding_key,
            public_key,
        };
        key.check_pair()?;
        Ok(key)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public_key
    }

    pub(crate) fn encoding_key(&self) -> &EncodingKey {
        &self.encoding_key
    }

    pub(crate) fn decoding_key(&self) -> &DecodingKey {
        &self.decoding_key
    }

    // Sign a fixed message with the private half and verify it with the public
    // half so a mismatched PEM pair fails at startup instead of per request.
    fn check_pair(&self) -> TokenResult<()> {
        let signature = jsonwebtoken::crypto::sign(SELF_TEST_MESSAGE, &self.encoding_key, self.algorithm)
            .map_err(|err| {
                TokenError::Configuration(format!("key {}: self-test signature failed: {err}", self.id))
            })?;
        let verified = jsonwebtoken::crypto::verify(
            &signature,
            SELF_TEST_MESSAGE,
            &self.decoding_key,
            self.algorithm,
        )
        .unwrap_or(false);
        if !verified {
            return Err(TokenError::Configuration(format!(
                "key {}: public key does not match private key",
                self.id
            )));
        }
        Ok(())
    }
}

/// The set of signing keys available to the service.
#[derive(Debug, Clone)]
pub struct KeyRing {
    keys: Vec<SigningKey>,
}

impl KeyRing {
    /// Build a ring from already parsed keys.
    ///
    /// # Errors
    /// - `TokenError::Configuration` when `keys` is empty or ids repeat.
    pub fn new(keys: Vec<SigningKey>) -> TokenResult<Self> {
        if keys.is_empty() {
            return Err(TokenError::Configuration(
                "at least one signing key must be configured".into(),
            ));
        }
        let mut seen = HashSet::with_capacity(keys.len());
        for key in &keys {
            if !seen.insert(key.id.as_str()) {
                return Err(TokenError::Configuration(format!(
                    "duplicate signing key id: {}",
                    key.id
                )));
            }
        }
        Ok(Self { keys })
    }

    /// Parse every piece of material and build a ring from the result.
    pub fn from_material(material: Vec<KeyMaterial>) -> TokenResult<Self> {
        let keys = material
            .into_iter()
            .map(SigningKey::from_material)
            .collect::<TokenResult<Vec<_>>>()?;
        Self::new(keys)
    }

    /// Pick the key for the next signature, uniformly at random.
    ///
    /// Every configured key signs a share of tokens, so verification against
    /// all of them is exercised continuously rather than only after rotation.
    pub fn select_signing_key(&self) -> TokenResult<&SigningKey> {
        if self.keys.is_empty() {
            return Err(TokenError::Configuration("key ring is empty".into()));
        }
        let index = rand::thread_rng().gen_range(0..self.keys.len());
        Ok(&self.keys[index])
    }

    /// Exact-match lookup by key id.
    pub fn resolve_key(&self, id: &str) -> Option<&SigningKey> {
        self.keys.iter().find(|key| key.id == id)
    }

    /// All keys in configuration order.
    pub fn all_keys(&self) -> impl Iterator<Item = &SigningKey> {
        self.keys.iter()
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KeyFamily {
    Rsa,
    Ed25519,
    Hmac,
}

fn family(algorithm: Algorithm) -> Option<KeyFamily> {
    match algorithm {
        Algorithm::RS256
        | Algorithm::RS384
        | Algorithm::RS512
        | Algorithm::PS256
        | Algorithm::PS384
        | Algorithm::PS512 => Some(KeyFamily::Rsa),
        Algorithm::EdDSA => Some(KeyFamily::Ed25519),
        Algorithm::HS256 | Algorithm::HS384 | Algorithm::HS512 => Some(KeyFamily::Hmac),
        // ECDSA keys are not loaded from configuration.
        Algorithm::ES256 | Algorithm::ES384 => None,
    }
}

fn rsa_components(public_key_pem: &[u8]) -> Result<PublicKey, String> {
    let pem = std::str::from_utf8(public_key_pem).map_err(|err| err.to_string())?;
    let public = match rsa::RsaPublicKey::from_pkcs1_pem(pem) {
        Ok(key) => key,
        Err(_) => {
            <rsa::RsaPublicKey as rsa::pkcs8::DecodePublicKey>::from_public_key_pem(pem)
                .map_err(|err| err.to_string())?
        }
    };
    Ok(PublicKey::Rsa {
        n: public.n().to_bytes_be(),
        e: public.e().to_bytes_be(),
    })
}

fn ed25519_public(private_key_pem: &[u8], public_key_pem: &[u8]) -> Result<[u8; 32], String> {
    let private_pem = std::str::from_utf8(private_key_pem).map_err(|err| err.to_string())?;
    let public_pem = std::str::from_utf8(public_key_pem).map_err(|err| err.to_string())?;
    let signing_key =
        ed25519_dalek::SigningKey::from_pkcs8_pem(private_pem).map_err(|err| err.to_string())?;
    let verifying_key = ed25519_dalek::VerifyingKey::from_public_key_pem(public_pem)
        .map_err(|err| err.to_string())?;
    // Same check as the signature self-test, but cheap and with a clearer message.
    if signing_key.verifying_key() != verifying_key {
        return Err("Ed25519 public key does not match private key".to_string());
    }
    Ok(verifying_key.to_bytes())
}
