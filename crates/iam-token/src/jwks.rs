use crate::keys::{KeyRing, PublicKey, SigningKey};
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use jsonwebtoken::Algorithm;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum KeyUse {
    Sig,
}

/// One published verification key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct Jwk {
    pub kty: String,
    pub kid: String,
    pub alg: String,
    #[serde(rename = "use")]
    pub use_field: KeyUse,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub n: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub e: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crv: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub x: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct Jwks {
    pub keys: Vec<Jwk>,
}

impl Jwks {
    /// Public halves of every asymmetric key in the ring, in ring order.
    /// Shared-secret keys are skipped.
    pub fn from_ring(ring: &KeyRing) -> Self {
        Self {
            keys: ring.all_keys().filter_map(Jwk::from_signing_key).collect(),
        }
    }
}

impl Jwk {
    pub fn from_signing_key(key: &SigningKey) -> Option<Self> {
        let alg = algorithm_name(key.algorithm());
        match key.public_key() {
            PublicKey::Rsa { n, e } => Some(Self {
                kty: "RSA".to_string(),
                kid: key.id().to_string(),
                alg,
                use_field: KeyUse::Sig,
                n: Some(URL_SAFE_NO_PAD.encode(n)),
                e: Some(URL_SAFE_NO_PAD.encode(e)),
                crv: None,
                x: None,
            }),
            PublicKey::Ed25519(bytes) => Some(Self {
                kty: "OKP".to_string(),
                kid: key.id().to_string(),
                alg,
                use_field: KeyUse::Sig,
                n: None,
                e: None,
                crv: Some("Ed25519".to_string()),
                x: Some(URL_SAFE_NO_PAD.encode(bytes)),
            }),
            PublicKey::Shared => None,
        }
    }
}

fn algorithm_name(algorithm: Algorithm) -> String {
    // Debug output of jsonwebtoken's Algorithm is the JOSE name.
    format!("{algorithm:?}")
}
