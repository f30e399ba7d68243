//! Session-token primitives for the IAM service.
//!
//! # Purpose
//! Holds the signing key ring, the session claim set, the codec that turns
//! claims into signed bearer tokens and back, and the published key set.
//!
//! # How it fits
//! The service issues tokens at login with [`KeyRing::select_signing_key`] and
//! [`TokenCodec::encode`], verifies them on protected routes with
//! [`TokenCodec::decode`], and serves [`Jwks::from_ring`] so other services can
//! verify tokens without calling back.
//!
//! # Key invariants
//! - Key ids are unique and a ring is never empty.
//! - Any key may sign; every key must verify its own signatures.
//! - Expiry is checked to the second with no leeway.
//!
//! # Examples
//! ```rust
//! use chrono::{Duration, Utc};
//! use iam_token::{Algorithm, KeyLookup, KeyMaterial, KeyRing, KeySecret, SessionClaims, SessionSubject, TokenCodec};
//!
//! let ring = KeyRing::from_material(vec![KeyMaterial {
//!     id: "k1".to_string(),
//!     algorithm: Algorithm::HS256,
//!     secret: KeySecret::Shared(vec![7u8; 32]),
//! }])
//! .unwrap();
//! let codec = TokenCodec::new("iam", "clients", KeyLookup::HeaderAddressed);
//! let now = Utc::now();
//! let claims = SessionClaims::for_session(
//!     SessionSubject {
//!         session_id: "s1".into(),
//!         user_id: "u1".into(),
//!         username: "alice".into(),
//!         display_name: "Alice".into(),
//!     },
//!     "iam",
//!     "clients",
//!     now,
//!     now + Duration::hours(1),
//! )
//! .unwrap();
//! let token = codec.encode(&claims, ring.select_signing_key().unwrap()).unwrap();
//! assert_eq!(codec.decode(&token, &ring).unwrap().user_id, "u1");
//! ```

mod claims;
mod codec;
mod errors;
mod jwks;
mod keys;
#[cfg(any(test, feature = "testutil"))]
pub mod testutil;

pub use claims::{SessionClaims, SessionSubject};
pub use codec::{KeyLookup, TokenCodec};
pub use errors::{TokenError, TokenResult};
pub use jsonwebtoken::Algorithm;
pub use jwks::{Jwk, Jwks, KeyUse};
pub use keys::{KeyMaterial, KeyRing, KeySecret, PublicKey, SigningKey};
