//! Authentication: password hashing, login, token verification and the
//! published key set.
pub mod issuer;
pub mod jwks;
pub mod password;
pub mod verifier;
