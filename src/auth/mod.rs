//! Credential checks: administrator JWTs (via JWKS) and shared secrets.

pub mod jwks;
mod jwt;
mod secret;

pub use jwks::{HttpKeySet, JwksCache, KeySetSource, StaticKeySet};
pub use jwt::{Claims, TokenVerifier};
pub use secret::SharedSecret;

#[cfg(test)]
pub(crate) use jwt::test_support;
