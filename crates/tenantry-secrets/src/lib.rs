//! tenantry-secrets — protection of per-tenant credentials.
//!
//! - **`cipher`**: authenticated encryption of credentials at rest, keyed
//!   by a single process-wide key loaded at startup.
//! - **`compare`**: constant-time comparison for shared passwords and
//!   service-to-service tokens.

pub mod cipher;
pub mod compare;

pub use cipher::{CipherError, SecretCipher};
pub use compare::secrets_match;
