//! Automatic certificate management over ACME HTTP-01.
//!
//! - [`CertCache`]: storage for the ACME account and issued certificates
//! - [`ChallengeResponder`]: answers HTTP-01 challenges on the challenge listener
//! - [`CertManager`]: obtains, caches, renews and serves the certificate for one domain

pub mod cache;
pub mod challenge;
pub mod manager;

pub use cache::{CertCache, DirCache, MemoryCache};
pub use challenge::ChallengeResponder;
pub use manager::CertManager;
