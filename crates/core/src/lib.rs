//! Domain layer for the IM webhook gateway.
//!
//! Everything in this crate is pure: channel resolution, signature
//! verification, payload normalization, and idempotency key derivation
//! perform no I/O and hold no state, so the whole pipeline core is
//! testable without a server or a KV store.

pub mod normalizer;
pub mod types;
pub mod verifier;
