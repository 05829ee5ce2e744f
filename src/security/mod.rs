//! Inbound request authentication: callback signatures, timestamp window and
//! replay protection.

pub mod replay;
pub mod signature;

pub use replay::{MemoryReplayCache, ReplayCache};
pub use signature::{compute_signature, CallbackParams, SignatureVerifier, VerifyError};
