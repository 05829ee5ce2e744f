//! WeChat Official Account message gateway.
//!
//! Inbound pushes are authenticated, optionally decrypted, parsed, matched
//! against prioritized handlers and answered with a passive reply, with any
//! extra replies delivered out-of-band through the platform API.

pub mod account;
pub mod config;
pub mod crypto;
pub mod gateway;
pub mod handler;
pub mod message;
pub mod pipeline;
pub mod platform;
pub mod registry;
pub mod reply;
pub mod security;

pub use account::{Account, EncodingMode};
pub use config::Config;
pub use pipeline::{CallbackQuery, Pipeline, PipelineResponse};
pub use registry::Registry;
