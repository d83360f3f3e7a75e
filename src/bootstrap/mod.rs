//! Bootstrap layer — modules that run before any group is built.
//!
//! - **identity** — node secret loading and key derivation.
//! - **logger** — tracing-subscriber initialisation.

pub mod identity;
pub mod logger;
