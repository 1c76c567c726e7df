//! tcp-core: asynchronous TCP session engine
//!
//! - [`runtime`]: sessions, packet framing, pooled buffers, services
//! - [`transfer`]: chunked file transfer over packet sessions
//! - [`protocols`]: chat and stress handlers used by the binary
//! - [`config`]: CLI and TOML configuration

pub mod config;
pub mod protocols;
pub mod runtime;
pub mod transfer;
