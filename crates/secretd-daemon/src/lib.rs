//! # secretd-daemon
//!
//! The agent server: the secretd HTTP surface over a Unix-domain socket,
//! with peer-credential authentication, role-based authorization, and
//! per-principal rate limiting in front of the lifecycle controller.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod identity;
pub mod responses;
pub mod server;

pub use identity::{local_principal, resolve_identity, PeerCreds};
pub use server::{router, serve, ServerConfig};
