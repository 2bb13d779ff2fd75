//! # Authentication Module
//!
//! Bearer-token validation against locally held key material, and the identity
//! helpers that resolve correlation id, client address and consumer id.

pub mod identity;
pub mod jwt;

pub use identity::{resolve_client_ip, resolve_consumer_id, resolve_correlation_id, ANONYMOUS_CONSUMER};
pub use jwt::{KeySet, TokenError, TokenValidator};
