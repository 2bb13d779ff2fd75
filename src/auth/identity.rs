//! # Identity Resolution
//!
//! Small, pure helpers that decide who is calling: the correlation id, the client
//! address used for rate-limit scoping, the bearer token, and the consumer id.
//!
//! ## Consumer id precedence
//! 1. JWT `azp`, falling back to `clientId`; `unknown`, blank or whitespace values
//!    count as absent
//! 2. `X-Consumer-ID` header, only if non-blank after trimming, at most 64 characters
//!    and made of `[A-Za-z0-9_.-]`
//! 3. the literal `anonymous`

use axum::http::HeaderMap;
use regex::Regex;
use std::net::SocketAddr;
use std::sync::OnceLock;
use uuid::Uuid;

use crate::core::types::{AuthenticatedPrincipal, CONSUMER_ID_HEADER, CORRELATION_ID_HEADER};

/// Consumer id used when nothing better is known
pub const ANONYMOUS_CONSUMER: &str = "anonymous";

/// Longest accepted `X-Consumer-ID`
pub const MAX_CONSUMER_ID_LEN: usize = 64;

const FORWARDED_FOR_HEADER: &str = "x-forwarded-for";
const REAL_IP_HEADER: &str = "x-real-ip";

fn consumer_id_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[A-Za-z0-9_.\-]+$").expect("consumer id pattern is valid"))
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

/// Client-supplied correlation id, or a fresh UUID v4 when absent or blank
///
/// A supplied value is used verbatim.
pub fn resolve_correlation_id(headers: &HeaderMap) -> String {
    match header_str(headers, CORRELATION_ID_HEADER) {
        Some(value) if !value.trim().is_empty() => value.to_string(),
        _ => Uuid::new_v4().to_string(),
    }
}

/// First `X-Forwarded-For` entry, then `X-Real-IP`, then the TCP peer
pub fn resolve_client_ip(headers: &HeaderMap, peer: SocketAddr) -> String {
    if let Some(first) = header_str(headers, FORWARDED_FOR_HEADER)
        .and_then(|value| value.split(',').next())
        .map(str::trim)
        .filter(|ip| !ip.is_empty())
    {
        return first.to_string();
    }

    if let Some(real_ip) = header_str(headers, REAL_IP_HEADER)
        .map(str::trim)
        .filter(|ip| !ip.is_empty())
    {
        return real_ip.to_string();
    }

    peer.ip().to_string()
}

/// Token from `Authorization: Bearer <token>`; scheme match is case-insensitive
pub fn extract_bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = header_str(headers, axum::http::header::AUTHORIZATION.as_str())?.trim();
    let (scheme, token) = value.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    (!token.is_empty()).then_some(token)
}

fn usable_claim(value: Option<&str>) -> Option<&str> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty() && !v.eq_ignore_ascii_case("unknown"))
}

/// Consumer id asserted by the token, if any
pub fn consumer_from_principal(principal: &AuthenticatedPrincipal) -> Option<String> {
    usable_claim(principal.authorized_party.as_deref())
        .or_else(|| usable_claim(principal.client_id.as_deref()))
        .map(str::to_string)
}

/// Validated `X-Consumer-ID` value
pub fn consumer_from_header(headers: &HeaderMap) -> Option<String> {
    let value = header_str(headers, CONSUMER_ID_HEADER)?.trim();
    if value.is_empty() || value.chars().count() > MAX_CONSUMER_ID_LEN {
        return None;
    }
    consumer_id_pattern()
        .is_match(value)
        .then(|| value.to_string())
}

/// Apply the full precedence chain
pub fn resolve_consumer_id(principal: Option<&AuthenticatedPrincipal>, headers: &HeaderMap) -> String {
    principal
        .and_then(consumer_from_principal)
        .or_else(|| consumer_from_header(headers))
        .unwrap_or_else(|| ANONYMOUS_CONSUMER.to_string())
}
