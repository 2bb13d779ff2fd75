//! # Bearer Token Validation
//!
//! Tokens are validated locally against key material the gateway already holds:
//! an HMAC secret, PEM public keys loaded at startup, and a JSON Web Key Set that is
//! fetched from the identity provider and refreshed in the background. Nothing is
//! fetched per request.
//!
//! ## Validation rules
//! - the header `alg` must be in the configured allow-list
//! - keys are selected by `kid` when the header has one, otherwise every key of the
//!   algorithm's family is tried
//! - issuer, audience (only when configured) and `exp`/`nbf` with leeway are checked
//! - an expired token with a good signature is [`TokenError::Expired`]; every other
//!   failure is [`TokenError::Invalid`], whose reason is for logs only

use arc_swap::ArcSwap;
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::jwk::{AlgorithmParameters, JwkSet};
use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, Header, Validation};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::core::config::AuthConfig;
use crate::core::error::{GatewayError, GatewayResult};
use crate::core::types::AuthenticatedPrincipal;

/// Why a presented token was rejected
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TokenError {
    #[error("token expired")]
    Expired,

    #[error("token invalid: {0}")]
    Invalid(String),
}

impl From<TokenError> for GatewayError {
    fn from(err: TokenError) -> Self {
        match err {
            TokenError::Expired => GatewayError::TokenExpired,
            TokenError::Invalid(reason) => GatewayError::token_invalid(reason),
        }
    }
}

/// Key type an algorithm needs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyFamily {
    Hmac,
    Rsa,
    Ec,
    Ed,
}

impl KeyFamily {
    pub fn of(algorithm: Algorithm) -> Self {
        match algorithm {
            Algorithm::HS256 | Algorithm::HS384 | Algorithm::HS512 => Self::Hmac,
            Algorithm::RS256
            | Algorithm::RS384
            | Algorithm::RS512
            | Algorithm::PS256
            | Algorithm::PS384
            | Algorithm::PS512 => Self::Rsa,
            Algorithm::ES256 | Algorithm::ES384 => Self::Ec,
            Algorithm::EdDSA => Self::Ed,
        }
    }
}

/// A key usable for signature verification
#[derive(Clone)]
pub struct VerificationKey {
    pub kid: Option<String>,
    pub family: KeyFamily,
    key: DecodingKey,
}

impl fmt::Debug for VerificationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VerificationKey")
            .field("kid", &self.kid)
            .field("family", &self.family)
            .finish_non_exhaustive()
    }
}

/// Collection of verification keys
#[derive(Debug, Clone, Default)]
pub struct KeySet {
    keys: Vec<VerificationKey>,
}

impl KeySet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Add a shared HMAC secret
    pub fn add_secret(&mut self, secret: &[u8]) {
        self.keys.push(VerificationKey {
            kid: None,
            family: KeyFamily::Hmac,
            key: DecodingKey::from_secret(secret),
        });
    }

    /// Add a PEM encoded RSA, EC or Ed25519 public key
    pub fn add_pem(&mut self, pem: &[u8]) -> GatewayResult<()> {
        let (family, key) = if let Ok(key) = DecodingKey::from_rsa_pem(pem) {
            (KeyFamily::Rsa, key)
        } else if let Ok(key) = DecodingKey::from_ec_pem(pem) {
            (KeyFamily::Ec, key)
        } else if let Ok(key) = DecodingKey::from_ed_pem(pem) {
            (KeyFamily::Ed, key)
        } else {
            return Err(GatewayError::config("Unsupported or malformed PEM public key"));
        };
        self.keys.push(VerificationKey {
            kid: None,
            family,
            key,
        });
        Ok(())
    }

    /// Build from a JWKS document, skipping keys that cannot be used
    pub fn from_jwks(jwks: &JwkSet) -> Self {
        let mut set = Self::new();
        for jwk in &jwks.keys {
            let family = match &jwk.algorithm {
                AlgorithmParameters::RSA(_) => KeyFamily::Rsa,
                AlgorithmParameters::EllipticCurve(_) => KeyFamily::Ec,
                AlgorithmParameters::OctetKeyPair(_) => KeyFamily::Ed,
                AlgorithmParameters::OctetKey(_) => KeyFamily::Hmac,
            };
            match DecodingKey::from_jwk(jwk) {
                Ok(key) => set.keys.push(VerificationKey {
                    kid: jwk.common.key_id.clone(),
                    family,
                    key,
                }),
                Err(e) => warn!(kid = ?jwk.common.key_id, error = %e, "Skipping unusable JWK"),
            }
        }
        set
    }

    /// Keys that may have signed a token with this header
    fn candidates<'a>(
        &'a self,
        header: &'a Header,
    ) -> impl Iterator<Item = &'a VerificationKey> + 'a {
        let family = KeyFamily::of(header.alg);
        self.keys.iter().filter(move |key| {
            key.family == family
                && match (&header.kid, &key.kid) {
                    (Some(wanted), Some(kid)) => wanted == kid,
                    (Some(_), None) => true,
                    (None, _) => true,
                }
        })
    }
}

/// Validates bearer tokens and turns their claims into a principal
#[derive(Debug)]
pub struct TokenValidator {
    static_keys: KeySet,
    jwks: ArcSwap<KeySet>,
    jwks_url: Option<String>,
    client: reqwest::Client,
    allowed_algorithms: Vec<Algorithm>,
    issuer: Option<String>,
    audience: Vec<String>,
    leeway: Duration,
}

impl TokenValidator {
    /// Build a validator with the given static keys; no JWKS is fetched
    pub fn new(static_keys: KeySet, config: &AuthConfig) -> Self {
        Self {
            static_keys,
            jwks: ArcSwap::from_pointee(KeySet::new()),
            jwks_url: config.jwks_url.clone(),
            client: reqwest::Client::new(),
            allowed_algorithms: config.allowed_algorithms.clone(),
            issuer: config.issuer.clone(),
            audience: config.audience.clone(),
            leeway: config.leeway,
        }
    }

    /// Load every configured key source
    ///
    /// An unreachable JWKS endpoint is logged and retried by the refresh task rather
    /// than failing startup.
    pub async fn from_config(config: &AuthConfig) -> GatewayResult<Self> {
        let mut keys = KeySet::new();
        if let Some(ref secret) = config.hmac_secret {
            keys.add_secret(secret.as_bytes());
        }
        for path in &config.public_key_files {
            let pem = tokio::fs::read(path).await.map_err(|e| {
                GatewayError::config(format!("Failed to read public key {}: {}", path.display(), e))
            })?;
            keys.add_pem(&pem)?;
        }

        let validator = Self::new(keys, config);
        if validator.jwks_url.is_some() {
            if let Err(e) = validator.refresh_jwks().await {
                warn!(error = %e, "Initial JWKS fetch failed");
            }
        }
        Ok(validator)
    }

    /// Re-fetch the JWKS and swap it in; returns the number of usable keys
    pub async fn refresh_jwks(&self) -> GatewayResult<usize> {
        let Some(ref url) = self.jwks_url else {
            return Ok(0);
        };

        let jwks: JwkSet = self
            .client
            .get(url)
            .send()
            .await
            .and_then(|response| response.error_for_status())
            .map_err(|e| GatewayError::internal(format!("JWKS request failed: {}", e)))?
            .json()
            .await
            .map_err(|e| GatewayError::internal(format!("Invalid JWKS document: {}", e)))?;

        let set = KeySet::from_jwks(&jwks);
        let count = set.len();
        self.jwks.store(Arc::new(set));
        info!(keys = count, "JWKS refreshed");
        Ok(count)
    }

    /// Periodically refresh the JWKS; `None` when no JWKS is configured
    pub fn spawn_jwks_refresh(self: Arc<Self>, interval: Duration) -> Option<JoinHandle<()>> {
        self.jwks_url.as_ref()?;
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(e) = self.refresh_jwks().await {
                    warn!(error = %e, "JWKS refresh failed, keeping previous keys");
                }
            }
        }))
    }

    /// Verify the token and extract the principal
    pub fn validate(&self, token: &str) -> Result<AuthenticatedPrincipal, TokenError> {
        let header =
            decode_header(token).map_err(|e| TokenError::Invalid(format!("malformed header: {}", e)))?;

        if !self.allowed_algorithms.contains(&header.alg) {
            return Err(TokenError::Invalid(format!(
                "algorithm {:?} not allowed",
                header.alg
            )));
        }

        let validation = self.validation_for(header.alg);
        let jwks = self.jwks.load();
        let mut last_error = None;

        for key in self.static_keys.candidates(&header).chain(jwks.candidates(&header)) {
            match decode::<serde_json::Value>(token, &key.key, &validation) {
                Ok(data) => return Ok(principal_from_claims(data.claims)),
                Err(e) => match e.kind() {
                    ErrorKind::ExpiredSignature => return Err(TokenError::Expired),
                    ErrorKind::InvalidSignature => last_error = Some(e.to_string()),
                    _ => return Err(TokenError::Invalid(e.to_string())),
                },
            }
        }

        let reason = last_error.unwrap_or_else(|| "no key matches token".to_string());
        debug!(reason = %reason, kid = ?header.kid, "Token rejected");
        Err(TokenError::Invalid(reason))
    }

    fn validation_for(&self, algorithm: Algorithm) -> Validation {
        let mut validation = Validation::new(algorithm);
        validation.leeway = self.leeway.as_secs();
        validation.validate_nbf = true;
        if let Some(ref issuer) = self.issuer {
            validation.set_issuer(&[issuer]);
        }
        if self.audience.is_empty() {
            validation.validate_aud = false;
        } else {
            validation.set_audience(&self.audience);
        }
        validation
    }
}

fn string_claim(claims: &serde_json::Value, name: &str) -> Option<String> {
    claims.get(name).and_then(|v| v.as_str()).map(str::to_string)
}

fn principal_from_claims(claims: serde_json::Value) -> AuthenticatedPrincipal {
    AuthenticatedPrincipal {
        subject: string_claim(&claims, "sub"),
        issuer: string_claim(&claims, "iss"),
        authorized_party: string_claim(&claims, "azp"),
        client_id: string_claim(&claims, "clientId"),
        claims,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey};
    use serde_json::json;

    const SECRET: &str = "unit-test-secret-unit-test-secret";

    fn config() -> AuthConfig {
        AuthConfig {
            hmac_secret: Some(SECRET.to_string()),
            allowed_algorithms: vec![Algorithm::HS256],
            leeway: Duration::from_secs(5),
            ..AuthConfig::default()
        }
    }

    fn validator(config: &AuthConfig) -> TokenValidator {
        let mut keys = KeySet::new();
        keys.add_secret(SECRET.as_bytes());
        TokenValidator::new(keys, config)
    }

    fn now() -> i64 {
        chrono::Utc::now().timestamp()
    }

    fn sign(alg: Algorithm, secret: &str, claims: serde_json::Value) -> String {
        encode(
            &Header::new(alg),
            &claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    #[test]
    fn test_valid_token_yields_principal() {
        let token = sign(
            Algorithm::HS256,
            SECRET,
            json!({"sub": "user-1", "azp": "mobile-app", "exp": now() + 600}),
        );
        let principal = validator(&config()).validate(&token).unwrap();
        assert_eq!(principal.subject.as_deref(), Some("user-1"));
        assert_eq!(principal.authorized_party.as_deref(), Some("mobile-app"));
        assert!(principal.client_id.is_none());
    }

    #[test]
    fn test_expired_token_is_classified() {
        let token = sign(Algorithm::HS256, SECRET, json!({"sub": "u", "exp": now() - 3600}));
        assert!(matches!(
            validator(&config()).validate(&token),
            Err(TokenError::Expired)
        ));
    }

    #[test]
    fn test_wrong_signature_is_invalid() {
        let token = sign(
            Algorithm::HS256,
            "some-other-secret-some-other-secret",
            json!({"exp": now() + 600}),
        );
        assert!(matches!(
            validator(&config()).validate(&token),
            Err(TokenError::Invalid(_))
        ));
    }

    #[test]
    fn test_expired_token_with_wrong_signature_is_invalid() {
        let token = sign(
            Algorithm::HS256,
            "some-other-secret-some-other-secret",
            json!({"exp": now() - 3600}),
        );
        assert!(matches!(
            validator(&config()).validate(&token),
            Err(TokenError::Invalid(_))
        ));
    }

    #[test]
    fn test_disallowed_algorithm_is_invalid() {
        let token = sign(Algorithm::HS384, SECRET, json!({"exp": now() + 600}));
        assert!(matches!(
            validator(&config()).validate(&token),
            Err(TokenError::Invalid(_))
        ));
    }

    #[test]
    fn test_garbage_is_invalid() {
        assert!(matches!(
            validator(&config()).validate("not.a.jwt"),
            Err(TokenError::Invalid(_))
        ));
    }

    #[test]
    fn test_issuer_and_audience_are_enforced() {
        let mut cfg = config();
        cfg.issuer = Some("https://idp.example.com".to_string());
        cfg.audience = vec!["gateway".to_string()];
        let v = validator(&cfg);

        let good = sign(
            Algorithm::HS256,
            SECRET,
            json!({"iss": "https://idp.example.com", "aud": "gateway", "exp": now() + 600}),
        );
        assert!(v.validate(&good).is_ok());

        let wrong_iss = sign(
            Algorithm::HS256,
            SECRET,
            json!({"iss": "https://evil.example.com", "aud": "gateway", "exp": now() + 600}),
        );
        assert!(matches!(v.validate(&wrong_iss), Err(TokenError::Invalid(_))));

        let wrong_aud = sign(
            Algorithm::HS256,
            SECRET,
            json!({"iss": "https://idp.example.com", "aud": "billing", "exp": now() + 600}),
        );
        assert!(matches!(v.validate(&wrong_aud), Err(TokenError::Invalid(_))));
    }

    #[test]
    fn test_audience_claim_ignored_when_not_configured() {
        let token = sign(Algorithm::HS256, SECRET, json!({"aud": "anything", "exp": now() + 600}));
        assert!(validator(&config()).validate(&token).is_ok());
    }

    #[test]
    fn test_token_error_maps_to_gateway_error() {
        assert!(matches!(
            GatewayError::from(TokenError::Expired),
            GatewayError::TokenExpired
        ));
        assert!(matches!(
            GatewayError::from(TokenError::Invalid("x".into())),
            GatewayError::TokenInvalid { .. }
        ));
    }

    #[test]
    fn test_malformed_pem_is_rejected() {
        let mut keys = KeySet::new();
        assert!(keys.add_pem(b"-----BEGIN PUBLIC KEY-----\nnope\n-----END PUBLIC KEY-----").is_err());
        assert!(keys.is_empty());
    }

    #[tokio::test]
    async fn test_jwks_keys_are_selected_by_kid() {
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        const JWKS_SECRET: &str = "jwks-hmac-secret-for-gateway-tests!!";
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/.well-known/jwks.json"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "keys": [{
                    "kty": "oct",
                    "kid": "k1",
                    "alg": "HS256",
                    "k": "andrcy1obWFjLXNlY3JldC1mb3ItZ2F0ZXdheS10ZXN0cyEh"
                }]
            })))
            .mount(&server)
            .await;

        let cfg = AuthConfig {
            hmac_secret: None,
            jwks_url: Some(format!("{}/.well-known/jwks.json", server.uri())),
            allowed_algorithms: vec![Algorithm::HS256],
            ..AuthConfig::default()
        };
        let v = TokenValidator::from_config(&cfg).await.unwrap();

        let mut header = Header::new(Algorithm::HS256);
        header.kid = Some("k1".to_string());
        let token = encode(
            &header,
            &json!({"clientId": "partner", "exp": now() + 600}),
            &EncodingKey::from_secret(JWKS_SECRET.as_bytes()),
        )
        .unwrap();
        let principal = v.validate(&token).unwrap();
        assert_eq!(principal.client_id.as_deref(), Some("partner"));

        header.kid = Some("unknown".to_string());
        let token = encode(
            &header,
            &json!({"exp": now() + 600}),
            &EncodingKey::from_secret(JWKS_SECRET.as_bytes()),
        )
        .unwrap();
        assert!(matches!(v.validate(&token), Err(TokenError::Invalid(_))));
    }
}
