//! Single-use nonces for wallet authorization.
//!
//! A nonce is handed to the client and, in parallel, stored in a secure
//! session cookie. At completion time the value echoed by the client is
//! compared with the cookie value; the nonce is spent by that comparison
//! whatever its outcome.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use subtle::ConstantTimeEq;
use uuid::Uuid;

use crate::AicurateError;

/// Name of the session cookie holding the issued nonce.
pub const NONCE_COOKIE: &str = "siwe";

/// How long an issued nonce stays redeemable.
pub const NONCE_TTL: Duration = Duration::from_secs(10 * 60);

/// An unpredictable, single-use challenge value.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Nonce(String);

impl Nonce {
    fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    /// Accepts an externally supplied nonce (e.g. from a cookie).
    ///
    /// # Errors
    ///
    /// EIP-4361 requires at least 8 alphanumeric characters.
    pub fn parse(value: &str) -> Result<Self, AicurateError> {
        if value.len() < 8 || !value.bytes().all(|b| b.is_ascii_alphanumeric()) {
            return Err(AicurateError::InvalidInput(
                "nonce must be at least 8 alphanumeric characters".to_string(),
            ));
        }
        Ok(Self(value.to_string()))
    }

    /// The nonce text.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Nonce {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for Nonce {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Nonce({}…)", &self.0[..self.0.len().min(6)])
    }
}

/// Result of redeeming a nonce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NonceCheck {
    /// The presented value matches a live session nonce.
    Valid,
    /// The presented value differs from the session nonce.
    Mismatch,
    /// The session carries no nonce.
    Missing,
    /// The session nonce was never issued here, already used, or too old.
    Expired,
}

impl NonceCheck {
    /// Whether the nonce was accepted.
    #[must_use]
    pub const fn is_valid(self) -> bool {
        matches!(self, Self::Valid)
    }
}

/// Issues nonces and tracks which ones are still redeemable.
///
/// The registry is process-local: with several server instances behind a
/// load balancer, completion must reach the instance that issued the nonce.
#[derive(Debug)]
pub struct NonceIssuer {
    issued: Mutex<HashMap<String, Instant>>,
    ttl: Duration,
}

impl Default for NonceIssuer {
    fn default() -> Self {
        Self::new()
    }
}

impl NonceIssuer {
    /// Creates an issuer with the standard ten minute lifetime.
    #[must_use]
    pub fn new() -> Self {
        Self::with_ttl(NONCE_TTL)
    }

    /// Creates an issuer with a custom lifetime.
    #[must_use]
    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            issued: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    fn registry(&self) -> MutexGuard<'_, HashMap<String, Instant>> {
        self.issued.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Issues a fresh nonce. `previous` is the nonce the same session held
    /// before, which stops being redeemable.
    pub fn issue(&self, previous: Option<&str>) -> Nonce {
        let nonce = Nonce::generate();
        let now = Instant::now();

        let mut registry = self.registry();
        registry.retain(|_, issued_at| now.duration_since(*issued_at) < self.ttl);
        if let Some(previous) = previous {
            registry.remove(previous);
        }
        registry.insert(nonce.as_str().to_string(), now);
        drop(registry);

        tracing::debug!(nonce = ?nonce, "issued wallet auth nonce");
        nonce
    }

    /// Redeems `presented` against the session's nonce.
    ///
    /// The session nonce is removed from the registry on every attempt, so a
    /// nonce is never accepted twice.
    pub fn consume(&self, presented: &str, session: Option<&str>) -> NonceCheck {
        let Some(session) = session else {
            return NonceCheck::Missing;
        };
        let issued_at = self.registry().remove(session);

        if !bool::from(presented.as_bytes().ct_eq(session.as_bytes())) {
            return NonceCheck::Mismatch;
        }
        match issued_at {
            Some(issued_at) if issued_at.elapsed() < self.ttl => NonceCheck::Valid,
            _ => NonceCheck::Expired,
        }
    }

    /// Number of nonces currently redeemable or awaiting pruning.
    #[must_use]
    pub fn outstanding(&self) -> usize {
        self.registry().len()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    #[test]
    fn test_nonce_format() {
        let issuer = NonceIssuer::new();
        let nonce = issuer.issue(None);
        assert_eq!(nonce.as_str().len(), 32);
        assert!(nonce
            .as_str()
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b)));
    }

    #[test]
    fn test_nonces_are_distinct() {
        let issuer = NonceIssuer::new();
        let nonces: HashSet<_> = (0..1000).map(|_| issuer.issue(None)).collect();
        assert_eq!(nonces.len(), 1000);
    }

    #[test]
    fn test_matching_nonce_is_valid_once() {
        let issuer = NonceIssuer::new();
        let nonce = issuer.issue(None);
        assert_eq!(
            issuer.consume(nonce.as_str(), Some(nonce.as_str())),
            NonceCheck::Valid
        );
        assert_eq!(
            issuer.consume(nonce.as_str(), Some(nonce.as_str())),
            NonceCheck::Expired
        );
    }

    #[test]
    fn test_mismatch_spends_the_session_nonce() {
        let issuer = NonceIssuer::new();
        let nonce = issuer.issue(None);
        assert_eq!(
            issuer.consume("someothernonce123", Some(nonce.as_str())),
            NonceCheck::Mismatch
        );
        assert_eq!(
            issuer.consume(nonce.as_str(), Some(nonce.as_str())),
            NonceCheck::Expired
        );
    }

    #[test]
    fn test_missing_session_nonce() {
        let issuer = NonceIssuer::new();
        assert_eq!(issuer.consume("abcdef123456", None), NonceCheck::Missing);
    }

    #[test]
    fn test_reissue_revokes_previous_nonce() {
        let issuer = NonceIssuer::new();
        let first = issuer.issue(None);
        let second = issuer.issue(Some(first.as_str()));
        assert_eq!(issuer.outstanding(), 1);
        assert_eq!(
            issuer.consume(first.as_str(), Some(first.as_str())),
            NonceCheck::Expired
        );
        assert!(issuer
            .consume(second.as_str(), Some(second.as_str()))
            .is_valid());
    }

    #[test]
    fn test_expired_nonce_is_rejected_and_pruned() {
        let issuer = NonceIssuer::with_ttl(Duration::ZERO);
        let nonce = issuer.issue(None);
        assert_eq!(
            issuer.consume(nonce.as_str(), Some(nonce.as_str())),
            NonceCheck::Expired
        );
        issuer.issue(None);
        issuer.issue(None);
        assert_eq!(issuer.outstanding(), 1);
    }

    #[test]
    fn test_parse() {
        assert!(Nonce::parse("abc").is_err());
        assert!(Nonce::parse("abcd-1234").is_err());
        assert_eq!(Nonce::parse("abcd1234").unwrap().as_str(), "abcd1234");
    }
}
