//! Payment references and the registry that tracks their redemption.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// How long an initiated payment may take to be confirmed.
pub const REFERENCE_TTL: Duration = Duration::from_secs(60 * 60);

/// Identifier binding a wallet payment to the purchase that requested it.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PaymentReference(String);

impl PaymentReference {
    fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    /// The reference text.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for PaymentReference {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for PaymentReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for PaymentReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PaymentReference({})", self.0)
    }
}

#[derive(Debug)]
struct Issued {
    created: Instant,
    redeemed_by: Option<String>,
}

/// References issued by this process. A confirmed reference is remembered,
/// together with the transaction that redeemed it, until it expires.
#[derive(Debug)]
pub struct PaymentRegistry {
    issued: Mutex<HashMap<String, Issued>>,
    ttl: Duration,
}

impl Default for PaymentRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl PaymentRegistry {
    /// Creates a registry whose references live one hour.
    #[must_use]
    pub fn new() -> Self {
        Self::with_ttl(REFERENCE_TTL)
    }

    /// Creates a registry with a custom reference lifetime.
    #[must_use]
    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            issued: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    fn issued(&self) -> MutexGuard<'_, HashMap<String, Issued>> {
        self.issued.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn live<'a>(
        &self,
        issued: &'a mut HashMap<String, Issued>,
        reference: &str,
    ) -> Option<&'a mut Issued> {
        issued
            .get_mut(reference)
            .filter(|entry| entry.created.elapsed() < self.ttl)
    }

    fn record(&self, reference: &PaymentReference) {
        let now = Instant::now();
        let mut issued = self.issued();
        issued.retain(|_, entry| now.duration_since(entry.created) < self.ttl);
        issued.insert(
            reference.as_str().to_string(),
            Issued {
                created: now,
                redeemed_by: None,
            },
        );
    }

    /// Whether `reference` was issued here, has not expired and has not been
    /// confirmed yet.
    #[must_use]
    pub fn is_pending(&self, reference: &str) -> bool {
        self.live(&mut self.issued(), reference)
            .is_some_and(|entry| entry.redeemed_by.is_none())
    }

    /// Marks `reference` as confirmed by `transaction_id`. Returns `false` if
    /// it was not pending, so of two concurrent confirmations only one
    /// succeeds.
    #[must_use]
    pub fn redeem(&self, reference: &str, transaction_id: &str) -> bool {
        match self.live(&mut self.issued(), reference) {
            Some(entry) if entry.redeemed_by.is_none() => {
                entry.redeemed_by = Some(transaction_id.to_string());
                true
            }
            _ => false,
        }
    }

    /// Whether `reference` was already confirmed by exactly `transaction_id`.
    #[must_use]
    pub fn redeemed_by(&self, reference: &str, transaction_id: &str) -> bool {
        self.live(&mut self.issued(), reference)
            .is_some_and(|entry| entry.redeemed_by.as_deref() == Some(transaction_id))
    }

    /// Number of references remembered, confirmed or not, until pruning.
    #[must_use]
    pub fn outstanding(&self) -> usize {
        self.issued().len()
    }
}

/// Issues payment references.
#[derive(Debug, Clone)]
pub struct PaymentInitiator {
    registry: Arc<PaymentRegistry>,
}

impl PaymentInitiator {
    /// Creates an initiator recording references in `registry`.
    #[must_use]
    pub const fn new(registry: Arc<PaymentRegistry>) -> Self {
        Self { registry }
    }

    /// Issues a fresh reference and records it for later confirmation.
    pub fn initiate(&self) -> PaymentReference {
        let reference = PaymentReference::generate();
        self.registry.record(&reference);
        tracing::info!(%reference, "payment initiated");
        reference
    }
}
