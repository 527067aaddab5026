//! Client-held consultation credit balance.
//!
//! All mutations go through one mutex and are written through the
//! persistence adapter before the in-memory balance changes, so the balance
//! always equals confirmed purchases minus charged consultations, even when a
//! purchase confirmation and a finishing consultation race.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::INITIAL_FREE_CREDITS;
use crate::storage::{AtomicBlobStore, Persisted, StorageError, CREDITS_KEY};

/// Errors returned by [`CreditLedger`] mutations.
#[derive(Debug, Error, PartialEq, Eq, uniffi::Error)]
pub enum LedgerError {
    /// The balance is zero; nothing was debited.
    #[error("no credits remaining")]
    Exhausted,
    /// Credits must be granted in positive amounts.
    #[error("credit amount must be positive")]
    InvalidAmount,
    /// The balance would exceed `u32::MAX`.
    #[error("credit balance overflow")]
    Overflow,
    /// The new balance could not be persisted; the balance is unchanged.
    #[error("storage error: {0}")]
    Storage(String),
}

impl From<StorageError> for LedgerError {
    fn from(error: StorageError) -> Self {
        Self::Storage(error.to_string())
    }
}

/// Persisted shape. Signed so that balances driven negative by older clients
/// still deserialize; they are clamped to zero on load.
#[derive(Debug, Serialize, Deserialize)]
struct CreditState {
    credits: i64,
}

/// Durable, per-device credit counter.
#[derive(uniffi::Object)]
pub struct CreditLedger {
    balance: Mutex<u32>,
    persisted: Persisted<CreditState>,
}

impl CreditLedger {
    fn lock(&self) -> MutexGuard<'_, u32> {
        // The guarded value is only replaced after a successful write, so it is
        // consistent even if a holder panicked.
        self.balance.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Single exclusive entry point for every balance change.
    fn mutate(
        &self,
        change: impl FnOnce(u32) -> Result<u32, LedgerError>,
    ) -> Result<u32, LedgerError> {
        let mut balance = self.lock();
        let next = change(*balance)?;
        self.persisted.save(&CreditState {
            credits: i64::from(next),
        })?;
        *balance = next;
        Ok(next)
    }
}

#[uniffi::export]
impl CreditLedger {
    /// Opens the ledger persisted in `store`, initializing it with the free
    /// allotment on first use.
    ///
    /// # Errors
    ///
    /// Returns an error if the persisted balance cannot be read or the initial
    /// balance cannot be written.
    #[uniffi::constructor]
    pub fn open(store: Arc<dyn AtomicBlobStore>) -> Result<Self, LedgerError> {
        let persisted = Persisted::<CreditState>::new(CREDITS_KEY, store);
        let balance = match persisted.load()? {
            Some(state) => {
                let clamped = u32::try_from(state.credits.max(0)).unwrap_or(u32::MAX);
                if i64::from(clamped) != state.credits {
                    tracing::warn!(
                        stored = state.credits,
                        "persisted credit balance out of range, clamped to {clamped}"
                    );
                    persisted.save(&CreditState {
                        credits: i64::from(clamped),
                    })?;
                }
                clamped
            }
            None => {
                persisted.save(&CreditState {
                    credits: i64::from(INITIAL_FREE_CREDITS),
                })?;
                INITIAL_FREE_CREDITS
            }
        };

        Ok(Self {
            balance: Mutex::new(balance),
            persisted,
        })
    }

    /// Returns the current balance.
    #[must_use]
    pub fn balance(&self) -> u32 {
        *self.lock()
    }

    /// Whether at least one credit is available.
    #[must_use]
    pub fn has_credits(&self) -> bool {
        self.balance() > 0
    }

    /// Removes one credit, returning the new balance.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Exhausted`] (and leaves the balance at zero) when
    /// no credit is left, or [`LedgerError::Storage`] if persisting fails.
    pub fn debit(&self) -> Result<u32, LedgerError> {
        let remaining = self.mutate(|balance| balance.checked_sub(1).ok_or(LedgerError::Exhausted))?;
        tracing::debug!(remaining, "debited one consultation credit");
        Ok(remaining)
    }

    /// Adds `amount` credits, returning the new balance.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::InvalidAmount`] for zero, [`LedgerError::Overflow`]
    /// past `u32::MAX`, or [`LedgerError::Storage`] if persisting fails.
    pub fn credit(&self, amount: u32) -> Result<u32, LedgerError> {
        if amount == 0 {
            return Err(LedgerError::InvalidAmount);
        }
        let balance =
            self.mutate(|balance| balance.checked_add(amount).ok_or(LedgerError::Overflow))?;
        tracing::info!(amount, balance, "credited consultation credits");
        Ok(balance)
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;
    use crate::storage::InMemoryBlobStore;

    fn ledger_with(credits: i64) -> (Arc<InMemoryBlobStore>, CreditLedger) {
        let store = Arc::new(InMemoryBlobStore::new());
        store
            .write_atomic(
                CREDITS_KEY.to_string(),
                format!(r#"{{"state":{{"credits":{credits}}},"version":0}}"#).into_bytes(),
            )
            .unwrap();
        let ledger = CreditLedger::open(store.clone()).unwrap();
        (store, ledger)
    }

    #[test]
    fn test_first_use_grants_free_allotment() {
        let store = Arc::new(InMemoryBlobStore::new());
        let ledger = CreditLedger::open(store.clone()).unwrap();
        assert_eq!(ledger.balance(), INITIAL_FREE_CREDITS);
        assert!(store.read(CREDITS_KEY.to_string()).unwrap().is_some());
    }

    #[test]
    fn test_debit_reflects_exactly_one_fewer_credit() {
        let (_, ledger) = ledger_with(3);
        assert_eq!(ledger.debit(), Ok(2));
        assert_eq!(ledger.balance(), 2);
    }

    #[test]
    fn test_debit_at_zero_is_rejected_and_never_goes_negative() {
        let (_, ledger) = ledger_with(1);
        assert_eq!(ledger.debit(), Ok(0));
        assert_eq!(ledger.debit(), Err(LedgerError::Exhausted));
        assert_eq!(ledger.debit(), Err(LedgerError::Exhausted));
        assert_eq!(ledger.balance(), 0);
        assert!(!ledger.has_credits());
    }

    #[test]
    fn test_two_purchases_add_ten() {
        let (_, ledger) = ledger_with(0);
        assert_eq!(ledger.credit(5), Ok(5));
        assert_eq!(ledger.credit(5), Ok(10));
    }

    #[test]
    fn test_credit_rejects_zero_and_overflow() {
        let (_, ledger) = ledger_with(i64::from(u32::MAX) - 1);
        assert_eq!(ledger.credit(0), Err(LedgerError::InvalidAmount));
        assert_eq!(ledger.credit(2), Err(LedgerError::Overflow));
        assert_eq!(ledger.balance(), u32::MAX - 1);
    }

    #[test]
    fn test_balance_survives_reopen() {
        let (store, ledger) = ledger_with(5);
        ledger.debit().unwrap();
        ledger.credit(5).unwrap();
        drop(ledger);

        let reopened = CreditLedger::open(store).unwrap();
        assert_eq!(reopened.balance(), 9);
    }

    #[test]
    fn test_negative_legacy_balance_is_clamped() {
        let (store, ledger) = ledger_with(-3);
        assert_eq!(ledger.balance(), 0);
        let raw = store.read(CREDITS_KEY.to_string()).unwrap().unwrap();
        assert_eq!(
            String::from_utf8(raw).unwrap(),
            r#"{"state":{"credits":0},"version":0}"#
        );
    }

    #[test]
    fn test_failed_write_leaves_balance_untouched() {
        let (store, ledger) = ledger_with(4);
        store.fail_writes(true);
        assert!(matches!(ledger.debit(), Err(LedgerError::Storage(_))));
        assert!(matches!(ledger.credit(5), Err(LedgerError::Storage(_))));
        assert_eq!(ledger.balance(), 4);

        store.fail_writes(false);
        assert_eq!(ledger.debit(), Ok(3));
    }

    #[test]
    fn test_concurrent_debits_never_overdraw() {
        let (_, ledger) = ledger_with(100);
        let ledger = Arc::new(ledger);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let ledger = Arc::clone(&ledger);
                thread::spawn(move || (0..20).filter(|_| ledger.debit().is_ok()).count())
            })
            .collect();
        let charged: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();

        assert_eq!(charged, 100);
        assert_eq!(ledger.balance(), 0);
    }

    #[test]
    fn test_concurrent_credits_and_debits_balance_exactly() {
        let (_, ledger) = ledger_with(50);
        let ledger = Arc::new(ledger);

        let debiter = {
            let ledger = Arc::clone(&ledger);
            thread::spawn(move || (0..40).filter(|_| ledger.debit().is_ok()).count())
        };
        let crediter = {
            let ledger = Arc::clone(&ledger);
            thread::spawn(move || {
                for _ in 0..10 {
                    ledger.credit(5).unwrap();
                }
            })
        };
        let charged = debiter.join().unwrap();
        crediter.join().unwrap();

        assert_eq!(charged, 40);
        assert_eq!(ledger.balance(), 50 + 50 - 40);
    }
}
