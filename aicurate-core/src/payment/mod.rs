//! Payment initiation and confirmation.
//!
//! The initiator hands out single-use references; the confirmer accepts a
//! wallet's payment result only if the Developer Portal reports a transaction
//! with that reference, to the configured recipient, for the expected token and
//! amount. Credits are granted client-side, and only after a confirmation.

pub mod confirm;
pub mod reference;

pub use confirm::{
    DevPortalTransactions, PayFinalPayload, PaymentConfirmer, PaymentVerdict, TransactionRecord,
    TransactionSource, TransactionStatus,
};
pub use reference::{PaymentInitiator, PaymentReference, PaymentRegistry, REFERENCE_TTL};
