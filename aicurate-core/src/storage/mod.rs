//! Durable client-side state: the blob store contract and the keyed,
//! versioned persistence adapter used by the credit ledger and the review
//! draft.

pub mod error;
pub mod file;
pub mod memory;
pub mod persisted;
pub mod traits;

pub use error::{StorageError, StorageResult};
pub use file::FileBlobStore;
pub use memory::InMemoryBlobStore;
pub use persisted::Persisted;
pub use traits::AtomicBlobStore;

/// Storage key of the persisted credit balance.
pub const CREDITS_KEY: &str = "ai-credits";

/// Storage key of the persisted review-form draft.
pub const REVIEW_DRAFT_KEY: &str = "review-form-data";
