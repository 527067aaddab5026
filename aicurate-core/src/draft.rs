//! Persisted draft of the review form.
//!
//! A review survives app restarts until it is submitted. Submission requires a
//! World ID proof for the `submit-review` action; the draft is only discarded
//! once that action is verified.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::identity::IdentityOutcome;
use crate::storage::{AtomicBlobStore, Persisted, StorageError, REVIEW_DRAFT_KEY};
use crate::AicurateError;

/// Maximum number of pros or cons on one review.
pub const MAX_LIST_ITEMS: usize = 5;

/// A partially filled review. Every field is optional until submission.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReviewDraft {
    /// Name of the reviewed app, 2 to 50 characters.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub app_name: Option<String>,
    /// Category such as `Text Generation`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub app_category: Option<String>,
    /// Rating category (`performance`, `security`, …) to stars.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ratings: Option<BTreeMap<String, u8>>,
    /// Up to five strengths.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pros: Option<Vec<String>>,
    /// Up to five weaknesses.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cons: Option<Vec<String>>,
    /// Free text.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub missing_features: Option<String>,
    /// Free text.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recommendation: Option<String>,
    /// Whether the reviewer wants a consultation about the app.
    #[serde(rename = "consultAI", skip_serializing_if = "Option::is_none")]
    pub consult_ai: Option<bool>,
    /// Whether the reviewer would build something similar.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub create_similar: Option<bool>,
}

impl ReviewDraft {
    /// Overwrites the fields present in `patch`, keeping the others.
    pub fn merge(&mut self, patch: Self) {
        macro_rules! take {
            ($($field:ident),*) => {
                $(if patch.$field.is_some() { self.$field = patch.$field; })*
            };
        }
        take!(
            app_name,
            app_category,
            ratings,
            pros,
            cons,
            missing_features,
            recommendation,
            consult_ai,
            create_similar
        );
    }

    /// Checks the draft is complete enough to submit.
    ///
    /// # Errors
    ///
    /// The first problem found.
    pub fn validate(&self) -> Result<(), DraftError> {
        let name = self.app_name.as_deref().map(str::trim).unwrap_or_default();
        if name.is_empty() {
            return Err(DraftError::AppNameRequired);
        }
        let length = name.chars().count();
        if !(2..=50).contains(&length) {
            return Err(DraftError::AppNameLength(length));
        }
        if !self
            .app_category
            .as_deref()
            .is_some_and(|category| !category.trim().is_empty())
        {
            return Err(DraftError::CategoryRequired);
        }
        for (category, stars) in self.ratings.iter().flatten() {
            if !(1..=5).contains(stars) {
                return Err(DraftError::RatingOutOfRange {
                    category: category.clone(),
                    stars: *stars,
                });
            }
        }
        for (field, items) in [("pros", &self.pros), ("cons", &self.cons)] {
            if items.as_ref().is_some_and(|items| items.len() > MAX_LIST_ITEMS) {
                return Err(DraftError::TooManyItems(field));
            }
        }
        Ok(())
    }
}

/// Problems with a draft or its submission.
#[derive(Debug, Error)]
pub enum DraftError {
    /// The app name is missing or blank.
    #[error("App name is required")]
    AppNameRequired,
    /// The app name has the given number of characters, outside 2 to 50.
    #[error("App name must be between 2 and 50 characters, got {0}")]
    AppNameLength(usize),
    /// No category was selected.
    #[error("Please select a category")]
    CategoryRequired,
    /// A rating is outside 1 to 5 stars.
    #[error("rating for {category} must be 1 to 5 stars, got {stars}")]
    RatingOutOfRange {
        /// Rating category.
        category: String,
        /// Offending value.
        stars: u8,
    },
    /// `pros` or `cons` has more than five entries.
    #[error("at most 5 {0} are allowed")]
    TooManyItems(&'static str),
    /// The World ID proof for the submission was refused.
    #[error("verification failed: {0}")]
    NotVerified(String),
    /// The verification request itself failed.
    #[error(transparent)]
    Verification(#[from] AicurateError),
    /// The draft could not be persisted.
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Holds the current draft and keeps it persisted under `review-form-data`.
pub struct ReviewDraftStore {
    draft: Mutex<ReviewDraft>,
    persisted: Persisted<ReviewDraft>,
}

impl ReviewDraftStore {
    /// Loads the saved draft, or starts an empty one.
    ///
    /// # Errors
    ///
    /// If the saved draft cannot be read.
    pub fn open(store: Arc<dyn AtomicBlobStore>) -> Result<Self, StorageError> {
        let persisted = Persisted::new(REVIEW_DRAFT_KEY, store);
        let draft = persisted.load_or_else(ReviewDraft::default)?;
        Ok(Self {
            draft: Mutex::new(draft),
            persisted,
        })
    }

    fn lock(&self) -> MutexGuard<'_, ReviewDraft> {
        self.draft.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// A copy of the current draft.
    #[must_use]
    pub fn draft(&self) -> ReviewDraft {
        self.lock().clone()
    }

    /// Merges `patch` into the draft and persists the result.
    ///
    /// # Errors
    ///
    /// If persisting fails; the in-memory draft is then unchanged.
    pub fn update(&self, patch: ReviewDraft) -> Result<ReviewDraft, StorageError> {
        let mut draft = self.lock();
        let mut next = draft.clone();
        next.merge(patch);
        self.persisted.save(&next)?;
        *draft = next.clone();
        Ok(next)
    }

    /// Discards the draft.
    ///
    /// # Errors
    ///
    /// If the saved draft cannot be deleted.
    pub fn clear(&self) -> Result<(), StorageError> {
        let mut draft = self.lock();
        self.persisted.clear()?;
        *draft = ReviewDraft::default();
        Ok(())
    }

    /// Validates the draft and hands it to `verify`, which proves personhood
    /// for the `submit-review` action. The draft is cleared when the action
    /// is verified, including when it was already verified before.
    ///
    /// # Errors
    ///
    /// Validation errors, [`DraftError::NotVerified`] when the proof was
    /// refused, or the error returned by `verify`. The draft is kept in all
    /// of these cases.
    pub async fn submit<F, Fut>(&self, verify: F) -> Result<IdentityOutcome, DraftError>
    where
        F: FnOnce(ReviewDraft) -> Fut,
        Fut: Future<Output = Result<IdentityOutcome, AicurateError>>,
    {
        let draft = self.draft();
        draft.validate()?;

        let outcome = verify(draft).await?;
        match &outcome {
            IdentityOutcome::Rejected { code, detail } => {
                tracing::info!(%code, "review submission not verified");
                return Err(DraftError::NotVerified(detail.clone()));
            }
            IdentityOutcome::AlreadyVerified { .. } => {
                tracing::info!("review action already verified, clearing draft");
            }
            IdentityOutcome::Accepted => tracing::info!("review submitted"),
        }
        self.clear()?;
        Ok(outcome)
    }
}
