use crate::errors::{ActivityError, ModerationError, NotifyError, RepoError, StorageError};
use crate::models::{
    ActivityEvent, ActivityFilter, Comment, CounterField, DetectedLabel, Extraction, Meme, ModerationDecision,
    RelationKind, RetrievalReference,
};
use async_trait::async_trait;
use futures::stream::BoxStream;
use std::time::Duration;
use uuid::Uuid;

/// Trait defining operations for storing and retrieving Meme metadata.
#[async_trait]
pub trait MemeRepository: Send + Sync + 'static { // Send+Sync+'static required for Arc<dyn>
    /// Stores a new meme. Fails with `RepoError::Duplicate` if the id is taken.
    async fn create(&self, meme: &Meme) -> Result<(), RepoError>;

    /// Retrieves a meme's metadata by its unique ID.
    /// Returns Ok(None) if the meme is not found.
    async fn get_by_id(&self, id: Uuid) -> Result<Option<Meme>, RepoError>;

    /// Memes uploaded by `owner`, oldest first.
    async fn list_by_owner(&self, owner: &str) -> Result<Vec<Meme>, RepoError>;

    /// Atomically adds one to `field` and returns the new value.
    async fn increment_counter(&self, id: Uuid, field: CounterField) -> Result<u64, RepoError>;

    async fn append_comment(&self, id: Uuid, comment: &Comment) -> Result<(), RepoError>;

    /// Removes the comment with `comment_id`. Returns false if it was not there.
    /// Authorization is the caller's job.
    async fn remove_comment(&self, id: Uuid, comment_id: Uuid) -> Result<bool, RepoError>;

    async fn delete(&self, id: Uuid) -> Result<(), RepoError>;
}

/// (meme, user) relations such as likes and saves.
#[async_trait]
pub trait RelationRepository: Send + Sync + 'static {
    /// Inserts the relation unless it already exists, as one atomic step.
    /// Returns true only for the call that created it.
    async fn insert_if_absent(&self, kind: RelationKind, meme_id: Uuid, user: &str) -> Result<bool, RepoError>;

    /// Returns true if a relation was removed.
    async fn remove(&self, kind: RelationKind, meme_id: Uuid, user: &str) -> Result<bool, RepoError>;

    async fn list_for_user(&self, kind: RelationKind, user: &str) -> Result<Vec<Uuid>, RepoError>;

    /// Drops every relation of every kind pointing at `meme_id`.
    async fn purge_meme(&self, meme_id: Uuid) -> Result<(), RepoError>;
}

/// Trait defining operations for storing and retrieving file data (meme images).
#[async_trait]
pub trait FileStorage: Send + Sync + 'static {
    /// Uploads file data to the storage backend.
    async fn upload(&self, key: &str, data: Vec<u8>, content_type: Option<String>) -> Result<(), StorageError>;

    async fn download(&self, key: &str) -> Result<(Vec<u8>, Option<String>), StorageError>;

    /// Deleting a missing key is not an error.
    async fn delete(&self, key: &str) -> Result<(), StorageError>;

    /// Returns `None` when the backend has no way to hand out references.
    async fn retrieval_reference(&self, key: &str, ttl: Duration) -> Result<Option<RetrievalReference>, StorageError>;
}

/// Raw classifier returning moderation labels.
#[async_trait]
pub trait LabelDetector: Send + Sync + 'static {
    async fn detect_moderation_labels(&self, image: &[u8], min_confidence: f32) -> Result<Vec<DetectedLabel>, ModerationError>;
}

/// Approve/reject policy over image bytes. Implementations never fail; errors degrade to approve.
#[async_trait]
pub trait ModerationEngine: Send + Sync + 'static {
    async fn classify(&self, image: &[u8], min_confidence: f32) -> ModerationDecision;
}

/// Best-effort tags and OCR text. Implementations never fail; errors yield empty output.
#[async_trait]
pub trait LabelExtractor: Send + Sync + 'static {
    async fn extract(&self, image: &[u8]) -> Extraction;
}

/// Append-only audit sink.
#[async_trait]
pub trait ActivityLog: Send + Sync + 'static {
    async fn append(&self, event: &ActivityEvent) -> Result<(), ActivityError>;

    /// Lazily streams matching events.
    fn query(&self, filter: ActivityFilter) -> BoxStream<'_, Result<ActivityEvent, ActivityError>>;
}

/// Transport for notifications. `channel` is a backend-specific target such as a topic ARN.
#[async_trait]
pub trait Notifier: Send + Sync + 'static {
    async fn publish(&self, channel: &str, subject: &str, body: &str) -> Result<(), NotifyError>;
}
