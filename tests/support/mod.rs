#![allow(dead_code)]

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use meme_museum::{
    dispatch::SideEffects,
    domain::{ActivityLog, FileStorage, MemeRepository, ModerationEngine, Notifier},
    errors::{ActivityError, NotifyError, RepoError, StorageError},
    extraction::NoopExtractor,
    memory::{InMemoryActivityLog, InMemoryFileStorage, InMemoryMemeRepository, InMemoryRelationRepository},
    models::{
        ActivityEvent, ActivityFilter, Comment, CounterField, Meme, ModerationDecision, NewMeme, RejectReason,
        RetrievalReference,
    },
    moderation::PermissiveModerator,
    notifications::{default_channels, NotificationRouter},
    pipeline::{Backends, EngagementPipeline, PipelineSettings},
};
use parking_lot::Mutex;
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};
use uuid::Uuid;

pub struct Harness {
    pub pipeline: EngagementPipeline,
    pub memes: Arc<InMemoryMemeRepository>,
    pub relations: Arc<InMemoryRelationRepository>,
    pub blobs: Arc<InMemoryFileStorage>,
    pub log: Arc<InMemoryActivityLog>,
    pub notifier: Arc<RecordingNotifier>,
}

impl Harness {
    pub fn new() -> Self {
        Self::builder().build()
    }

    pub fn builder() -> HarnessBuilder {
        HarnessBuilder::default()
    }

    /// Waits for queued audit events and notifications.
    pub async fn settle(&self) {
        self.pipeline.side_effects().flush().await;
    }

    pub fn actions(&self) -> Vec<&'static str> {
        self.log.snapshot().iter().map(|e| e.action.as_str()).collect()
    }
}

#[derive(Default)]
pub struct HarnessBuilder {
    moderation: Option<Arc<dyn ModerationEngine>>,
    storage: Option<Arc<dyn FileStorage>>,
    memes: Option<Arc<dyn MemeRepository>>,
    activity_log: Option<Arc<dyn ActivityLog>>,
    notifier: Option<Arc<dyn Notifier>>,
}

impl HarnessBuilder {
    pub fn moderation(mut self, moderation: impl ModerationEngine) -> Self {
        self.moderation = Some(Arc::new(moderation));
        self
    }

    pub fn storage(mut self, storage: impl FileStorage) -> Self {
        self.storage = Some(Arc::new(storage));
        self
    }

    pub fn memes(mut self, memes: impl MemeRepository) -> Self {
        self.memes = Some(Arc::new(memes));
        self
    }

    pub fn activity_log(mut self, log: impl ActivityLog) -> Self {
        self.activity_log = Some(Arc::new(log));
        self
    }

    pub fn notifier(mut self, notifier: impl Notifier) -> Self {
        self.notifier = Some(Arc::new(notifier));
        self
    }

    pub fn build(self) -> Harness {
        let memes = Arc::new(InMemoryMemeRepository::new());
        let relations = Arc::new(InMemoryRelationRepository::new());
        let blobs = Arc::new(InMemoryFileStorage::new());
        let log = Arc::new(InMemoryActivityLog::new());
        let notifier = Arc::new(RecordingNotifier::default());

        let backends = Backends {
            memes: self.memes.unwrap_or_else(|| memes.clone() as Arc<dyn MemeRepository>),
            relations: relations.clone(),
            storage: self.storage.unwrap_or_else(|| blobs.clone() as Arc<dyn FileStorage>),
            moderation: self.moderation.unwrap_or_else(|| Arc::new(PermissiveModerator) as Arc<dyn ModerationEngine>),
            extractor: Arc::new(NoopExtractor),
        };
        let router = NotificationRouter::new(self.notifier.unwrap_or_else(|| notifier.clone() as Arc<dyn Notifier>), default_channels());
        let (side_effects, _worker) = SideEffects::spawn_with_retry(
            self.activity_log.unwrap_or_else(|| log.clone() as Arc<dyn ActivityLog>),
            router,
            64,
            Duration::from_millis(200),
        );

        Harness {
            pipeline: EngagementPipeline::new(backends, side_effects, PipelineSettings::default()),
            memes,
            relations,
            blobs,
            log,
            notifier,
        }
    }
}

pub fn upload_by(owner: &str) -> NewMeme {
    NewMeme {
        owner: owner.to_string(),
        title: "cat.jpg".to_string(),
        description: "a cat".to_string(),
        category: "Animals".to_string(),
        tags: vec!["cat".to_string(), " funny ".to_string()],
        bytes: vec![0xFF, 0xD8, 0xFF, 0xE0, 1, 2, 3],
        filename: Some("cat.jpg".to_string()),
        content_type: Some("image/jpeg".to_string()),
    }
}

#[derive(Default)]
pub struct RecordingNotifier {
    pub sent: Mutex<Vec<(String, String, String)>>,
}

impl RecordingNotifier {
    pub fn channels(&self) -> Vec<String> {
        self.sent.lock().iter().map(|(c, _, _)| c.clone()).collect()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn publish(&self, channel: &str, subject: &str, body: &str) -> Result<(), NotifyError> {
        self.sent.lock().push((channel.into(), subject.into(), body.into()));
        Ok(())
    }
}

pub struct DownNotifier;

#[async_trait]
impl Notifier for DownNotifier {
    async fn publish(&self, _: &str, _: &str, _: &str) -> Result<(), NotifyError> {
        Err(NotifyError::Transport(anyhow::anyhow!("topic unreachable")))
    }
}

pub struct DownActivityLog;

#[async_trait]
impl ActivityLog for DownActivityLog {
    async fn append(&self, _: &ActivityEvent) -> Result<(), ActivityError> {
        Err(ActivityError::BackendError(anyhow::anyhow!("table unreachable")))
    }

    fn query(&self, _: ActivityFilter) -> BoxStream<'_, Result<ActivityEvent, ActivityError>> {
        stream::empty().boxed()
    }
}

/// Rejects every image with a fixed reason.
pub struct RejectAll;

#[async_trait]
impl ModerationEngine for RejectAll {
    async fn classify(&self, _: &[u8], _: f32) -> ModerationDecision {
        ModerationDecision {
            approved: false,
            reasons: vec![RejectReason {
                label: "Violence".to_string(),
                confidence: 92.5,
            }],
        }
    }
}

pub struct UnwritableStorage;

#[async_trait]
impl FileStorage for UnwritableStorage {
    async fn upload(&self, key: &str, _: Vec<u8>, _: Option<String>) -> Result<(), StorageError> {
        Err(StorageError::UploadFailed(format!("bucket refused {}", key)))
    }

    async fn download(&self, key: &str) -> Result<(Vec<u8>, Option<String>), StorageError> {
        Err(StorageError::NotFound(key.to_string()))
    }

    async fn delete(&self, _: &str) -> Result<(), StorageError> {
        Ok(())
    }

    async fn retrieval_reference(&self, _: &str, _: Duration) -> Result<Option<RetrievalReference>, StorageError> {
        Ok(None)
    }
}

/// Stores blobs but cannot delete them.
pub struct UndeletableStorage(pub Arc<InMemoryFileStorage>);

#[async_trait]
impl FileStorage for UndeletableStorage {
    async fn upload(&self, key: &str, data: Vec<u8>, content_type: Option<String>) -> Result<(), StorageError> {
        self.0.upload(key, data, content_type).await
    }

    async fn download(&self, key: &str) -> Result<(Vec<u8>, Option<String>), StorageError> {
        self.0.download(key).await
    }

    async fn delete(&self, _: &str) -> Result<(), StorageError> {
        Err(StorageError::BackendError(anyhow::anyhow!("AccessDenied")))
    }

    async fn retrieval_reference(&self, key: &str, ttl: Duration) -> Result<Option<RetrievalReference>, StorageError> {
        self.0.retrieval_reference(key, ttl).await
    }
}

/// Blob store without any URL scheme.
pub struct ReferencelessStorage(pub Arc<InMemoryFileStorage>);

#[async_trait]
impl FileStorage for ReferencelessStorage {
    async fn upload(&self, key: &str, data: Vec<u8>, content_type: Option<String>) -> Result<(), StorageError> {
        self.0.upload(key, data, content_type).await
    }

    async fn download(&self, key: &str) -> Result<(Vec<u8>, Option<String>), StorageError> {
        self.0.download(key).await
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.0.delete(key).await
    }

    async fn retrieval_reference(&self, _: &str, _: Duration) -> Result<Option<RetrievalReference>, StorageError> {
        Ok(None)
    }
}

/// Metadata store whose writes are rejected.
pub struct ReadOnlyMemes;

#[async_trait]
impl MemeRepository for ReadOnlyMemes {
    async fn create(&self, _: &Meme) -> Result<(), RepoError> {
        Err(RepoError::BackendError(anyhow::anyhow!("ProvisionedThroughputExceeded")))
    }

    async fn get_by_id(&self, _: Uuid) -> Result<Option<Meme>, RepoError> {
        Ok(None)
    }

    async fn list_by_owner(&self, _: &str) -> Result<Vec<Meme>, RepoError> {
        Ok(Vec::new())
    }

    async fn increment_counter(&self, id: Uuid, _: CounterField) -> Result<u64, RepoError> {
        Err(RepoError::NotFound(id))
    }

    async fn append_comment(&self, id: Uuid, _: &Comment) -> Result<(), RepoError> {
        Err(RepoError::NotFound(id))
    }

    async fn remove_comment(&self, id: Uuid, _: Uuid) -> Result<bool, RepoError> {
        Err(RepoError::NotFound(id))
    }

    async fn delete(&self, _: Uuid) -> Result<(), RepoError> {
        Ok(())
    }
}

/// Applies the first likes increment, then reports it as timed out.
pub struct LostIncrementResponse {
    pub inner: Arc<InMemoryMemeRepository>,
    dropped: AtomicBool,
}

impl LostIncrementResponse {
    pub fn new(inner: Arc<InMemoryMemeRepository>) -> Self {
        Self {
            inner,
            dropped: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl MemeRepository for LostIncrementResponse {
    async fn create(&self, meme: &Meme) -> Result<(), RepoError> {
        self.inner.create(meme).await
    }

    async fn get_by_id(&self, id: Uuid) -> Result<Option<Meme>, RepoError> {
        self.inner.get_by_id(id).await
    }

    async fn list_by_owner(&self, owner: &str) -> Result<Vec<Meme>, RepoError> {
        self.inner.list_by_owner(owner).await
    }

    async fn increment_counter(&self, id: Uuid, field: CounterField) -> Result<u64, RepoError> {
        let value = self.inner.increment_counter(id, field).await?;
        if field == CounterField::Likes && !self.dropped.swap(true, Ordering::SeqCst) {
            return Err(RepoError::BackendError(anyhow::anyhow!("RequestTimeout")));
        }
        Ok(value)
    }

    async fn append_comment(&self, id: Uuid, comment: &Comment) -> Result<(), RepoError> {
        self.inner.append_comment(id, comment).await
    }

    async fn remove_comment(&self, id: Uuid, comment_id: Uuid) -> Result<bool, RepoError> {
        self.inner.remove_comment(id, comment_id).await
    }

    async fn delete(&self, id: Uuid) -> Result<(), RepoError> {
        self.inner.delete(id).await
    }
}

/// Deletes the meme right before any counter update lands.
pub struct DeletedBeforeIncrement(pub Arc<InMemoryMemeRepository>);

#[async_trait]
impl MemeRepository for DeletedBeforeIncrement {
    async fn create(&self, meme: &Meme) -> Result<(), RepoError> {
        self.0.create(meme).await
    }

    async fn get_by_id(&self, id: Uuid) -> Result<Option<Meme>, RepoError> {
        self.0.get_by_id(id).await
    }

    async fn list_by_owner(&self, owner: &str) -> Result<Vec<Meme>, RepoError> {
        self.0.list_by_owner(owner).await
    }

    async fn increment_counter(&self, id: Uuid, field: CounterField) -> Result<u64, RepoError> {
        self.0.delete(id).await?;
        self.0.increment_counter(id, field).await
    }

    async fn append_comment(&self, id: Uuid, comment: &Comment) -> Result<(), RepoError> {
        self.0.append_comment(id, comment).await
    }

    async fn remove_comment(&self, id: Uuid, comment_id: Uuid) -> Result<bool, RepoError> {
        self.0.remove_comment(id, comment_id).await
    }

    async fn delete(&self, id: Uuid) -> Result<(), RepoError> {
        self.0.delete(id).await
    }
}
