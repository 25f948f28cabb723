//! In-process backends used for local runs and as test doubles.
//!
//! Every mutation happens under a single write lock per store, which is what
//! makes counter increments, comment appends and relation inserts atomic here.

use crate::{
    domain::{ActivityLog, FileStorage, MemeRepository, RelationRepository},
    errors::{ActivityError, RepoError, StorageError},
    models::{ActivityEvent, ActivityFilter, Comment, CounterField, Meme, RelationKind, RetrievalReference},
};
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use parking_lot::RwLock;
use std::{
    collections::{HashMap, HashSet},
    time::Duration,
};
use uuid::Uuid;

#[derive(Debug, Default)]
pub struct InMemoryMemeRepository {
    memes: RwLock<HashMap<Uuid, Meme>>,
}

impl InMemoryMemeRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.memes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.memes.read().is_empty()
    }
}

#[async_trait]
impl MemeRepository for InMemoryMemeRepository {
    async fn create(&self, meme: &Meme) -> Result<(), RepoError> {
        let mut memes = self.memes.write();
        if memes.contains_key(&meme.meme_id) {
            return Err(RepoError::Duplicate(meme.meme_id));
        }
        memes.insert(meme.meme_id, meme.clone());
        Ok(())
    }

    async fn get_by_id(&self, id: Uuid) -> Result<Option<Meme>, RepoError> {
        Ok(self.memes.read().get(&id).cloned())
    }

    async fn list_by_owner(&self, owner: &str) -> Result<Vec<Meme>, RepoError> {
        let mut owned: Vec<Meme> = self
            .memes
            .read()
            .values()
            .filter(|m| m.owner == owner)
            .cloned()
            .collect();
        owned.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.meme_id.cmp(&b.meme_id)));
        Ok(owned)
    }

    async fn increment_counter(&self, id: Uuid, field: CounterField) -> Result<u64, RepoError> {
        let mut memes = self.memes.write();
        let meme = memes.get_mut(&id).ok_or(RepoError::NotFound(id))?;
        let counter = match field {
            CounterField::Likes => &mut meme.likes,
            CounterField::Views => &mut meme.views,
            CounterField::Downloads => &mut meme.downloads,
        };
        *counter = counter.saturating_add(1);
        Ok(*counter)
    }

    async fn append_comment(&self, id: Uuid, comment: &Comment) -> Result<(), RepoError> {
        let mut memes = self.memes.write();
        let meme = memes.get_mut(&id).ok_or(RepoError::NotFound(id))?;
        meme.comments.push(comment.clone());
        Ok(())
    }

    async fn remove_comment(&self, id: Uuid, comment_id: Uuid) -> Result<bool, RepoError> {
        let mut memes = self.memes.write();
        let meme = memes.get_mut(&id).ok_or(RepoError::NotFound(id))?;
        match meme.comments.iter().position(|c| c.comment_id == comment_id) {
            Some(index) => {
                meme.comments.remove(index);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn delete(&self, id: Uuid) -> Result<(), RepoError> {
        self.memes.write().remove(&id);
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct InMemoryRelationRepository {
    relations: RwLock<HashSet<(RelationKind, Uuid, String)>>,
}

impl InMemoryRelationRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored relations of `kind` for `meme_id`.
    pub fn count(&self, kind: RelationKind, meme_id: Uuid) -> usize {
        self.relations
            .read()
            .iter()
            .filter(|(k, m, _)| *k == kind && *m == meme_id)
            .count()
    }
}

#[async_trait]
impl RelationRepository for InMemoryRelationRepository {
    async fn insert_if_absent(&self, kind: RelationKind, meme_id: Uuid, user: &str) -> Result<bool, RepoError> {
        Ok(self.relations.write().insert((kind, meme_id, user.to_string())))
    }

    async fn remove(&self, kind: RelationKind, meme_id: Uuid, user: &str) -> Result<bool, RepoError> {
        Ok(self.relations.write().remove(&(kind, meme_id, user.to_string())))
    }

    async fn list_for_user(&self, kind: RelationKind, user: &str) -> Result<Vec<Uuid>, RepoError> {
        Ok(self
            .relations
            .read()
            .iter()
            .filter(|(k, _, u)| *k == kind && u == user)
            .map(|(_, meme_id, _)| *meme_id)
            .collect())
    }

    async fn purge_meme(&self, meme_id: Uuid) -> Result<(), RepoError> {
        self.relations.write().retain(|(_, m, _)| *m != meme_id);
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct InMemoryFileStorage {
    objects: RwLock<HashMap<String, (Vec<u8>, Option<String>)>>,
}

impl InMemoryFileStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.objects.read().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.objects.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.read().is_empty()
    }
}

#[async_trait]
impl FileStorage for InMemoryFileStorage {
    async fn upload(&self, key: &str, data: Vec<u8>, content_type: Option<String>) -> Result<(), StorageError> {
        tracing::debug!(key = %key, size_bytes = data.len(), "Memory: Storing object");
        self.objects.write().insert(key.to_string(), (data, content_type));
        Ok(())
    }

    async fn download(&self, key: &str) -> Result<(Vec<u8>, Option<String>), StorageError> {
        self.objects
            .read()
            .get(key)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(key.to_string()))
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.objects.write().remove(key);
        Ok(())
    }

    async fn retrieval_reference(&self, key: &str, _ttl: Duration) -> Result<Option<RetrievalReference>, StorageError> {
        if !self.contains(key) {
            return Err(StorageError::NotFound(key.to_string()));
        }
        Ok(Some(RetrievalReference {
            url: format!("memory://{}", key),
            expires_at: None,
        }))
    }
}

/// Activity log kept in append order.
#[derive(Debug, Default)]
pub struct InMemoryActivityLog {
    events: RwLock<Vec<ActivityEvent>>,
}

impl InMemoryActivityLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> Vec<ActivityEvent> {
        self.events.read().clone()
    }
}

#[async_trait]
impl ActivityLog for InMemoryActivityLog {
    async fn append(&self, event: &ActivityEvent) -> Result<(), ActivityError> {
        self.events.write().push(event.clone());
        Ok(())
    }

    fn query(&self, filter: ActivityFilter) -> BoxStream<'_, Result<ActivityEvent, ActivityError>> {
        let matching: Vec<ActivityEvent> = self
            .events
            .read()
            .iter()
            .filter(|e| filter.matches(e))
            .cloned()
            .collect();
        stream::iter(matching.into_iter().map(Ok)).boxed()
    }
}
