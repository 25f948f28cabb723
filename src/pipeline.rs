//! The engagement pipeline: upload, moderation, counters, comments and deletion.
//!
//! All state lives behind the injected backends. Counter and comment
//! mutations go through the store's atomic primitives only; the like
//! relation is the one compound check-then-act and is a single conditional
//! insert in the relation store.

use crate::{
    dispatch::SideEffects,
    domain::{FileStorage, LabelExtractor, MemeRepository, ModerationEngine, RelationRepository},
    errors::{PipelineError, RepoError, StorageError},
    models::{
        AccountAction, ActivityEvent, ActivityKind, Comment, CommentRef, CommentRemoval, CounterField, Download,
        LikeOutcome, Meme, MemeView, NewMeme, RelationKind, SaveState,
    },
    notifications::Notification,
};
use chrono::Utc;
use serde_json::json;
use std::{sync::Arc, time::Duration};
use uuid::Uuid;

const DEFAULT_CATEGORY: &str = "Uncategorized";
const DEFAULT_CONTENT_TYPE: &str = "image/jpeg";

/// Storage and classifier backends the pipeline runs against.
#[derive(Clone)]
pub struct Backends {
    pub memes: Arc<dyn MemeRepository>,
    pub relations: Arc<dyn RelationRepository>,
    pub storage: Arc<dyn FileStorage>,
    pub moderation: Arc<dyn ModerationEngine>,
    pub extractor: Arc<dyn LabelExtractor>,
}

#[derive(Debug, Clone, Copy)]
pub struct PipelineSettings {
    pub min_confidence: f32,
    pub retrieval_ttl: Duration,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            min_confidence: crate::config::DEFAULT_MIN_CONFIDENCE,
            retrieval_ttl: Duration::from_secs(3600),
        }
    }
}

pub struct EngagementPipeline {
    backends: Backends,
    side_effects: SideEffects,
    settings: PipelineSettings,
}

impl EngagementPipeline {
    pub fn new(backends: Backends, side_effects: SideEffects, settings: PipelineSettings) -> Self {
        Self {
            backends,
            side_effects,
            settings,
        }
    }

    pub fn side_effects(&self) -> &SideEffects {
        &self.side_effects
    }

    /// Moderates, enriches and persists an upload. Rejected memes are stored too, flagged.
    pub async fn upload(&self, upload: NewMeme) -> Result<Meme, PipelineError> {
        if upload.bytes.is_empty() {
            return Err(PipelineError::InvalidInput("image data cannot be empty".to_string()));
        }
        if upload.owner.trim().is_empty() {
            return Err(PipelineError::InvalidInput("owner identity is required".to_string()));
        }

        let meme_id = Uuid::new_v4();
        tracing::debug!(%meme_id, owner = %upload.owner, size_bytes = upload.bytes.len(), "Upload pending moderation");

        // Classifier calls run before any store access and never fail.
        let decision = self
            .backends
            .moderation
            .classify(&upload.bytes, self.settings.min_confidence)
            .await;
        let extraction = self.backends.extractor.extract(&upload.bytes).await;

        let filename = upload
            .filename
            .filter(|f| !f.trim().is_empty())
            .unwrap_or_else(|| format!("{}.jpg", meme_id));
        let content_type = upload
            .content_type
            .filter(|c| !c.trim().is_empty())
            .or_else(|| mime_guess::from_path(&filename).first_raw().map(str::to_string))
            .unwrap_or_else(|| DEFAULT_CONTENT_TYPE.to_string());
        let image_key = format!("memes/{}/{}", meme_id, sanitize_filename(&filename));

        self.backends
            .storage
            .upload(&image_key, upload.bytes, Some(content_type.clone()))
            .await?;

        let category = match upload.category.trim() {
            "" => DEFAULT_CATEGORY.to_string(),
            c => c.to_string(),
        };
        let meme = Meme {
            meme_id,
            owner: upload.owner,
            title: upload.title,
            description: upload.description,
            category,
            tags: normalize_tags(upload.tags),
            image_key,
            filename,
            content_type,
            labels: extraction.labels,
            detected_text: extraction.text,
            status: decision.status(),
            reject_reasons: decision.reasons,
            likes: 0,
            views: 0,
            downloads: 0,
            created_at: Utc::now(),
            comments: Vec::new(),
        };

        if let Err(e) = self.backends.memes.create(&meme).await {
            tracing::error!(%meme_id, error = %e, "Failed to store meme metadata, removing uploaded blob");
            if let Err(cleanup) = self.backends.storage.delete(&meme.image_key).await {
                tracing::warn!(%meme_id, image_key = %meme.image_key, error = %cleanup, "Blob cleanup failed");
            }
            return Err(e.into());
        }

        self.side_effects.record(ActivityEvent::new(
            ActivityKind::Upload,
            &meme.owner,
            json!({
                "meme_id": meme.meme_id.to_string(),
                "status": meme.status.as_str(),
                "reasons": meme.reject_reasons,
                "labels": meme.labels,
            }),
        ));
        let notification = if meme.is_approved() {
            Notification::upload_approved(&meme)
        } else {
            Notification::upload_rejected(&meme)
        };
        self.side_effects.notify(notification);

        tracing::info!(%meme_id, status = %meme.status, reasons = meme.reject_reasons.len(), "Meme created");
        Ok(meme)
    }

    /// Reads a meme and counts the view. A missing meme is not mutated.
    pub async fn view(&self, meme_id: Uuid, viewer: Option<&str>) -> Result<MemeView, PipelineError> {
        let mut meme = self.require(meme_id).await?;
        meme.views = self
            .backends
            .memes
            .increment_counter(meme_id, CounterField::Views)
            .await?;

        if let Some(viewer) = viewer {
            self.side_effects.record(ActivityEvent::new(
                ActivityKind::View,
                viewer,
                json!({ "meme_id": meme_id.to_string() }),
            ));
        }
        Ok(self.with_reference(meme).await)
    }

    /// Counts at most one like per (meme, liker).
    pub async fn like(&self, meme_id: Uuid, liker: &str) -> Result<LikeOutcome, PipelineError> {
        self.require(meme_id).await?;

        let inserted = self
            .backends
            .relations
            .insert_if_absent(RelationKind::Like, meme_id, liker)
            .await?;
        if !inserted {
            tracing::debug!(%meme_id, liker, "Repeated like ignored");
            return Ok(LikeOutcome::AlreadyLiked);
        }

        match self.backends.memes.increment_counter(meme_id, CounterField::Likes).await {
            Ok(likes) => {
                tracing::debug!(%meme_id, likes, "Like counted");
            }
            Err(RepoError::NotFound(id)) => {
                // Deleted in between: nothing was counted, drop the stray relation.
                if let Err(rollback) = self.backends.relations.remove(RelationKind::Like, meme_id, liker).await {
                    tracing::error!(%meme_id, liker, error = %rollback, "Like relation rollback failed");
                }
                return Err(PipelineError::NotFound(id));
            }
            Err(e) => {
                // The increment may have been applied; keeping the relation can only undercount.
                tracing::warn!(%meme_id, liker, error = %e, "Like increment outcome unknown, relation kept");
                return Err(e.into());
            }
        }

        self.side_effects.record(ActivityEvent::new(
            ActivityKind::Like,
            liker,
            json!({ "meme_id": meme_id.to_string() }),
        ));
        Ok(LikeOutcome::Counted)
    }

    /// Hands out a retrieval reference for approved memes and counts the download.
    pub async fn download(&self, meme_id: Uuid, requester: &str) -> Result<Download, PipelineError> {
        let meme = match self.backends.memes.get_by_id(meme_id).await? {
            Some(meme) if meme.is_approved() => meme,
            _ => return Err(PipelineError::NotAvailable(meme_id)),
        };

        let reference = self
            .backends
            .storage
            .retrieval_reference(&meme.image_key, self.settings.retrieval_ttl)
            .await
            .map_err(|e| blob_error(meme_id, e))?;
        if reference.is_none() {
            tracing::info!(%meme_id, "Blob backend has no retrieval support, download not implemented");
        }

        let downloads = self
            .backends
            .memes
            .increment_counter(meme_id, CounterField::Downloads)
            .await?;
        self.side_effects.record(ActivityEvent::new(
            ActivityKind::Download,
            requester,
            json!({ "meme_id": meme_id.to_string() }),
        ));

        Ok(Download {
            meme_id,
            downloads,
            reference,
        })
    }

    /// Raw image bytes of an approved meme.
    pub async fn fetch_image(&self, meme_id: Uuid) -> Result<(Vec<u8>, String), PipelineError> {
        let meme = match self.backends.memes.get_by_id(meme_id).await? {
            Some(meme) if meme.is_approved() => meme,
            _ => return Err(PipelineError::NotAvailable(meme_id)),
        };
        let (bytes, content_type) = self
            .backends
            .storage
            .download(&meme.image_key)
            .await
            .map_err(|e| blob_error(meme_id, e))?;
        Ok((bytes, content_type.unwrap_or(meme.content_type)))
    }

    pub async fn comment(&self, meme_id: Uuid, author: &str, text: &str) -> Result<Comment, PipelineError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(PipelineError::InvalidInput("comment text cannot be empty".to_string()));
        }
        self.require(meme_id).await?;

        let comment = Comment::new(author, text);
        self.backends.memes.append_comment(meme_id, &comment).await?;
        self.side_effects.record(ActivityEvent::new(
            ActivityKind::Comment,
            author,
            json!({ "meme_id": meme_id.to_string(), "comment_id": comment.comment_id.to_string() }),
        ));
        Ok(comment)
    }

    /// Removes a comment if `author` wrote it. Requests from anyone else change nothing.
    pub async fn delete_comment(
        &self,
        meme_id: Uuid,
        author: &str,
        comment_ref: CommentRef,
    ) -> Result<CommentRemoval, PipelineError> {
        let meme = self.require(meme_id).await?;
        let comment = match comment_ref {
            CommentRef::Index(index) => meme.comments.get(index),
            CommentRef::Id(id) => meme.comments.iter().find(|c| c.comment_id == id),
        }
        .ok_or(PipelineError::CommentNotFound { meme_id })?;

        if comment.author != author {
            tracing::info!(%meme_id, comment_id = %comment.comment_id, requester = author, "Ignoring comment removal by non-author");
            return Ok(CommentRemoval::Ignored);
        }

        // By id: indexes shift under concurrent removals.
        if !self.backends.memes.remove_comment(meme_id, comment.comment_id).await? {
            return Err(PipelineError::CommentNotFound { meme_id });
        }
        self.side_effects.record(ActivityEvent::new(
            ActivityKind::DeleteComment,
            author,
            json!({ "meme_id": meme_id.to_string(), "comment_id": comment.comment_id.to_string() }),
        ));
        Ok(CommentRemoval::Removed)
    }

    /// Owner-only. Blob removal is best-effort; the metadata is deleted regardless.
    pub async fn delete_meme(&self, meme_id: Uuid, requester: &str) -> Result<(), PipelineError> {
        let meme = self.require(meme_id).await?;
        if !meme.is_owned_by(requester) {
            tracing::warn!(%meme_id, requester, "Rejected delete by non-owner");
            return Err(PipelineError::Forbidden {
                meme_id,
                identity: requester.to_string(),
            });
        }

        match self.backends.storage.delete(&meme.image_key).await {
            Ok(()) => tracing::debug!(image_key = %meme.image_key, "Deleted image from storage (or it was already gone)"),
            Err(e) => tracing::warn!(image_key = %meme.image_key, error = %e, "Failed to delete image, proceeding with metadata deletion"),
        }

        self.backends.memes.delete(meme_id).await?;

        if let Err(e) = self.backends.relations.purge_meme(meme_id).await {
            tracing::warn!(%meme_id, error = %e, "Failed to purge likes/saves of deleted meme");
        }
        self.side_effects.record(ActivityEvent::new(
            ActivityKind::Delete,
            requester,
            json!({ "meme_id": meme_id.to_string() }),
        ));
        tracing::info!(%meme_id, "Meme deleted");
        Ok(())
    }

    pub async fn list_owned(&self, owner: &str) -> Result<Vec<MemeView>, PipelineError> {
        let memes = self.backends.memes.list_by_owner(owner).await?;
        let mut views = Vec::with_capacity(memes.len());
        for meme in memes {
            views.push(self.with_reference(meme).await);
        }
        Ok(views)
    }

    /// Flips the saved state of a meme for `user`.
    pub async fn toggle_save(&self, meme_id: Uuid, user: &str) -> Result<SaveState, PipelineError> {
        self.require(meme_id).await?;
        let relations = &self.backends.relations;

        let state = if relations.insert_if_absent(RelationKind::Save, meme_id, user).await? {
            SaveState::Saved
        } else {
            relations.remove(RelationKind::Save, meme_id, user).await?;
            SaveState::Unsaved
        };

        let action = match state {
            SaveState::Saved => ActivityKind::Save,
            SaveState::Unsaved => ActivityKind::Unsave,
        };
        self.side_effects
            .record(ActivityEvent::new(action, user, json!({ "meme_id": meme_id.to_string() })));
        Ok(state)
    }

    /// Saved memes that still exist.
    pub async fn list_saved(&self, user: &str) -> Result<Vec<MemeView>, PipelineError> {
        let ids = self.backends.relations.list_for_user(RelationKind::Save, user).await?;
        let mut saved = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(meme) = self.backends.memes.get_by_id(id).await? {
                saved.push(self.with_reference(meme).await);
            }
        }
        saved.sort_by(|a, b| a.meme.created_at.cmp(&b.meme.created_at));
        Ok(saved)
    }

    /// Audits an account action reported by the auth layer; registrations also notify.
    pub fn record_account_activity(&self, action: AccountAction, email: &str) {
        self.side_effects
            .record(ActivityEvent::new(action.into(), email, serde_json::Value::Null));
        if action == AccountAction::Register {
            self.side_effects.notify(Notification::registered(email, Utc::now()));
        }
    }

    async fn require(&self, meme_id: Uuid) -> Result<Meme, PipelineError> {
        self.backends
            .memes
            .get_by_id(meme_id)
            .await?
            .ok_or(PipelineError::NotFound(meme_id))
    }

    async fn with_reference(&self, meme: Meme) -> MemeView {
        let url = if meme.is_approved() {
            match self
                .backends
                .storage
                .retrieval_reference(&meme.image_key, self.settings.retrieval_ttl)
                .await
            {
                Ok(url) => url,
                Err(e) => {
                    tracing::warn!(meme_id = %meme.meme_id, error = %e, "Could not create retrieval reference");
                    None
                }
            }
        } else {
            None
        };
        MemeView { meme, url }
    }
}

/// A blob missing under an existing record will not come back on retry.
fn blob_error(meme_id: Uuid, err: StorageError) -> PipelineError {
    match err {
        StorageError::NotFound(key) => {
            tracing::error!(%meme_id, image_key = %key, "Blob missing for stored meme");
            PipelineError::NotAvailable(meme_id)
        }
        e => e.into(),
    }
}

fn normalize_tags(tags: Vec<String>) -> Vec<String> {
    tags.into_iter()
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
        .collect()
}

/// Keeps blob keys to a single path segment of safe characters.
fn sanitize_filename(name: &str) -> String {
    let base = name.rsplit(['/', '\\']).next().unwrap_or(name);
    let cleaned: String = base
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') { c } else { '_' })
        .collect();
    let cleaned = cleaned.trim_matches('.').to_string();
    if cleaned.is_empty() {
        "image".to_string()
    } else {
        cleaned
    }
}
