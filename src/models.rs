use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};
use uuid::Uuid;

/// Moderation outcome folded into a meme at creation time. Never changes afterwards.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MemeStatus {
    Approved,
    Rejected,
}

impl MemeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MemeStatus::Approved => "approved",
            MemeStatus::Rejected => "rejected",
        }
    }
}

impl FromStr for MemeStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "approved" => Ok(MemeStatus::Approved),
            "rejected" => Ok(MemeStatus::Rejected),
            other => Err(format!("unknown meme status '{}'", other)),
        }
    }
}

impl fmt::Display for MemeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A disallowed label that caused a rejection.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct RejectReason {
    pub label: String,
    pub confidence: f32,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Comment {
    pub comment_id: Uuid,
    pub author: String,
    pub text: String,
    pub created_at: DateTime<Utc>,
}

impl Comment {
    pub fn new(author: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            comment_id: Uuid::new_v4(),
            author: author.into(),
            text: text.into(),
            created_at: Utc::now(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Meme {
    pub meme_id: Uuid,
    pub owner: String,
    pub title: String,
    pub description: String,
    pub category: String,
    pub tags: Vec<String>,
    /// Blob store key of the image bytes.
    pub image_key: String,
    pub filename: String,
    pub content_type: String,
    pub labels: Vec<String>,
    pub detected_text: String,
    pub status: MemeStatus,
    pub reject_reasons: Vec<RejectReason>,
    pub likes: u64,
    pub views: u64,
    pub downloads: u64,
    pub created_at: DateTime<Utc>,
    pub comments: Vec<Comment>,
}

impl Meme {
    pub fn is_approved(&self) -> bool {
        self.status == MemeStatus::Approved
    }

    pub fn is_owned_by(&self, identity: &str) -> bool {
        self.owner == identity
    }
}

/// Caller-supplied fields of an upload.
#[derive(Debug, Clone, Default)]
pub struct NewMeme {
    pub owner: String,
    pub title: String,
    pub description: String,
    pub category: String,
    pub tags: Vec<String>,
    pub bytes: Vec<u8>,
    pub filename: Option<String>,
    pub content_type: Option<String>,
}

/// Engagement counters stored on a meme.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CounterField {
    Likes,
    Views,
    Downloads,
}

impl CounterField {
    pub fn attribute_name(&self) -> &'static str {
        match self {
            CounterField::Likes => "likes",
            CounterField::Views => "views",
            CounterField::Downloads => "downloads",
        }
    }
}

/// How a caller addresses a comment within a meme.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommentRef {
    Index(usize),
    Id(Uuid),
}

impl FromStr for CommentRef {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Ok(id) = Uuid::parse_str(s) {
            return Ok(CommentRef::Id(id));
        }
        s.parse::<usize>()
            .map(CommentRef::Index)
            .map_err(|_| format!("'{}' is neither a comment id nor a comment index", s))
    }
}

/// (meme, user) relations kept outside the meme record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RelationKind {
    Like,
    Save,
}

impl RelationKind {
    pub const ALL: [RelationKind; 2] = [RelationKind::Like, RelationKind::Save];

    pub fn as_str(&self) -> &'static str {
        match self {
            RelationKind::Like => "like",
            RelationKind::Save => "save",
        }
    }
}

/// Transient result of a moderation check.
#[derive(Debug, Clone, PartialEq)]
pub struct ModerationDecision {
    pub approved: bool,
    pub reasons: Vec<RejectReason>,
}

impl ModerationDecision {
    pub fn approve() -> Self {
        Self {
            approved: true,
            reasons: Vec::new(),
        }
    }

    pub fn status(&self) -> MemeStatus {
        if self.approved {
            MemeStatus::Approved
        } else {
            MemeStatus::Rejected
        }
    }
}

/// A label reported by a classifier, before any policy is applied.
#[derive(Debug, Clone, PartialEq)]
pub struct DetectedLabel {
    pub name: String,
    pub confidence: f32,
}

/// Search enrichment. Empty on extractor failure.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Extraction {
    pub labels: Vec<String>,
    pub text: String,
}

/// Pointer a client uses to fetch image bytes.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct RetrievalReference {
    pub url: String,
    pub expires_at: Option<DateTime<Utc>>,
}

/// A meme as handed back to readers, with a retrieval reference for approved content.
#[derive(Serialize, Debug, Clone)]
pub struct MemeView {
    #[serde(flatten)]
    pub meme: Meme,
    pub url: Option<RetrievalReference>,
}

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LikeOutcome {
    Counted,
    AlreadyLiked,
}

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CommentRemoval {
    Removed,
    /// Requester is not the author; nothing changed.
    Ignored,
}

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SaveState {
    Saved,
    Unsaved,
}

#[derive(Serialize, Debug, Clone)]
pub struct Download {
    pub meme_id: Uuid,
    pub downloads: u64,
    /// `None` when the blob backend cannot hand out references.
    pub reference: Option<RetrievalReference>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ActivityKind {
    Register,
    Login,
    Logout,
    Upload,
    View,
    Like,
    Download,
    Comment,
    DeleteComment,
    Delete,
    Save,
    Unsave,
}

impl ActivityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActivityKind::Register => "register",
            ActivityKind::Login => "login",
            ActivityKind::Logout => "logout",
            ActivityKind::Upload => "upload",
            ActivityKind::View => "view",
            ActivityKind::Like => "like",
            ActivityKind::Download => "download",
            ActivityKind::Comment => "comment",
            ActivityKind::DeleteComment => "delete_comment",
            ActivityKind::Delete => "delete",
            ActivityKind::Save => "save",
            ActivityKind::Unsave => "unsave",
        }
    }
}

impl FromStr for ActivityKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let kind = match s {
            "register" => ActivityKind::Register,
            "login" => ActivityKind::Login,
            "logout" => ActivityKind::Logout,
            "upload" => ActivityKind::Upload,
            "view" => ActivityKind::View,
            "like" => ActivityKind::Like,
            "download" => ActivityKind::Download,
            "comment" => ActivityKind::Comment,
            "delete_comment" => ActivityKind::DeleteComment,
            "delete" => ActivityKind::Delete,
            "save" => ActivityKind::Save,
            "unsave" => ActivityKind::Unsave,
            other => return Err(format!("unknown activity kind '{}'", other)),
        };
        Ok(kind)
    }
}

/// Account-level actions reported by the (external) auth layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccountAction {
    Register,
    Login,
    Logout,
}

impl From<AccountAction> for ActivityKind {
    fn from(action: AccountAction) -> Self {
        match action {
            AccountAction::Register => ActivityKind::Register,
            AccountAction::Login => ActivityKind::Login,
            AccountAction::Logout => ActivityKind::Logout,
        }
    }
}

/// Immutable audit record.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ActivityEvent {
    pub log_id: Uuid,
    pub ts: DateTime<Utc>,
    pub action: ActivityKind,
    pub actor: String,
    pub meta: serde_json::Map<String, serde_json::Value>,
}

impl ActivityEvent {
    pub fn new(action: ActivityKind, actor: impl Into<String>, meta: serde_json::Value) -> Self {
        let meta = match meta {
            serde_json::Value::Object(map) => map,
            serde_json::Value::Null => serde_json::Map::new(),
            other => {
                let mut map = serde_json::Map::new();
                map.insert("value".to_string(), other);
                map
            }
        };
        Self {
            log_id: Uuid::new_v4(),
            ts: Utc::now(),
            action,
            actor: actor.into(),
            meta,
        }
    }

    pub fn meme_id(&self) -> Option<Uuid> {
        self.meta
            .get("meme_id")
            .and_then(|v| v.as_str())
            .and_then(|s| Uuid::parse_str(s).ok())
    }
}

/// Read-side filter over the activity log. Empty filter matches everything.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct ActivityFilter {
    pub action: Option<ActivityKind>,
    pub actor: Option<String>,
    pub meme_id: Option<Uuid>,
}

impl ActivityFilter {
    pub fn matches(&self, event: &ActivityEvent) -> bool {
        self.action.is_none_or(|a| a == event.action)
            && self.actor.as_deref().is_none_or(|a| a == event.actor)
            && self.meme_id.is_none_or(|id| event.meme_id() == Some(id))
    }
}
