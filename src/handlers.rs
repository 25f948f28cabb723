use crate::{
    errors::AppError,
    models::{AccountAction, ActivityEvent, ActivityFilter, ActivityKind, CommentRef, Download, NewMeme},
    AppState,
};
use axum::{
    extract::{multipart::MultipartError, FromRequestParts, Multipart, OptionalFromRequestParts, Path, Query, State},
    http::{header, request::Parts, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use futures::{StreamExt, TryStreamExt};
use serde::Deserialize;
use std::{convert::Infallible, sync::Arc};
use tracing;
use uuid::Uuid;

pub const IDENTITY_HEADER: &str = "x-user-email";
const DEFAULT_ACTIVITY_LIMIT: usize = 100;
const MAX_ACTIVITY_LIMIT: usize = 1000;

/// Caller identity as asserted by the fronting auth layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity(pub String);

fn identity_from(parts: &Parts) -> Option<Identity> {
    parts
        .headers
        .get(IDENTITY_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(|v| Identity(v.to_string()))
}

impl<S: Send + Sync> FromRequestParts<S> for Identity {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        identity_from(parts).ok_or(AppError::Unauthenticated)
    }
}

impl<S: Send + Sync> OptionalFromRequestParts<S> for Identity {
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Option<Self>, Self::Rejection> {
        Ok(identity_from(parts))
    }
}

fn field_error(what: &'static str) -> impl Fn(MultipartError) -> AppError {
    move |e| AppError::InvalidInput(format!("Failed to read {}: {}", what, e))
}

fn parse_id(raw: &str) -> Result<Uuid, AppError> {
    Ok(Uuid::parse_str(raw)?)
}

pub async fn health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

/// POST /memes (multipart: title, description, category, tags, image)
pub async fn upload_meme(
    State(state): State<Arc<AppState>>,
    Identity(owner): Identity,
    mut multipart: Multipart,
) -> Result<impl IntoResponse, AppError> {
    let mut title = None;
    let mut description = None;
    let mut category = None;
    let mut tags = None;
    let mut image_data: Option<Vec<u8>> = None;
    let mut image_filename: Option<String> = None;
    let mut image_content_type: Option<String> = None;

    while let Some(field) = multipart.next_field().await? {
        let field_name = match field.name() {
            Some(name) => name.to_string(),
            None => continue,
        };
        match field_name.as_str() {
            "title" => title = Some(field.text().await.map_err(field_error("title"))?),
            "description" => description = Some(field.text().await.map_err(field_error("description"))?),
            "category" => category = Some(field.text().await.map_err(field_error("category"))?),
            "tags" => tags = Some(field.text().await.map_err(field_error("tags"))?),
            "image" => {
                image_filename = field.file_name().map(|s| s.to_string());
                image_content_type = field.content_type().map(|m| m.to_string());
                image_data = Some(field.bytes().await?.to_vec());
            }
            _ => tracing::debug!("Ignoring unknown multipart field: {}", field_name),
        }
    }

    let image_data = image_data.ok_or_else(|| AppError::MissingFormField("image".to_string()))?;
    let title = title
        .filter(|t| !t.trim().is_empty())
        .or_else(|| image_filename.clone())
        .ok_or_else(|| AppError::MissingFormField("title".to_string()))?;

    let upload = NewMeme {
        owner,
        title,
        description: description.unwrap_or_default(),
        category: category.unwrap_or_default(),
        tags: tags
            .map(|raw| raw.split(',').map(str::to_string).collect())
            .unwrap_or_default(),
        bytes: image_data,
        filename: image_filename,
        content_type: image_content_type,
    };

    let meme = state.pipeline.upload(upload).await?;
    tracing::info!(meme_id = %meme.meme_id, status = %meme.status, "Meme created via handler");
    Ok((StatusCode::CREATED, Json(meme)))
}

/// GET /memes/{id}. Anonymous reads are counted but not audited.
pub async fn get_meme(
    State(state): State<Arc<AppState>>,
    viewer: Option<Identity>,
    Path(id_str): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let meme_id = parse_id(&id_str)?;
    tracing::debug!(%meme_id, "Fetching meme details via handler");
    let view = state
        .pipeline
        .view(meme_id, viewer.as_ref().map(|Identity(v)| v.as_str()))
        .await?;
    Ok(Json(view))
}

/// Owner-only delete of the meme, its image and its relations.
pub async fn delete_meme(
    State(state): State<Arc<AppState>>,
    Identity(requester): Identity,
    Path(id_str): Path<String>,
) -> Result<StatusCode, AppError> {
    let meme_id = parse_id(&id_str)?;
    tracing::debug!(%meme_id, "Deleting meme via handler");
    state.pipeline.delete_meme(meme_id, &requester).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn like_meme(
    State(state): State<Arc<AppState>>,
    Identity(liker): Identity,
    Path(id_str): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let meme_id = parse_id(&id_str)?;
    let outcome = state.pipeline.like(meme_id, &liker).await?;
    Ok(Json(serde_json::json!({ "meme_id": meme_id, "result": outcome })))
}

/// Returns the retrieval reference, or 501 when the blob backend cannot produce one.
pub async fn download_meme(
    State(state): State<Arc<AppState>>,
    Identity(requester): Identity,
    Path(id_str): Path<String>,
) -> Result<(StatusCode, Json<Download>), AppError> {
    let meme_id = parse_id(&id_str)?;
    let download = state.pipeline.download(meme_id, &requester).await?;
    let status = if download.reference.is_some() {
        StatusCode::OK
    } else {
        StatusCode::NOT_IMPLEMENTED
    };
    Ok((status, Json(download)))
}

/// Handler for GET /memes/{id}/image
pub async fn get_image(
    State(state): State<Arc<AppState>>,
    Path(id_str): Path<String>,
) -> Result<Response, AppError> {
    let meme_id = parse_id(&id_str)?;
    tracing::debug!(%meme_id, "Fetching image file via handler");

    let (bytes, content_type) = state.pipeline.fetch_image(meme_id).await?;
    Ok(([(header::CONTENT_TYPE, content_type)], bytes).into_response())
}

#[derive(Debug, Deserialize)]
pub struct CommentBody {
    pub text: String,
}

pub async fn add_comment(
    State(state): State<Arc<AppState>>,
    Identity(author): Identity,
    Path(id_str): Path<String>,
    Json(body): Json<CommentBody>,
) -> Result<impl IntoResponse, AppError> {
    let meme_id = parse_id(&id_str)?;
    let comment = state.pipeline.comment(meme_id, &author, &body.text).await?;
    Ok((StatusCode::CREATED, Json(comment)))
}

/// `comment_ref` is a comment id or a position in the comment list.
pub async fn delete_comment(
    State(state): State<Arc<AppState>>,
    Identity(author): Identity,
    Path((id_str, comment_ref)): Path<(String, String)>,
) -> Result<impl IntoResponse, AppError> {
    let meme_id = parse_id(&id_str)?;
    let comment_ref: CommentRef = comment_ref.parse().map_err(AppError::InvalidInput)?;
    let removal = state.pipeline.delete_comment(meme_id, &author, comment_ref).await?;
    Ok(Json(serde_json::json!({ "meme_id": meme_id, "result": removal })))
}

pub async fn toggle_save(
    State(state): State<Arc<AppState>>,
    Identity(user): Identity,
    Path(id_str): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let meme_id = parse_id(&id_str)?;
    let saved = state.pipeline.toggle_save(meme_id, &user).await?;
    Ok(Json(serde_json::json!({ "meme_id": meme_id, "state": saved })))
}

pub async fn list_my_memes(
    State(state): State<Arc<AppState>>,
    Identity(owner): Identity,
) -> Result<impl IntoResponse, AppError> {
    let memes = state.pipeline.list_owned(&owner).await?;
    tracing::debug!(owner, count = memes.len(), "Listed own memes via handler");
    Ok(Json(memes))
}

pub async fn list_saved(
    State(state): State<Arc<AppState>>,
    Identity(user): Identity,
) -> Result<impl IntoResponse, AppError> {
    Ok(Json(state.pipeline.list_saved(&user).await?))
}

/// POST /me/account/{action}, called by the auth layer after register/login/logout.
pub async fn record_account_event(
    State(state): State<Arc<AppState>>,
    Identity(email): Identity,
    Path(action): Path<String>,
) -> Result<StatusCode, AppError> {
    let action = match action.as_str() {
        "register" => AccountAction::Register,
        "login" => AccountAction::Login,
        "logout" => AccountAction::Logout,
        other => return Err(AppError::InvalidInput(format!("unknown account action '{}'", other))),
    };
    state.pipeline.record_account_activity(action, &email);
    Ok(StatusCode::ACCEPTED)
}

#[derive(Debug, Default, Deserialize)]
pub struct ActivityQuery {
    pub action: Option<ActivityKind>,
    pub actor: Option<String>,
    pub meme_id: Option<Uuid>,
    pub limit: Option<usize>,
}

/// GET /activity?action=&actor=&meme_id=&limit=
pub async fn list_activity(
    State(state): State<Arc<AppState>>,
    Identity(reader): Identity,
    Query(query): Query<ActivityQuery>,
) -> Result<Json<Vec<ActivityEvent>>, AppError> {
    tracing::debug!(reader = %reader, ?query, "Reading activity log");
    let limit = query.limit.unwrap_or(DEFAULT_ACTIVITY_LIMIT).min(MAX_ACTIVITY_LIMIT);
    let filter = ActivityFilter {
        action: query.action,
        actor: query.actor,
        meme_id: query.meme_id,
    };

    let events: Vec<ActivityEvent> = state.activity_log.query(filter).take(limit).try_collect().await?;
    Ok(Json(events))
}
