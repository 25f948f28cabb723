use crate::{
    domain::{MemeRepository, RelationRepository},
    errors::RepoError,
    models::{Comment, CounterField, Meme, MemeStatus, RejectReason, RelationKind},
};
use anyhow::Context;
use async_trait::async_trait;
use aws_sdk_dynamodb::{
    error::SdkError,
    types::{AttributeValue, ReturnValue},
    Client as DynamoDbClient,
};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tracing::{self, info};
use uuid::Uuid;

/// GSI on the memes table: partition `owner`, sort `created_at`.
pub const OWNER_INDEX: &str = "owner-created_at-index";
/// GSI on the relations table: partition `user`, sort `relation_key`.
pub const USER_RELATION_INDEX: &str = "user-relation-index";

const REMOVE_COMMENT_ATTEMPTS: usize = 3;

type Item = HashMap<String, AttributeValue>;

#[derive(Debug, Clone)]
pub struct DynamoDbMemeRepository {
    client: DynamoDbClient,
    table_name: String, // Store the table name
}

impl DynamoDbMemeRepository {
    /// Creates a new repository instance configured for a specific table.
    pub fn new(client: DynamoDbClient, table_name: String) -> Self {
        info!(%table_name, "Initializing DynamoDbMemeRepository");
        Self { client, table_name }
    }

    fn key(id: Uuid) -> (String, AttributeValue) {
        ("meme_id".to_string(), AttributeValue::S(id.to_string()))
    }
}

#[async_trait]
impl MemeRepository for DynamoDbMemeRepository {
    /// Stores a `Meme` using a PutItem that refuses to overwrite an existing id.
    async fn create(&self, meme: &Meme) -> Result<(), RepoError> {
        let result = self.client
            .put_item()
            .table_name(&self.table_name)
            .set_item(Some(meme_to_item(meme)))
            .condition_expression("attribute_not_exists(meme_id)")
            .send()
            .await;

        match result {
            Ok(_) => Ok(()),
            Err(SdkError::ServiceError(service_err)) if service_err.err().is_conditional_check_failed_exception() => {
                Err(RepoError::Duplicate(meme.meme_id))
            }
            Err(e) => Err(RepoError::BackendError(anyhow::Error::new(e).context(format!(
                "DynamoDB (table: {}): Failed to put meme (id: {})",
                self.table_name, meme.meme_id
            )))),
        }
    }

    /// Retrieves a `Meme` from DynamoDB using a consistent GetItem.
    async fn get_by_id(&self, id: Uuid) -> Result<Option<Meme>, RepoError> {
        let (key, value) = Self::key(id);
        let resp = self.client
            .get_item()
            .table_name(&self.table_name)
            .key(key, value)
            .consistent_read(true)
            .send()
            .await
            .context(format!("DynamoDB (table: {}): Failed to get meme (id: {})", self.table_name, id))?;

        match resp.item {
            Some(item) => match item_to_meme(&item) {
                Some(meme) => Ok(Some(meme)),
                None => {
                    tracing::error!(meme_id = %id, table_name = %self.table_name, "DynamoDB: Retrieved item but failed to parse into Meme");
                    Err(RepoError::DataCorruption(format!(
                        "Failed to parse meme data retrieved from DynamoDB table '{}' for id {}",
                        self.table_name, id
                    )))
                }
            },
            None => Ok(None), // Item not found is not an error
        }
    }

    /// Queries the owner index, oldest first. Handles pagination.
    async fn list_by_owner(&self, owner: &str) -> Result<Vec<Meme>, RepoError> {
        let mut memes: Vec<Meme> = Vec::new();
        let mut last_evaluated_key: Option<Item> = None;

        loop {
            let resp = self.client
                .query()
                .table_name(&self.table_name)
                .index_name(OWNER_INDEX)
                .key_condition_expression("#owner = :owner")
                .expression_attribute_names("#owner", "owner")
                .expression_attribute_values(":owner", AttributeValue::S(owner.to_string()))
                .scan_index_forward(true)
                .set_exclusive_start_key(last_evaluated_key.take())
                .send()
                .await
                .context(format!("DynamoDB: Failed to query '{}' on index '{}'", self.table_name, OWNER_INDEX))?;

            for item in resp.items.unwrap_or_default() {
                match item_to_meme(&item) {
                    Some(meme) => memes.push(meme),
                    None => {
                        let item_id = item.get("meme_id").and_then(|v| v.as_s().ok());
                        tracing::error!(item.id = ?item_id, table_name = %self.table_name, "DynamoDB: Failed to parse queried item into Meme");
                        return Err(RepoError::DataCorruption(format!(
                            "DynamoDB: Failed to parse item {:?} from table '{}'",
                            item_id, self.table_name
                        )));
                    }
                }
            }

            last_evaluated_key = resp.last_evaluated_key;
            if last_evaluated_key.is_none() {
                break;
            }
            tracing::debug!("DynamoDB Query (table: {}): Continuing with LastEvaluatedKey...", self.table_name);
        }

        tracing::debug!(owner, count = memes.len(), "DynamoDB: Listed memes by owner");
        Ok(memes)
    }

    /// `ADD` update, conditional on the item existing, returning the new value.
    async fn increment_counter(&self, id: Uuid, field: CounterField) -> Result<u64, RepoError> {
        let (key, value) = Self::key(id);
        let result = self.client
            .update_item()
            .table_name(&self.table_name)
            .key(key, value)
            .update_expression("ADD #counter :inc")
            .condition_expression("attribute_exists(meme_id)")
            .expression_attribute_names("#counter", field.attribute_name())
            .expression_attribute_values(":inc", AttributeValue::N("1".to_string()))
            .return_values(ReturnValue::UpdatedNew)
            .send()
            .await;

        let output = match result {
            Ok(output) => output,
            Err(SdkError::ServiceError(service_err)) if service_err.err().is_conditional_check_failed_exception() => {
                return Err(RepoError::NotFound(id));
            }
            Err(e) => {
                return Err(RepoError::BackendError(anyhow::Error::new(e).context(format!(
                    "DynamoDB (table: {}): Failed to increment {} (id: {})",
                    self.table_name,
                    field.attribute_name(),
                    id
                ))))
            }
        };

        output
            .attributes
            .as_ref()
            .and_then(|attrs| number(attrs, field.attribute_name()))
            .ok_or_else(|| RepoError::DataCorruption(format!(
                "DynamoDB: UpdateItem returned no numeric '{}' for meme {}",
                field.attribute_name(),
                id
            )))
    }

    /// `list_append` update; DynamoDB applies it atomically per item.
    async fn append_comment(&self, id: Uuid, comment: &Comment) -> Result<(), RepoError> {
        let (key, value) = Self::key(id);
        let result = self.client
            .update_item()
            .table_name(&self.table_name)
            .key(key, value)
            .update_expression("SET comments = list_append(if_not_exists(comments, :empty), :c)")
            .condition_expression("attribute_exists(meme_id)")
            .expression_attribute_values(":empty", AttributeValue::L(Vec::new()))
            .expression_attribute_values(":c", AttributeValue::L(vec![comment_to_value(comment)]))
            .send()
            .await;

        match result {
            Ok(_) => Ok(()),
            Err(SdkError::ServiceError(service_err)) if service_err.err().is_conditional_check_failed_exception() => {
                Err(RepoError::NotFound(id))
            }
            Err(e) => Err(RepoError::BackendError(anyhow::Error::new(e).context(format!(
                "DynamoDB (table: {}): Failed to append comment (id: {})",
                self.table_name, id
            )))),
        }
    }

    /// Removes by position, guarded by a condition that the position still holds `comment_id`.
    /// Retries when a concurrent change moved the comment.
    async fn remove_comment(&self, id: Uuid, comment_id: Uuid) -> Result<bool, RepoError> {
        for attempt in 1..=REMOVE_COMMENT_ATTEMPTS {
            let Some(meme) = self.get_by_id(id).await? else {
                return Err(RepoError::NotFound(id));
            };
            let Some(index) = meme.comments.iter().position(|c| c.comment_id == comment_id) else {
                return Ok(false);
            };

            let (key, value) = Self::key(id);
            let result = self.client
                .update_item()
                .table_name(&self.table_name)
                .key(key, value)
                .update_expression(format!("REMOVE comments[{}]", index))
                .condition_expression(format!("comments[{}].comment_id = :cid", index))
                .expression_attribute_values(":cid", AttributeValue::S(comment_id.to_string()))
                .send()
                .await;

            match result {
                Ok(_) => return Ok(true),
                Err(SdkError::ServiceError(service_err)) if service_err.err().is_conditional_check_failed_exception() => {
                    tracing::debug!(meme_id = %id, %comment_id, attempt, "DynamoDB: Comment moved during removal, retrying");
                }
                Err(e) => {
                    return Err(RepoError::BackendError(anyhow::Error::new(e).context(format!(
                        "DynamoDB (table: {}): Failed to remove comment {} (id: {})",
                        self.table_name, comment_id, id
                    ))))
                }
            }
        }
        Err(RepoError::BackendError(anyhow::anyhow!(
            "DynamoDB (table: {}): Comment {} on meme {} kept moving, gave up after {} attempts",
            self.table_name,
            comment_id,
            id,
            REMOVE_COMMENT_ATTEMPTS
        )))
    }

    /// Deletes an item from DynamoDB using DeleteItem.
    async fn delete(&self, id: Uuid) -> Result<(), RepoError> {
        tracing::debug!(meme_id = %id, table_name = %self.table_name, "DynamoDB: Deleting item");
        let (key, value) = Self::key(id);

        self.client
            .delete_item()
            .table_name(&self.table_name)
            .key(key, value)
            // DeleteItem succeeds even if item not found
            .send()
            .await
            .context(format!("DynamoDB (table: {}): Failed to delete meme (id: {})", self.table_name, id))?;

        tracing::debug!(meme_id = %id, table_name = %self.table_name, "DynamoDB: Delete request sent");
        Ok(())
    }
}

/// Likes and saves. Partition key `relation_key` = `{kind}#{meme_id}`, sort key `user`.
#[derive(Debug, Clone)]
pub struct DynamoDbRelationRepository {
    client: DynamoDbClient,
    table_name: String,
}

impl DynamoDbRelationRepository {
    pub fn new(client: DynamoDbClient, table_name: String) -> Self {
        info!(%table_name, "Initializing DynamoDbRelationRepository");
        Self { client, table_name }
    }

    async fn users_for(&self, kind: RelationKind, meme_id: Uuid) -> Result<Vec<String>, RepoError> {
        let mut users = Vec::new();
        let mut last_evaluated_key: Option<Item> = None;
        loop {
            let resp = self.client
                .query()
                .table_name(&self.table_name)
                .key_condition_expression("relation_key = :rk")
                .expression_attribute_values(":rk", AttributeValue::S(relation_key(kind, meme_id)))
                .set_exclusive_start_key(last_evaluated_key.take())
                .send()
                .await
                .context(format!("DynamoDB: Failed to query relations in '{}'", self.table_name))?;

            users.extend(
                resp.items
                    .unwrap_or_default()
                    .iter()
                    .filter_map(|item| item.get("user").and_then(|v| v.as_s().ok()).cloned()),
            );
            last_evaluated_key = resp.last_evaluated_key;
            if last_evaluated_key.is_none() {
                return Ok(users);
            }
        }
    }
}

fn relation_key(kind: RelationKind, meme_id: Uuid) -> String {
    format!("{}#{}", kind.as_str(), meme_id)
}

fn relation_item_key(kind: RelationKind, meme_id: Uuid, user: &str) -> Item {
    HashMap::from([
        ("relation_key".to_string(), AttributeValue::S(relation_key(kind, meme_id))),
        ("user".to_string(), AttributeValue::S(user.to_string())),
    ])
}

#[async_trait]
impl RelationRepository for DynamoDbRelationRepository {
    /// Conditional PutItem: exactly one concurrent caller succeeds.
    async fn insert_if_absent(&self, kind: RelationKind, meme_id: Uuid, user: &str) -> Result<bool, RepoError> {
        let mut item = relation_item_key(kind, meme_id, user);
        item.insert("created_at".to_string(), AttributeValue::S(Utc::now().to_rfc3339()));

        let result = self.client
            .put_item()
            .table_name(&self.table_name)
            .set_item(Some(item))
            .condition_expression("attribute_not_exists(relation_key)")
            .send()
            .await;

        match result {
            Ok(_) => Ok(true),
            Err(SdkError::ServiceError(service_err)) if service_err.err().is_conditional_check_failed_exception() => Ok(false),
            Err(e) => Err(RepoError::BackendError(anyhow::Error::new(e).context(format!(
                "DynamoDB (table: {}): Failed to insert {} relation for meme {}",
                self.table_name,
                kind.as_str(),
                meme_id
            )))),
        }
    }

    async fn remove(&self, kind: RelationKind, meme_id: Uuid, user: &str) -> Result<bool, RepoError> {
        let resp = self.client
            .delete_item()
            .table_name(&self.table_name)
            .set_key(Some(relation_item_key(kind, meme_id, user)))
            .return_values(ReturnValue::AllOld)
            .send()
            .await
            .context(format!("DynamoDB (table: {}): Failed to delete {} relation", self.table_name, kind.as_str()))?;
        Ok(resp.attributes.is_some_and(|attrs| !attrs.is_empty()))
    }

    async fn list_for_user(&self, kind: RelationKind, user: &str) -> Result<Vec<Uuid>, RepoError> {
        let prefix = format!("{}#", kind.as_str());
        let mut ids = Vec::new();
        let mut last_evaluated_key: Option<Item> = None;
        loop {
            let resp = self.client
                .query()
                .table_name(&self.table_name)
                .index_name(USER_RELATION_INDEX)
                .key_condition_expression("#user = :user AND begins_with(relation_key, :prefix)")
                .expression_attribute_names("#user", "user")
                .expression_attribute_values(":user", AttributeValue::S(user.to_string()))
                .expression_attribute_values(":prefix", AttributeValue::S(prefix.clone()))
                .set_exclusive_start_key(last_evaluated_key.take())
                .send()
                .await
                .context(format!("DynamoDB: Failed to query '{}' on index '{}'", self.table_name, USER_RELATION_INDEX))?;

            for item in resp.items.unwrap_or_default() {
                let parsed = item
                    .get("relation_key")
                    .and_then(|v| v.as_s().ok())
                    .and_then(|rk| rk.strip_prefix(&prefix))
                    .and_then(|id| Uuid::parse_str(id).ok());
                match parsed {
                    Some(id) => ids.push(id),
                    None => tracing::warn!(table_name = %self.table_name, "DynamoDB: Skipping malformed relation item"),
                }
            }
            last_evaluated_key = resp.last_evaluated_key;
            if last_evaluated_key.is_none() {
                return Ok(ids);
            }
        }
    }

    async fn purge_meme(&self, meme_id: Uuid) -> Result<(), RepoError> {
        for kind in RelationKind::ALL {
            for user in self.users_for(kind, meme_id).await? {
                self.remove(kind, meme_id, &user).await?;
            }
        }
        Ok(())
    }
}

// --- Item conversion helpers, internal to this module ---

fn string_list(values: &[String]) -> AttributeValue {
    AttributeValue::L(values.iter().map(|v| AttributeValue::S(v.clone())).collect())
}

fn comment_to_value(comment: &Comment) -> AttributeValue {
    AttributeValue::M(HashMap::from([
        ("comment_id".to_string(), AttributeValue::S(comment.comment_id.to_string())),
        ("author".to_string(), AttributeValue::S(comment.author.clone())),
        ("text".to_string(), AttributeValue::S(comment.text.clone())),
        ("ts".to_string(), AttributeValue::S(comment.created_at.to_rfc3339())),
    ]))
}

fn meme_to_item(meme: &Meme) -> Item {
    let reasons = meme
        .reject_reasons
        .iter()
        .map(|r| {
            AttributeValue::M(HashMap::from([
                ("label".to_string(), AttributeValue::S(r.label.clone())),
                ("confidence".to_string(), AttributeValue::N(r.confidence.to_string())),
            ]))
        })
        .collect();

    HashMap::from([
        ("meme_id".to_string(), AttributeValue::S(meme.meme_id.to_string())),
        ("owner".to_string(), AttributeValue::S(meme.owner.clone())),
        ("title".to_string(), AttributeValue::S(meme.title.clone())),
        ("description".to_string(), AttributeValue::S(meme.description.clone())),
        ("category".to_string(), AttributeValue::S(meme.category.clone())),
        ("tags".to_string(), string_list(&meme.tags)),
        ("image_key".to_string(), AttributeValue::S(meme.image_key.clone())),
        ("filename".to_string(), AttributeValue::S(meme.filename.clone())),
        ("content_type".to_string(), AttributeValue::S(meme.content_type.clone())),
        ("labels".to_string(), string_list(&meme.labels)),
        ("detected_text".to_string(), AttributeValue::S(meme.detected_text.clone())),
        ("status".to_string(), AttributeValue::S(meme.status.as_str().to_string())),
        ("reject_reasons".to_string(), AttributeValue::L(reasons)),
        ("likes".to_string(), AttributeValue::N(meme.likes.to_string())),
        ("views".to_string(), AttributeValue::N(meme.views.to_string())),
        ("downloads".to_string(), AttributeValue::N(meme.downloads.to_string())),
        ("created_at".to_string(), AttributeValue::S(meme.created_at.to_rfc3339())),
        ("comments".to_string(), AttributeValue::L(meme.comments.iter().map(comment_to_value).collect())),
    ])
}

fn string(item: &Item, name: &str) -> Option<String> {
    item.get(name)?.as_s().ok().cloned()
}

fn number(item: &Item, name: &str) -> Option<u64> {
    item.get(name)?.as_n().ok()?.parse().ok()
}

fn timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw).ok().map(|t| t.with_timezone(&Utc))
}

fn strings(item: &Item, name: &str) -> Option<Vec<String>> {
    match item.get(name) {
        None => Some(Vec::new()),
        Some(value) => value.as_l().ok()?.iter().map(|v| v.as_s().ok().cloned()).collect(),
    }
}

fn value_to_comment(value: &AttributeValue) -> Option<Comment> {
    let map = value.as_m().ok()?;
    Some(Comment {
        comment_id: Uuid::parse_str(&string(map, "comment_id")?).ok()?,
        author: string(map, "author")?,
        text: string(map, "text")?,
        created_at: timestamp(&string(map, "ts")?)?,
    })
}

fn value_to_reason(value: &AttributeValue) -> Option<RejectReason> {
    let map = value.as_m().ok()?;
    Some(RejectReason {
        label: string(map, "label")?,
        confidence: map.get("confidence")?.as_n().ok()?.parse().ok()?,
    })
}

/// Absent list attributes read as empty.
fn list<'a>(item: &'a Item, name: &str) -> Option<&'a [AttributeValue]> {
    match item.get(name) {
        None => Some(&[]),
        Some(v) => v.as_l().ok().map(Vec::as_slice),
    }
}

/// Converts a DynamoDB item into a `Meme`.
/// Returns `None` if a required attribute is missing or has the wrong type.
/// List attributes and counters that are absent default to empty/zero.
fn item_to_meme(item: &Item) -> Option<Meme> {
    Some(Meme {
        meme_id: Uuid::parse_str(&string(item, "meme_id")?).ok()?,
        owner: string(item, "owner")?,
        title: string(item, "title")?,
        description: string(item, "description").unwrap_or_default(),
        category: string(item, "category").unwrap_or_default(),
        tags: strings(item, "tags")?,
        image_key: string(item, "image_key")?,
        filename: string(item, "filename").unwrap_or_default(),
        content_type: string(item, "content_type").unwrap_or_default(),
        labels: strings(item, "labels")?,
        detected_text: string(item, "detected_text").unwrap_or_default(),
        status: string(item, "status")?.parse::<MemeStatus>().ok()?,
        reject_reasons: list(item, "reject_reasons")?.iter().map(value_to_reason).collect::<Option<_>>()?,
        likes: number(item, "likes").unwrap_or(0),
        views: number(item, "views").unwrap_or(0),
        downloads: number(item, "downloads").unwrap_or(0),
        created_at: timestamp(&string(item, "created_at")?)?,
        comments: list(item, "comments")?.iter().map(value_to_comment).collect::<Option<_>>()?,
    })
}
