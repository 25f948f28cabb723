use crate::{
    domain::ActivityLog,
    errors::ActivityError,
    models::{ActivityEvent, ActivityFilter, ActivityKind},
};
use anyhow::Context;
use async_trait::async_trait;
use aws_sdk_dynamodb::{types::AttributeValue, Client as DynamoDbClient};
use chrono::{DateTime, Utc};
use futures::{
    future,
    stream::{self, BoxStream, StreamExt, TryStreamExt},
};
use std::collections::HashMap;
use uuid::Uuid;

type Item = HashMap<String, AttributeValue>;

/// Append-only activity table keyed by `log_id`. `meta` is stored as a JSON string.
#[derive(Debug, Clone)]
pub struct DynamoDbActivityLog {
    client: DynamoDbClient,
    table_name: String,
}

enum Cursor {
    Start,
    Next(Item),
    Done,
}

impl DynamoDbActivityLog {
    pub fn new(client: DynamoDbClient, table_name: String) -> Self {
        tracing::info!(%table_name, "Initializing DynamoDbActivityLog");
        Self { client, table_name }
    }

    /// One scan page. `action` and `actor` are pushed down as a filter expression;
    /// `meme_id` lives inside the JSON meta and is matched client-side.
    async fn scan_page(&self, filter: &ActivityFilter, start: Option<Item>) -> Result<(Vec<ActivityEvent>, Option<Item>), ActivityError> {
        let mut conditions = Vec::new();
        let mut request = self.client
            .scan()
            .table_name(&self.table_name)
            .set_exclusive_start_key(start);

        if let Some(action) = filter.action {
            conditions.push("#action = :action");
            request = request
                .expression_attribute_names("#action", "action")
                .expression_attribute_values(":action", AttributeValue::S(action.as_str().to_string()));
        }
        if let Some(actor) = &filter.actor {
            conditions.push("#actor = :actor");
            request = request
                .expression_attribute_names("#actor", "actor")
                .expression_attribute_values(":actor", AttributeValue::S(actor.clone()));
        }
        if !conditions.is_empty() {
            request = request.filter_expression(conditions.join(" AND "));
        }

        let resp = request
            .send()
            .await
            .context(format!("DynamoDB: Failed to scan activity table '{}'", self.table_name))?;

        let events = resp
            .items
            .unwrap_or_default()
            .iter()
            .map(item_to_event)
            .collect::<Result<Vec<_>, _>>()?;
        Ok((events, resp.last_evaluated_key))
    }
}

#[async_trait]
impl ActivityLog for DynamoDbActivityLog {
    async fn append(&self, event: &ActivityEvent) -> Result<(), ActivityError> {
        let item = event_to_item(event)?;
        self.client
            .put_item()
            .table_name(&self.table_name)
            .set_item(Some(item))
            .send()
            .await
            .context(format!("DynamoDB (table: {}): Failed to put activity {}", self.table_name, event.log_id))?;
        tracing::debug!(log_id = %event.log_id, action = event.action.as_str(), "DynamoDB: Activity recorded");
        Ok(())
    }

    fn query(&self, filter: ActivityFilter) -> BoxStream<'_, Result<ActivityEvent, ActivityError>> {
        let page_filter = filter.clone();
        let pages = stream::try_unfold(Cursor::Start, move |cursor| {
            let page_filter = page_filter.clone();
            async move {
                let start = match cursor {
                    Cursor::Done => return Ok::<_, ActivityError>(None),
                    Cursor::Start => None,
                    Cursor::Next(key) => Some(key),
                };
                let (events, last_key) = self.scan_page(&page_filter, start).await?;
                let next = last_key.map_or(Cursor::Done, Cursor::Next);
                Ok::<_, ActivityError>(Some((events, next)))
            }
        });

        pages
            .map_ok(|events| stream::iter(events.into_iter().map(Ok::<_, ActivityError>)))
            .try_flatten()
            .try_filter(move |event| future::ready(filter.matches(event)))
            .boxed()
    }
}

fn event_to_item(event: &ActivityEvent) -> Result<Item, ActivityError> {
    Ok(HashMap::from([
        ("log_id".to_string(), AttributeValue::S(event.log_id.to_string())),
        ("ts".to_string(), AttributeValue::S(event.ts.to_rfc3339())),
        ("action".to_string(), AttributeValue::S(event.action.as_str().to_string())),
        ("actor".to_string(), AttributeValue::S(event.actor.clone())),
        ("meta".to_string(), AttributeValue::S(serde_json::to_string(&event.meta)?)),
    ]))
}

fn field<'a>(item: &'a Item, name: &str) -> Result<&'a str, ActivityError> {
    item.get(name)
        .and_then(|v| v.as_s().ok())
        .map(String::as_str)
        .ok_or_else(|| ActivityError::Malformed(format!("missing string attribute '{}'", name)))
}

fn item_to_event(item: &Item) -> Result<ActivityEvent, ActivityError> {
    let log_id = Uuid::parse_str(field(item, "log_id")?).map_err(|e| ActivityError::Malformed(format!("log_id: {}", e)))?;
    let ts = DateTime::parse_from_rfc3339(field(item, "ts")?)
        .map_err(|e| ActivityError::Malformed(format!("ts: {}", e)))?
        .with_timezone(&Utc);
    let action = field(item, "action")?.parse::<ActivityKind>().map_err(ActivityError::Malformed)?;
    let meta = match item.get("meta").and_then(|v| v.as_s().ok()) {
        Some(raw) => serde_json::from_str(raw).map_err(|e| ActivityError::Malformed(format!("meta: {}", e)))?,
        None => serde_json::Map::new(),
    };

    Ok(ActivityEvent {
        log_id,
        ts,
        action,
        actor: field(item, "actor")?.to_string(),
        meta,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stored_items_parse_back_into_events() {
        let meme_id = Uuid::new_v4();
        let event = ActivityEvent::new(
            ActivityKind::Download,
            "b@x.com",
            serde_json::json!({ "meme_id": meme_id.to_string(), "downloads": 4 }),
        );
        let parsed = item_to_event(&event_to_item(&event).unwrap()).unwrap();
        assert_eq!(parsed.log_id, event.log_id);
        assert_eq!(parsed.action, ActivityKind::Download);
        assert_eq!(parsed.meme_id(), Some(meme_id));
        assert_eq!(parsed.meta["downloads"], 4);
    }

    #[test]
    fn unknown_action_is_malformed() {
        let event = ActivityEvent::new(ActivityKind::View, "b@x.com", serde_json::Value::Null);
        let mut item = event_to_item(&event).unwrap();
        item.insert("action".into(), AttributeValue::S("teleport".into()));
        assert!(matches!(item_to_event(&item), Err(ActivityError::Malformed(_))));
    }

    #[test]
    fn missing_meta_is_an_empty_map() {
        let event = ActivityEvent::new(ActivityKind::Login, "b@x.com", serde_json::Value::Null);
        let mut item = event_to_item(&event).unwrap();
        item.remove("meta");
        assert!(item_to_event(&item).unwrap().meta.is_empty());
    }
}
