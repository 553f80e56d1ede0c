//! Normalisation of raw Direct Line activities into [`Activity`] records.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use time::{OffsetDateTime, UtcOffset, format_description::well_known::Rfc3339};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SenderRole {
    User,
    Bot,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    pub content_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CardAction {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
}

/// A message activity after parsing; immutable once built.
#[derive(Clone, Debug, PartialEq)]
pub struct Activity {
    pub id: String,
    pub sender_role: SenderRole,
    pub text: String,
    pub attachments: Vec<Attachment>,
    pub suggested_actions: Vec<CardAction>,
    pub timestamp: OffsetDateTime,
}

impl Activity {
    pub fn is_bot(&self) -> bool {
        self.sender_role == SenderRole::Bot
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MalformedActivity {
    #[error("activity is not a JSON object")]
    NotAnObject,
    #[error("activity is missing `{0}`")]
    MissingField(&'static str),
    #[error("activity timestamp `{0}` is not RFC 3339")]
    BadTimestamp(String),
}

/// Parses one raw activity.
///
/// Returns `Ok(None)` for non-message activities (typing, events,
/// end-of-conversation), which the relay never surfaces.
pub fn normalize_activity(
    raw: &Value,
    user_id: &str,
) -> Result<Option<Activity>, MalformedActivity> {
    let obj = raw.as_object().ok_or(MalformedActivity::NotAnObject)?;
    let activity_type = obj.get("type").and_then(Value::as_str).unwrap_or("message");
    if activity_type != "message" {
        return Ok(None);
    }

    let id = obj
        .get("id")
        .and_then(Value::as_str)
        .filter(|id| !id.is_empty())
        .ok_or(MalformedActivity::MissingField("id"))?
        .to_string();

    let timestamp = obj
        .get("timestamp")
        .and_then(Value::as_str)
        .ok_or(MalformedActivity::MissingField("timestamp"))
        .and_then(parse_timestamp)?;

    let from = obj
        .get("from")
        .and_then(Value::as_object)
        .ok_or(MalformedActivity::MissingField("from"))?;

    Ok(Some(Activity {
        id,
        sender_role: sender_role(from, user_id),
        text: obj
            .get("text")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        attachments: attachments(obj),
        suggested_actions: suggested_actions(obj),
        timestamp,
    }))
}

/// Parses an RFC 3339 timestamp and normalises it to UTC.
pub fn parse_timestamp(value: &str) -> Result<OffsetDateTime, MalformedActivity> {
    OffsetDateTime::parse(value, &Rfc3339)
        .map(|ts| ts.to_offset(UtcOffset::UTC))
        .map_err(|_| MalformedActivity::BadTimestamp(value.to_string()))
}

fn sender_role(from: &Map<String, Value>, user_id: &str) -> SenderRole {
    match from.get("role").and_then(Value::as_str) {
        Some(role) if role.eq_ignore_ascii_case("user") => SenderRole::User,
        Some(_) => SenderRole::Bot,
        None => {
            let from_id = from.get("id").and_then(Value::as_str).unwrap_or_default();
            if from_id == user_id {
                SenderRole::User
            } else {
                SenderRole::Bot
            }
        }
    }
}

fn attachments(obj: &Map<String, Value>) -> Vec<Attachment> {
    obj.get("attachments")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|item| {
                    let content_type = item
                        .get("contentType")
                        .or_else(|| item.get("content_type"))
                        .and_then(Value::as_str)?
                        .to_string();
                    Some(Attachment {
                        content_type,
                        content: item.get("content").cloned().filter(|v| !v.is_null()),
                        content_url: item
                            .get("contentUrl")
                            .and_then(Value::as_str)
                            .map(str::to_string),
                        name: item.get("name").and_then(Value::as_str).map(str::to_string),
                    })
                })
                .collect()
        })
        .unwrap_or_default()
}

fn suggested_actions(obj: &Map<String, Value>) -> Vec<CardAction> {
    obj.get("suggestedActions")
        .and_then(|actions| actions.get("actions"))
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|item| serde_json::from_value::<CardAction>(item.clone()).ok())
                .collect()
        })
        .unwrap_or_default()
}
