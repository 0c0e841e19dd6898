use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

/// Request body for `POST /auth/refresh`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenRefreshRequest {
    pub refresh_token: String,
}

/// Tokens returned by the backend after a login or refresh.
/// The refresh token is only present when the backend rotates it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenPair {
    #[serde(alias = "accessToken", alias = "token")]
    pub access_token: String,
    #[serde(default, alias = "refreshToken", skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
}

/// Semantics of a remote call. Everything except `Get` mutates server state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Method {
    Get,
    Create,
    Update,
    Delete,
}

impl Method {
    pub fn as_str(self) -> &'static str {
        match self {
            Method::Get => "get",
            Method::Create => "create",
            Method::Update => "update",
            Method::Delete => "delete",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "get" => Some(Method::Get),
            "create" => Some(Method::Create),
            "update" => Some(Method::Update),
            "delete" => Some(Method::Delete),
            _ => None,
        }
    }

    pub fn is_mutating(self) -> bool {
        !matches!(self, Method::Get)
    }
}

/// A record as the backend reports it.
///
/// The backend is loose about field names: ids arrive as `id` or `_id`,
/// timestamps as `updated_at` or `updatedAt`, either RFC 3339 or epoch
/// millis. Everything else ends up in `fields` untouched.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteRecord {
    pub id: String,
    pub updated_at: DateTime<Utc>,
    pub fields: Map<String, Value>,
}

const ID_KEYS: [&str; 2] = ["id", "_id"];
const UPDATED_KEYS: [&str; 2] = ["updated_at", "updatedAt"];

impl RemoteRecord {
    /// Build from a JSON object, pulling the id and timestamp out of the
    /// attribute map. A missing timestamp defaults to the epoch, so the
    /// record reads as older than any timestamped copy.
    pub fn from_object(mut object: Map<String, Value>) -> Result<Self, String> {
        let id = ID_KEYS
            .iter()
            .find_map(|key| object.remove(*key))
            .and_then(|value| id_from_value(&value))
            .ok_or_else(|| "record has no id".to_string())?;
        for key in ID_KEYS {
            object.remove(key);
        }

        let mut updated_at = None;
        for key in UPDATED_KEYS {
            if let Some(value) = object.remove(key) {
                if updated_at.is_none() {
                    updated_at = parse_timestamp(&value);
                }
            }
        }

        Ok(Self {
            id,
            updated_at: updated_at.unwrap_or_default(),
            fields: object,
        })
    }

    pub fn from_value(value: Value) -> Result<Self, String> {
        match value {
            Value::Object(object) => Self::from_object(object),
            other => Err(format!("expected a JSON object, got {other}")),
        }
    }

    /// Read a reference-typed attribute (bare id or embedded object).
    pub fn reference(&self, field: &str) -> Option<String> {
        self.fields.get(field).and_then(normalize_reference)
    }
}

impl Serialize for RemoteRecord {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut object = self.fields.clone();
        object.insert("id".to_string(), Value::String(self.id.clone()));
        object.insert(
            "updated_at".to_string(),
            Value::String(self.updated_at.to_rfc3339()),
        );
        object.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for RemoteRecord {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let object = Map::<String, Value>::deserialize(deserializer)?;
        RemoteRecord::from_object(object).map_err(serde::de::Error::custom)
    }
}

/// An owning reference as it appears in a remote payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Reference {
    Id(String),
    Embedded(Box<RemoteRecord>),
}

impl Reference {
    pub fn id(&self) -> &str {
        match self {
            Reference::Id(id) => id,
            Reference::Embedded(record) => &record.id,
        }
    }

    pub fn into_id(self) -> String {
        match self {
            Reference::Id(id) => id,
            Reference::Embedded(record) => record.id,
        }
    }
}

/// The single place where a reference-typed JSON value is turned into an id.
pub fn normalize_reference(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::Number(n) => Some(n.to_string()),
        other => serde_json::from_value::<Reference>(other.clone())
            .ok()
            .map(Reference::into_id)
            .filter(|id| !id.is_empty()),
    }
}

fn id_from_value(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Parse RFC 3339 strings, numeric strings and epoch-millisecond numbers.
pub fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .map(|dt| dt.with_timezone(&Utc))
            .ok()
            .or_else(|| s.parse::<i64>().ok().and_then(millis_to_datetime)),
        Value::Number(n) => n.as_i64().and_then(millis_to_datetime),
        _ => None,
    }
}

fn millis_to_datetime(millis: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(millis).single()
}

/// Extract the server-assigned id from a create response.
/// Accepts `{ "id": .. }`, `{ "_id": .. }` and the same nested under `data`.
pub fn assigned_id(body: &Value) -> Option<String> {
    let object = body.as_object()?;
    ID_KEYS
        .iter()
        .find_map(|key| object.get(*key).and_then(id_from_value))
        .or_else(|| object.get("data").and_then(assigned_id))
}

/// Extract a list of records from a list response: either a bare array or
/// an object with `data`/`items`.
pub fn record_list(body: Value) -> Result<Vec<RemoteRecord>, String> {
    let items = match body {
        Value::Array(items) => items,
        Value::Object(mut object) => match object.remove("data").or_else(|| object.remove("items")) {
            Some(Value::Array(items)) => items,
            _ => return Err("list response has no record array".to_string()),
        },
        other => return Err(format!("unexpected list response: {other}")),
    };
    items.into_iter().map(RemoteRecord::from_value).collect()
}

/// User-facing message from an error body, if the backend sent one.
pub fn error_message(body: &Value) -> Option<String> {
    match body {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Object(object) => ["message", "error"]
            .iter()
            .find_map(|key| object.get(*key).and_then(Value::as_str))
            .map(str::to_string),
        _ => None,
    }
}
