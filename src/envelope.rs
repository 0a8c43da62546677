//! Request and response envelopes exchanged with the conversational platform.
//!
//! The platform's schema has changed shape over time, so the envelopes are
//! kept as opaque JSON. The server only reads the action name and the
//! parameter bag; everything else is passed through to handlers untouched.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use strum::Display;

static NULL: Value = Value::Null;

/// Shape of an inbound request envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
pub enum SchemaVersion {
    /// `{"queryResult": {"action": .., "parameters": ..}}`
    V2,
    /// `{"result": {"action": .., "parameters": ..}}`
    V1,
    /// `{"action": .., "parameters": ..}`
    Flat,
}

/// Inbound webhook request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WebhookRequest {
    body: Value,
}

impl WebhookRequest {
    /// Parse a request envelope from raw JSON bytes.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes).map(|body| Self { body })
    }

    /// Detect which schema shape the envelope uses.
    pub fn schema(&self) -> SchemaVersion {
        if self.body.get("queryResult").is_some_and(Value::is_object) {
            SchemaVersion::V2
        } else if self.body.get("result").is_some_and(Value::is_object) {
            SchemaVersion::V1
        } else {
            SchemaVersion::Flat
        }
    }

    fn section(&self) -> &Value {
        match self.schema() {
            SchemaVersion::V2 => &self.body["queryResult"],
            SchemaVersion::V1 => &self.body["result"],
            SchemaVersion::Flat => &self.body,
        }
    }

    /// The requested action name, or `""` when absent.
    pub fn action(&self) -> &str {
        self.section()
            .get("action")
            .and_then(Value::as_str)
            .unwrap_or_default()
    }

    /// The free-form parameter bag, or `null` when absent.
    pub fn parameters(&self) -> &Value {
        self.section().get("parameters").unwrap_or(&NULL)
    }

    /// A single named parameter.
    pub fn parameter(&self, name: &str) -> Option<&Value> {
        self.parameters().get(name)
    }

    /// Decode the parameter bag into a caller-defined type.
    pub fn parameters_as<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        T::deserialize(self.parameters())
    }

    /// The user's original query text, when the platform sent it.
    pub fn query_text(&self) -> Option<&str> {
        let key = match self.schema() {
            SchemaVersion::V2 => "queryText",
            SchemaVersion::V1 => "resolvedQuery",
            SchemaVersion::Flat => "query",
        };
        self.section().get(key).and_then(Value::as_str)
    }

    /// Session identifier, when present.
    pub fn session(&self) -> Option<&str> {
        self.body
            .get("session")
            .or_else(|| self.body.get("sessionId"))
            .and_then(Value::as_str)
    }

    /// The raw envelope.
    pub fn as_value(&self) -> &Value {
        &self.body
    }

    /// Consume the envelope, returning the raw JSON.
    pub fn into_value(self) -> Value {
        self.body
    }
}

impl From<Value> for WebhookRequest {
    fn from(body: Value) -> Self {
        Self { body }
    }
}

/// Outbound webhook response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WebhookResponse {
    body: Value,
}

impl WebhookResponse {
    /// An empty JSON object response.
    pub fn empty() -> Self {
        Self {
            body: Value::Object(Map::new()),
        }
    }

    /// Plain-text reply in the v2 shape.
    pub fn fulfillment_text(text: impl Into<String>) -> Self {
        Self::from(serde_json::json!({ "fulfillmentText": text.into() }))
    }

    /// Plain-text reply in the legacy v1 shape.
    pub fn speech(text: impl Into<String>) -> Self {
        let text = text.into();
        Self::from(serde_json::json!({ "speech": text, "displayText": text }))
    }

    /// Plain-text reply shaped to match the schema of `request`.
    pub fn reply_to(request: &WebhookRequest, text: impl Into<String>) -> Self {
        match request.schema() {
            SchemaVersion::V2 => Self::fulfillment_text(text),
            SchemaVersion::V1 => Self::speech(text),
            SchemaVersion::Flat => Self::from(serde_json::json!({ "text": text.into() })),
        }
    }

    /// Build a response from any serializable value.
    pub fn from_serializable<T: Serialize>(value: &T) -> Result<Self, serde_json::Error> {
        serde_json::to_value(value).map(|body| Self { body })
    }

    /// The raw envelope.
    pub fn as_value(&self) -> &Value {
        &self.body
    }
}

impl Default for WebhookResponse {
    fn default() -> Self {
        Self::empty()
    }
}

impl From<Value> for WebhookResponse {
    fn from(body: Value) -> Self {
        Self { body }
    }
}
