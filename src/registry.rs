//! Action registry: maps action names to handlers.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::envelope::{WebhookRequest, WebhookResponse};

/// Error type returned by action handlers.
pub type ActionError = Box<dyn std::error::Error + Send + Sync>;

/// Result type returned by action handlers.
pub type ActionResult = Result<WebhookResponse, ActionError>;

/// A handler for one named action.
///
/// Implemented for every `Fn(&WebhookRequest) -> ActionResult` closure, so
/// most callers never implement it by hand.
pub trait Action: Send + Sync + 'static {
    /// Process a request envelope.
    fn call(&self, request: &WebhookRequest) -> ActionResult;
}

impl<F> Action for F
where
    F: Fn(&WebhookRequest) -> ActionResult + Send + Sync + 'static,
{
    fn call(&self, request: &WebhookRequest) -> ActionResult {
        self(request)
    }
}

/// The supported actions of a fulfillment server.
#[derive(Clone, Default)]
pub struct Actions {
    entries: HashMap<String, Arc<dyn Action>>,
}

impl Actions {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `action` under `name`, replacing any existing handler.
    pub fn set(&mut self, name: impl Into<String>, action: impl Action) -> &mut Self {
        self.entries.insert(name.into(), Arc::new(action));
        self
    }

    /// Look up the handler registered under `name`.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Action>> {
        self.entries.get(name).cloned()
    }

    /// Whether a handler is registered under `name`.
    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// Number of registered actions.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no actions are registered.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Registered action names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.entries.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl fmt::Debug for Actions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Actions")
            .field("names", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn reply(text: &'static str) -> impl Action {
        move |_: &WebhookRequest| -> ActionResult { Ok(WebhookResponse::from(json!({ "text": text }))) }
    }

    #[test]
    fn lookup_returns_registered_handler() {
        let mut actions = Actions::new();
        actions.set("hello", reply("hi"));

        let handler = actions.get("hello").unwrap();
        let response = handler.call(&WebhookRequest::from(json!({}))).unwrap();
        assert_eq!(response.as_value(), &json!({"text": "hi"}));
        assert!(actions.get("missing").is_none());
    }

    #[test]
    fn last_registration_wins() {
        let mut actions = Actions::new();
        actions.set("hello", reply("first")).set("hello", reply("second"));

        assert_eq!(actions.len(), 1);
        let response = actions
            .get("hello")
            .unwrap()
            .call(&WebhookRequest::from(json!({})))
            .unwrap();
        assert_eq!(response.as_value(), &json!({"text": "second"}));
    }

    #[test]
    fn names_are_case_sensitive() {
        let mut actions = Actions::new();
        actions.set("Hello", reply("hi"));

        assert!(actions.contains("Hello"));
        assert!(!actions.contains("hello"));
        assert_eq!(actions.names(), vec!["Hello"]);
    }
}
