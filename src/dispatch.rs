//! Fulfillment request dispatcher.

use std::sync::Arc;
use std::time::Instant;

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{header, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Router;
use tracing::{error, info, warn};

use crate::envelope::WebhookRequest;
use crate::error::DispatchError;
use crate::metrics;
use crate::registry::Actions;

/// Build the fulfillment router for `actions`.
///
/// Every path is routed to the dispatcher.
pub fn router(actions: Arc<Actions>) -> Router {
    Router::new().fallback(handle_fulfillment).with_state(actions)
}

/// Dispatch one fulfillment request to its registered action.
pub async fn handle_fulfillment(
    State(actions): State<Arc<Actions>>,
    request: Request,
) -> Result<Response, DispatchError> {
    let result = dispatch(&actions, request).await;
    if let Err(e) = &result {
        match e {
            DispatchError::MethodNotAllowed(method) => {
                warn!(method = %method, "fulfillment request rejected: method not allowed");
            }
            DispatchError::UnsupportedAction(action) => {
                warn!(action = %action, "Action {} not supported", action);
            }
            _ => error!(error = %e, "fulfillment request failed"),
        }
        metrics::record_dispatch_failure(e);
    }
    result
}

async fn dispatch(actions: &Actions, request: Request) -> Result<Response, DispatchError> {
    if request.method() != Method::POST {
        return Err(DispatchError::MethodNotAllowed(request.method().clone()));
    }

    let body = axum::body::to_bytes(request.into_body(), usize::MAX)
        .await
        .map_err(DispatchError::ReadBody)?;

    let envelope = WebhookRequest::from_slice(&body).map_err(DispatchError::MalformedEnvelope)?;

    let action = envelope.action().to_owned();
    let handler = actions
        .get(&action)
        .ok_or_else(|| DispatchError::UnsupportedAction(action.clone()))?;

    info!(action = %action, "Invoking action: {}", action);

    let start = Instant::now();
    let outcome = handler.call(&envelope);
    metrics::record_action_latency(&action, start);

    let response = outcome.map_err(|source| DispatchError::ActionFailed {
        action: action.clone(),
        source,
    })?;

    let data = serde_json::to_vec_pretty(&response).map_err(|source| DispatchError::Serialize {
        action: action.clone(),
        source,
    })?;

    metrics::record_dispatch_success(&action);

    Ok((
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/json")],
        Body::from(data),
    )
        .into_response())
}
