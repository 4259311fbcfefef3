// HTTP dispatch action - hands one ledger item to a partner endpoint

use crate::types::{DispatchRequest, DispatchResponse};
use async_trait::async_trait;
use fleetbatch_core::domain::LedgerRecord;
use fleetbatch_core::error::{AppError, Result};
use fleetbatch_core::port::{ActionError, ActionResult, BatchAction};
use reqwest::{Client, Url};
use serde::Serialize;
use std::marker::PhantomData;
use std::time::Duration;
use tracing::debug;

/// Header carrying the ledger id so partners can drop redeliveries
pub const IDEMPOTENCY_HEADER: &str = "Idempotency-Key";

const MAX_ERROR_BODY_CHARS: usize = 512;

/// Business action that POSTs each item to a partner as JSON.
///
/// Delivery is at-least-once: a crash after the partner accepted the call but
/// before the write-back landed means the item is sent again next run.
pub struct HttpDispatchAction<P> {
    client: Client,
    endpoint: Url,
    _payload: PhantomData<fn(&P)>,
}

impl<P> HttpDispatchAction<P> {
    pub fn new(endpoint: &str, timeout: Duration) -> Result<Self> {
        let endpoint = Url::parse(endpoint)
            .map_err(|e| AppError::Config(format!("Invalid endpoint '{}': {}", endpoint, e)))?;
        if !matches!(endpoint.scheme(), "http" | "https") {
            return Err(AppError::Config(format!(
                "Endpoint '{}' must use http or https",
                endpoint
            )));
        }

        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("fleetbatch/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| AppError::Config(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            endpoint,
            _payload: PhantomData,
        })
    }
}

#[async_trait]
impl<P> BatchAction<LedgerRecord<P>> for HttpDispatchAction<P>
where
    P: Serialize + Clone + Send + Sync + 'static,
{
    async fn execute(&self, item: &LedgerRecord<P>) -> std::result::Result<ActionResult, ActionError> {
        let response = self
            .client
            .post(self.endpoint.clone())
            .header(IDEMPOTENCY_HEADER, item.id.to_string())
            .json(&DispatchRequest::from_record(item))
            .send()
            .await
            .map_err(classify_transport_error)?;

        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .map_err(|e| ActionError::Unavailable(format!("Failed to read partner response: {}", e)))?;

        debug!(item_id = %item.id, status, endpoint = %self.endpoint, "Partner responded");
        interpret_response(status, &body)
    }
}

fn classify_transport_error(err: reqwest::Error) -> ActionError {
    if err.is_builder() {
        ActionError::InvalidItem(format!("Cannot build partner request: {}", err))
    } else if err.is_timeout() {
        ActionError::Unavailable(format!("Partner timed out: {}", err))
    } else {
        ActionError::Unavailable(format!("Partner unreachable: {}", err))
    }
}

/// Map a partner response to an action outcome.
///
/// 2xx is success; an `external_id` in a JSON body becomes the correlation
/// id. 4xx means the partner refused this item. Anything else is treated as
/// the partner being unavailable.
pub fn interpret_response(status: u16, body: &str) -> std::result::Result<ActionResult, ActionError> {
    match status {
        200..=299 => {
            let response = if body.trim().is_empty() {
                DispatchResponse::default()
            } else {
                serde_json::from_str::<DispatchResponse>(body).unwrap_or_default()
            };
            Ok(ActionResult {
                external_correlation_id: response
                    .external_id
                    .map(|id| id.trim().to_string())
                    .filter(|id| !id.is_empty()),
            })
        }
        400..=499 => Err(ActionError::Rejected(format!(
            "HTTP {}: {}",
            status,
            truncate(body)
        ))),
        _ => Err(ActionError::Unavailable(format!(
            "HTTP {}: {}",
            status,
            truncate(body)
        ))),
    }
}

fn truncate(body: &str) -> String {
    let body = body.trim();
    if body.chars().count() <= MAX_ERROR_BODY_CHARS {
        body.to_string()
    } else {
        let mut cut: String = body.chars().take(MAX_ERROR_BODY_CHARS).collect();
        cut.push('…');
        cut
    }
}
