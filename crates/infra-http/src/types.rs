// Partner dispatch wire types

use fleetbatch_core::domain::{LedgerId, LedgerItem, LedgerRecord};
use serde::{Deserialize, Serialize};

/// Body POSTed to the partner endpoint for one ledger item
#[derive(Debug, Serialize)]
pub struct DispatchRequest<'a, P> {
    pub id: LedgerId,
    pub entity_type: &'a str,
    pub action: &'a str,
    /// Earlier failed attempts; partners may use it to detect redelivery
    pub retry_count: u8,
    pub payload: &'a P,
}

impl<'a, P> DispatchRequest<'a, P> {
    pub fn from_record(record: &'a LedgerRecord<P>) -> Self
    where
        P: Clone + Send + Sync + 'static,
    {
        Self {
            id: record.id,
            entity_type: &record.entity_type,
            action: &record.action,
            retry_count: record.retry_count(),
            payload: &record.payload,
        }
    }
}

/// Success body returned by the partner (all fields optional)
#[derive(Debug, Default, Deserialize)]
pub struct DispatchResponse {
    /// Partner-side identifier, stored as the external correlation id
    #[serde(default)]
    pub external_id: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    #[test]
    fn test_request_shape() {
        let mut record = LedgerRecord::new("Opportunity", "Update", json!({"title": "Tutor"}), Utc::now());
        record.processing.retry_count = 2;

        let value = serde_json::to_value(DispatchRequest::from_record(&record)).unwrap();
        assert_eq!(value["entity_type"], "Opportunity");
        assert_eq!(value["action"], "Update");
        assert_eq!(value["retry_count"], 2);
        assert_eq!(value["payload"]["title"], "Tutor");
        assert_eq!(value["id"], record.id.to_string());
    }

    #[test]
    fn test_response_tolerates_missing_fields() {
        let response: DispatchResponse = serde_json::from_str(r#"{"status": "ok"}"#).unwrap();
        assert_eq!(response.external_id, None);
    }
}
