//! Persisted record layout.
//!
//! One flat JSON document per job, tagged with `schemaVersion`. Older
//! documents are migrated forward on read; writes always use the current
//! version.
//!
//! Version history:
//! - 1: no `priority`; `lastError` was a bare message; the checkpoint lived
//!   under `checkpoint`
//! - 2: current layout (the `Job` entity, camelCase); `leaseToken` and
//!   `workflowState.rewinds` default when absent

use serde_json::{Map, Value, json};

use super::types::Job;

pub const SCHEMA_VERSION: u64 = 2;

const SCHEMA_FIELD: &str = "schemaVersion";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RecordError {
    #[error("record is not a JSON object")]
    NotAnObject,
    #[error("record has schema version {0}, newer than supported {SCHEMA_VERSION}")]
    UnsupportedVersion(u64),
    #[error("malformed record: {0}")]
    Malformed(String),
}

/// Serialize a job to its current on-disk document.
pub fn encode(job: &Job) -> Result<String, RecordError> {
    let mut value = serde_json::to_value(job).map_err(|e| RecordError::Malformed(e.to_string()))?;
    let map = value.as_object_mut().ok_or(RecordError::NotAnObject)?;
    map.insert(SCHEMA_FIELD.to_string(), json!(SCHEMA_VERSION));
    serde_json::to_string(&value).map_err(|e| RecordError::Malformed(e.to_string()))
}

/// Parse a stored document, migrating older layouts.
pub fn decode(document: &str) -> Result<Job, RecordError> {
    let value: Value = serde_json::from_str(document).map_err(|e| RecordError::Malformed(e.to_string()))?;
    decode_value(value)
}

pub fn decode_value(value: Value) -> Result<Job, RecordError> {
    let Value::Object(mut map) = value else {
        return Err(RecordError::NotAnObject);
    };

    let version = map.get(SCHEMA_FIELD).and_then(Value::as_u64).unwrap_or(1);
    if version > SCHEMA_VERSION {
        return Err(RecordError::UnsupportedVersion(version));
    }
    if version < 2 {
        migrate_v1(&mut map);
    }
    map.remove(SCHEMA_FIELD);

    serde_json::from_value(Value::Object(map)).map_err(|e| RecordError::Malformed(e.to_string()))
}

fn migrate_v1(map: &mut Map<String, Value>) {
    if let Some(checkpoint) = map.remove("checkpoint") {
        map.insert("workflowState".to_string(), checkpoint);
    }
    map.entry("workflowState").or_insert_with(|| json!({}));

    if let Some(Value::String(message)) = map.get("lastError").cloned() {
        map.insert(
            "lastError".to_string(),
            json!({ "category": "UNKNOWN", "message": message, "recoverable": true }),
        );
    }

    map.entry("priority").or_insert(json!(0));
    map.entry("cancelRequested").or_insert(json!(false));
    map.entry("version").or_insert(json!(0));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::types::JobStatus;
    use verdant_core::{ErrorCategory, JobKind};

    #[test]
    fn current_documents_carry_schema_version() {
        let job = Job::new(JobKind::SubmitWork, json!({"title": "Planted 3 trees"}), 5);
        let doc: Value = serde_json::from_str(&encode(&job).unwrap()).unwrap();

        assert_eq!(doc["schemaVersion"], 2);
        assert_eq!(doc["kind"], "submit-work");
        assert_eq!(doc["status"], "PENDING");
        assert_eq!(decode(&doc.to_string()).unwrap(), job);
    }

    #[test]
    fn v1_documents_are_migrated_on_read() {
        let id = verdant_core::JobId::new();
        let v1 = json!({
            "id": id,
            "kind": "mint-certificate",
            "payload": {"name": "Oak grove"},
            "status": "FAILED_RETRYABLE",
            "attempt": 1,
            "maxAttempts": 5,
            "lastError": "relay timed out",
            "checkpoint": {"lastCompletedStep": "upload-metadata", "outputs": {"upload-metadata": "cid-9"}},
            "createdAt": "2024-05-01T10:00:00Z",
            "updatedAt": "2024-05-01T10:05:00Z",
            "nextEligibleAt": null
        });

        let job = decode_value(v1).unwrap();
        assert_eq!(job.id, id);
        assert_eq!(job.status, JobStatus::FailedRetryable);
        assert_eq!(job.priority, 0);
        assert!(!job.cancel_requested);
        assert_eq!(job.workflow_state.last_completed_step.as_deref(), Some("upload-metadata"));
        let err = job.last_error.unwrap();
        assert_eq!(err.category, ErrorCategory::Unknown);
        assert_eq!(err.message, "relay timed out");
    }

    #[test]
    fn newer_schema_is_refused() {
        let err = decode(r#"{"schemaVersion": 99}"#).unwrap_err();
        assert_eq!(err, RecordError::UnsupportedVersion(99));
    }

    #[test]
    fn garbage_is_malformed() {
        assert!(matches!(decode("{not json"), Err(RecordError::Malformed(_))));
        assert_eq!(decode("[1,2]").unwrap_err(), RecordError::NotAnObject);
    }
}
