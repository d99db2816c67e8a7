//! Status-change notifications from the managed job service.

use chrono::{DateTime, Utc};
use serde_json::Value;

use infergate_kernel::{JobHandle, UnknownStatus, WorkUnitStatus};

const HANDLE_FIELDS: [&str; 3] = ["batchJobArn", "modelInvocationJobArn", "jobArn"];

/// One `{handle, status}` observation, from a notification or a poll.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StatusEvent {
    pub handle: JobHandle,
    pub status: WorkUnitStatus,
    /// When the service emitted the observation, if known.
    pub observed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, thiserror::Error)]
pub enum EventParseError {
    #[error("notification is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("notification is missing {0}")]
    MissingField(&'static str),
    #[error(transparent)]
    UnknownStatus(#[from] UnknownStatus),
    #[error("notification time is not RFC 3339: {0}")]
    InvalidTime(String),
}

impl StatusEvent {
    pub fn new(handle: impl Into<JobHandle>, status: WorkUnitStatus) -> Self {
        Self {
            handle: handle.into(),
            status,
            observed_at: None,
        }
    }

    pub fn observed_at(mut self, at: DateTime<Utc>) -> Self {
        self.observed_at = Some(at);
        self
    }

    /// Parse a state-change envelope:
    ///
    /// ```json
    /// {"time": "2024-05-01T12:00:00Z",
    ///  "detail": {"status": "Completed", "batchJobArn": "arn:...:model-invocation-job/abc"}}
    /// ```
    ///
    /// The handle may also arrive as `modelInvocationJobArn` or `jobArn`.
    pub fn from_notification(raw: &str) -> Result<Self, EventParseError> {
        let envelope: Value = serde_json::from_str(raw)?;
        Self::from_value(&envelope)
    }

    pub fn from_value(envelope: &Value) -> Result<Self, EventParseError> {
        let detail = envelope
            .get("detail")
            .ok_or(EventParseError::MissingField("detail"))?;
        let status = detail
            .get("status")
            .and_then(Value::as_str)
            .ok_or(EventParseError::MissingField("detail.status"))?
            .parse::<WorkUnitStatus>()?;
        let handle = HANDLE_FIELDS
            .iter()
            .find_map(|field| detail.get(*field).and_then(Value::as_str))
            .filter(|handle| !handle.is_empty())
            .ok_or(EventParseError::MissingField("detail.batchJobArn"))?;
        let observed_at = match envelope.get("time").and_then(Value::as_str) {
            Some(time) => Some(
                DateTime::parse_from_rfc3339(time)
                    .map_err(|_| EventParseError::InvalidTime(time.to_string()))?
                    .with_timezone(&Utc),
            ),
            None => None,
        };
        Ok(Self {
            handle: handle.to_string(),
            status,
            observed_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    #[test]
    fn parses_batch_job_envelope() {
        let event = StatusEvent::from_notification(
            r#"{"time":"2024-05-01T12:00:00Z","detail":{"status":"InProgress","batchJobArn":"arn:aws:bedrock:us-east-1:1:model-invocation-job/abc"}}"#,
        )
        .unwrap();
        assert_eq!(event.status, WorkUnitStatus::InProgress);
        assert_eq!(
            event.handle,
            "arn:aws:bedrock:us-east-1:1:model-invocation-job/abc"
        );
        assert_eq!(
            event.observed_at,
            Some(Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap())
        );
    }

    #[test]
    fn accepts_alternate_handle_field_and_missing_time() {
        let event = StatusEvent::from_notification(
            r#"{"detail":{"status":"Completed","modelInvocationJobArn":"job/xyz"}}"#,
        )
        .unwrap();
        assert_eq!(event, StatusEvent::new("job/xyz", WorkUnitStatus::Completed));
    }

    #[test]
    fn rejects_incomplete_or_unknown_payloads() {
        assert!(matches!(
            StatusEvent::from_notification(r#"{"detail":{"batchJobArn":"job/1"}}"#),
            Err(EventParseError::MissingField("detail.status"))
        ));
        assert!(matches!(
            StatusEvent::from_notification(r#"{"detail":{"status":"Completed"}}"#),
            Err(EventParseError::MissingField(_))
        ));
        assert!(matches!(
            StatusEvent::from_notification(r#"{"detail":{"status":"Done","jobArn":"job/1"}}"#),
            Err(EventParseError::UnknownStatus(_))
        ));
        assert!(matches!(
            StatusEvent::from_notification(
                r#"{"time":"yesterday","detail":{"status":"Failed","jobArn":"job/1"}}"#
            ),
            Err(EventParseError::InvalidTime(_))
        ));
        assert!(matches!(
            StatusEvent::from_notification("not json"),
            Err(EventParseError::Json(_))
        ));
    }
}
