//! Job envelope.
//!
//! The unit of work carried over the broker and through the delayed store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use uuid::Uuid;

use crate::{CoreError, CoreResult};

/// Opaque job identifier, stable across promotion
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    /// Generates a new unique identifier
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Returns the identifier as a string slice
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for JobId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&str> for JobId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Job priority levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// Served after everything else
    Low = 0,
    /// Default priority
    Normal = 1,
    /// Served first
    High = 2,
}

impl Default for Priority {
    fn default() -> Self {
        Self::Normal
    }
}

impl Priority {
    /// Numeric rank, higher is served first
    #[must_use]
    pub fn rank(self) -> i64 {
        self as i64
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Low => write!(f, "low"),
            Self::Normal => write!(f, "normal"),
            Self::High => write!(f, "high"),
        }
    }
}

impl std::str::FromStr for Priority {
    type Err = CoreError;

    fn from_str(s: &str) -> CoreResult<Self> {
        match s.to_ascii_lowercase().as_str() {
            "low" => Ok(Self::Low),
            "normal" => Ok(Self::Normal),
            "high" => Ok(Self::High),
            other => Err(crate::CoreErrorKind::InvalidArgument {
                reason: format!("unknown priority '{other}'"),
            }
            .into()),
        }
    }
}

/// A job as it travels between submitter, store, broker and worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobEnvelope {
    /// Unique job ID
    pub id: JobId,
    /// Broker/store configuration to use
    pub config_name: String,
    /// Task identifier passed to the dispatch façade
    pub task: String,
    /// Positional arguments
    #[serde(default)]
    pub args: Vec<Value>,
    /// Job priority
    #[serde(default)]
    pub priority: Priority,
    /// Due time; absent means eligible immediately
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub due_at: Option<DateTime<Utc>>,
}

impl JobEnvelope {
    /// Creates an immediate job with a fresh ID
    #[must_use]
    pub fn new(config_name: impl Into<String>, task: impl Into<String>, args: Vec<Value>) -> Self {
        Self {
            id: JobId::generate(),
            config_name: config_name.into(),
            task: task.into(),
            args,
            priority: Priority::Normal,
            due_at: None,
        }
    }

    /// Sets the priority
    #[must_use]
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Sets the due time
    #[must_use]
    pub fn with_due_at(mut self, due_at: DateTime<Utc>) -> Self {
        self.due_at = Some(due_at);
        self
    }

    /// Clears the due time, turning the job into an immediate one
    #[must_use]
    pub fn into_immediate(mut self) -> Self {
        self.due_at = None;
        self
    }

    /// Encodes the envelope as a broker payload
    ///
    /// # Errors
    ///
    /// Returns `MalformedPayload` if an argument cannot be serialized.
    pub fn encode(&self) -> CoreResult<String> {
        serde_json::to_string(self).map_err(|e| CoreError::malformed(e.to_string()))
    }

    /// Decodes a broker payload
    ///
    /// # Errors
    ///
    /// Returns `MalformedPayload` if the payload is empty or does not
    /// decode into an envelope.
    pub fn decode(payload: &str) -> CoreResult<Self> {
        if payload.trim().is_empty() {
            return Err(CoreError::malformed("empty payload"));
        }
        serde_json::from_str(payload).map_err(|e| CoreError::malformed(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::CoreErrorKind;
    use chrono::Duration;
    use pretty_assertions::assert_eq;
    use rstest::rstest;
    use serde_json::json;

    #[test]
    fn test_envelope_new_is_immediate() {
        let job = JobEnvelope::new("default", "echo", vec![json!("hi")]);
        assert_eq!(job.priority, Priority::Normal);
        assert!(job.due_at.is_none());
    }

    #[test]
    fn test_envelope_ids_are_unique() {
        let a = JobEnvelope::new("default", "echo", vec![]);
        let b = JobEnvelope::new("default", "echo", vec![]);
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn test_envelope_due() {
        let due = Utc::now() + Duration::seconds(2);
        let job = JobEnvelope::new("default", "echo", vec![]).with_due_at(due);
        assert_eq!(job.due_at, Some(due));

        let id = job.id.clone();
        let immediate = job.into_immediate();
        assert_eq!(immediate.id, id);
        assert!(immediate.due_at.is_none());
    }

    #[test]
    fn test_envelope_wire_format() {
        let job = JobEnvelope::new("reports", "render", vec![json!(1), json!("a")])
            .with_priority(Priority::High);
        let encoded = job.encode().unwrap();
        let raw: Value = serde_json::from_str(&encoded).unwrap();

        assert_eq!(raw["configName"], json!("reports"));
        assert_eq!(raw["priority"], json!("high"));
        assert!(raw.get("dueAt").is_none());
        assert_eq!(JobEnvelope::decode(&encoded).unwrap(), job);
    }

    #[rstest]
    #[case("")]
    #[case("   ")]
    #[case("not json")]
    #[case("[1, 2, 3]")]
    #[case(r#"{"task": "echo"}"#)]
    fn test_decode_rejects_malformed(#[case] payload: &str) {
        let err = JobEnvelope::decode(payload).unwrap_err();
        assert!(matches!(err.kind(), CoreErrorKind::MalformedPayload { .. }));
    }

    #[test]
    fn test_priority_ordering() {
        assert!(Priority::Low < Priority::Normal);
        assert!(Priority::Normal < Priority::High);
        assert!(Priority::High.rank() > Priority::Normal.rank());
        assert!(Priority::Normal.rank() > Priority::Low.rank());
    }

    #[test]
    fn test_priority_from_str() {
        assert_eq!("HIGH".parse::<Priority>().unwrap(), Priority::High);
        assert!("urgent".parse::<Priority>().is_err());
    }
}
