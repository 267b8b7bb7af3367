//! Operation records and parameters.
//!
//! An operation is one attempt to run a lifecycle transition on a secret
//! instance. Its status (the record minus the identifying ids) is the
//! observable state of the instance: the latest operation appended for it.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::environment::Environment;
use crate::error::{Error, Result};

/// The closed set of lifecycle operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationName {
    /// Provision a new instance.
    Create,
    /// Tear an instance down.
    Destroy,
    /// Make an instance the active one for its secret.
    Activate,
    /// Retire the active instance.
    Deactivate,
    /// Exercise the active instance without changing state.
    Test,
}

impl OperationName {
    /// All names, in declaration order.
    pub const ALL: [Self; 5] = [
        Self::Create,
        Self::Destroy,
        Self::Activate,
        Self::Deactivate,
        Self::Test,
    ];

    /// The lowercase wire name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Destroy => "destroy",
            Self::Activate => "activate",
            Self::Deactivate => "deactivate",
            Self::Test => "test",
        }
    }
}

impl fmt::Display for OperationName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationName {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "create" => Ok(Self::Create),
            "destroy" => Ok(Self::Destroy),
            "activate" => Ok(Self::Activate),
            "deactivate" => Ok(Self::Deactivate),
            "test" => Ok(Self::Test),
            other => Err(Error::BadRequest(format!("unknown operation {other}"))),
        }
    }
}

/// The status of a secret instance at a point in time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Status {
    /// Which operation this is.
    pub name: OperationName,
    /// Whether admission guards were bypassed.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub forced: bool,
    /// Operator-supplied reason for the operation.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,
    /// Principal that started the operation.
    pub started_by: String,
    /// When the operation was admitted and recorded.
    pub started_at: DateTime<Utc>,
    /// Set when the operation's scripts completed successfully.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Set when the operation's scripts failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_at: Option<DateTime<Utc>>,
}

/// One journalled lifecycle attempt on a secret instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Operation {
    /// Monotonic per-journal id, strictly increasing with insertion order.
    pub id: i64,
    /// The secret the operated instance belongs to.
    pub secret_id: String,
    /// The operated instance.
    pub instance_id: String,
    /// The attempt itself.
    #[serde(flatten)]
    pub status: Status,
}

/// Common parameters for an operation on a secret instance.
///
/// `started_by` is always populated by the agent from the resolved caller
/// identity; it is never read from a request body.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OperationParameters {
    /// Extra environment supplied to every plan node.
    pub env: Environment,
    /// Bypass admission guards; the operation is still recorded as forced.
    pub forced: bool,
    /// Human-readable reason, journalled with the operation.
    pub reason: String,
    /// Resolved caller principal.
    #[serde(skip)]
    pub started_by: String,
}

impl OperationParameters {
    /// Enforces the configured maximum reason length before any journal
    /// work. A maximum of zero disables the check.
    pub fn validate(&self, max_reason_len: usize) -> Result<()> {
        if max_reason_len > 0 && self.reason.len() > max_reason_len {
            return Err(Error::BadRequest(format!(
                "reason too long ({} exceeds max of {} bytes)",
                self.reason.len(),
                max_reason_len
            )));
        }
        Ok(())
    }
}

/// Parameters for posting a non-create operation on an existing instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateOperationParameters {
    /// Which operation to run; `create` is not valid here.
    pub name: OperationName,
    /// The common parameters.
    #[serde(flatten)]
    pub parameters: OperationParameters,
}

/// Half-open `[from, to)` index range over history and instance listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Range {
    /// First index, inclusive.
    pub from: u32,
    /// Last index, exclusive.
    pub to: u32,
}

impl Default for Range {
    fn default() -> Self {
        Self { from: 0, to: 10 }
    }
}

impl Range {
    /// Number of rows selected; empty when `to <= from`.
    #[must_use]
    pub fn count(self) -> i64 {
        i64::from(self.to.saturating_sub(self.from))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operation_name_round_trip() {
        for name in OperationName::ALL {
            assert_eq!(name.as_str().parse::<OperationName>().unwrap(), name);
            let json = serde_json::to_string(&name).unwrap();
            assert_eq!(json, format!("\"{name}\""));
        }
        assert!("rotate".parse::<OperationName>().is_err());
    }

    #[test]
    fn status_omits_empty_fields() {
        let status = Status {
            name: OperationName::Create,
            forced: false,
            reason: String::new(),
            started_by: "linux:root/0".into(),
            started_at: Utc::now(),
            completed_at: None,
            failed_at: None,
        };
        let json = serde_json::to_string(&status).unwrap();
        assert!(!json.contains("forced"));
        assert!(!json.contains("reason"));
        assert!(!json.contains("completedAt"));
        assert!(json.contains("startedBy"));
    }

    #[test]
    fn operation_flattens_status() {
        let op = Operation {
            id: 7,
            secret_id: "friend".into(),
            instance_id: "i-1".into(),
            status: Status {
                name: OperationName::Activate,
                forced: true,
                reason: "rotation".into(),
                started_by: "linux:ops/1000".into(),
                started_at: Utc::now(),
                completed_at: None,
                failed_at: None,
            },
        };
        let value: serde_json::Value = serde_json::to_value(&op).unwrap();
        assert_eq!(value["secretId"], "friend");
        assert_eq!(value["name"], "activate");
        assert_eq!(value["forced"], true);
    }

    #[test]
    fn parameters_ignore_started_by_from_the_wire() {
        let params: OperationParameters =
            serde_json::from_str(r#"{"env":{},"forced":true,"reason":"r","startedBy":"evil"}"#)
                .unwrap();
        assert!(params.forced);
        assert_eq!(params.started_by, "");
    }

    #[test]
    fn reason_length_guard() {
        let params = OperationParameters {
            reason: "x".repeat(20),
            ..OperationParameters::default()
        };
        assert!(params.validate(0).is_ok());
        assert!(params.validate(32).is_ok());
        let err = params.validate(10).unwrap_err();
        assert!(matches!(err, Error::BadRequest(_)));
    }

    #[test]
    fn range_counts() {
        assert_eq!(Range::default().count(), 10);
        assert_eq!(Range { from: 5, to: 5 }.count(), 0);
        assert_eq!(Range { from: 9, to: 4 }.count(), 0);
    }
}
