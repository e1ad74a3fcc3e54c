use serde::{Deserialize, Serialize};
use chrono::{DateTime, Utc};

use crate::error::{CmdRunnerError, Result};

/// A command submitted for remote execution.
///
/// Carries exactly one opaque argument string, which is handed to the
/// process as a single token and never re-split on whitespace. The record
/// has no identity beyond its two fields.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(try_from = "RawJobRecord")]
pub struct JobRecord {
    executable: String,
    argument: String,
}

/// Wire form accepted on input, before validation.
///
/// `File`/`Args` are the field names used by older producers.
#[derive(Deserialize)]
struct RawJobRecord {
    #[serde(default, alias = "File", alias = "file")]
    executable: Option<String>,
    #[serde(default, alias = "Args", alias = "args")]
    argument: Option<String>,
}

impl TryFrom<RawJobRecord> for JobRecord {
    type Error = CmdRunnerError;

    fn try_from(raw: RawJobRecord) -> Result<Self> {
        JobRecord::new(
            raw.executable.unwrap_or_default(),
            raw.argument.unwrap_or_default(),
        )
    }
}

impl JobRecord {
    pub fn new(executable: impl Into<String>, argument: impl Into<String>) -> Result<Self> {
        let executable = executable.into();
        if executable.trim().is_empty() {
            return Err(CmdRunnerError::InvalidJob(
                "executable must not be empty".to_string(),
            ));
        }

        Ok(Self {
            executable,
            argument: argument.into(),
        })
    }

    pub fn executable(&self) -> &str {
        &self.executable
    }

    pub fn argument(&self) -> &str {
        &self.argument
    }

    /// The argument list handed to the process launcher.
    ///
    /// Zero tokens for an empty argument, otherwise exactly one.
    pub fn argument_list(&self) -> Vec<String> {
        if self.argument.is_empty() {
            Vec::new()
        } else {
            vec![self.argument.clone()]
        }
    }

    /// Encode for transport.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| CmdRunnerError::MalformedPayload(e.to_string()))
    }

    /// Decode a delivery received from the transport.
    pub fn from_bytes(body: &[u8]) -> Result<Self> {
        serde_json::from_slice(body).map_err(|e| CmdRunnerError::MalformedPayload(e.to_string()))
    }
}

/// How an execution ended
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Termination {
    /// The process exited on its own.
    Exited,
    /// The timeout elapsed and the process was killed.
    TimedOut,
    /// The external cancellation signal fired and the process was killed.
    Cancelled,
}

/// Result of one process execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionOutcome {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub termination: Termination,
    pub duration_ms: u64,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

impl ExecutionOutcome {
    /// True when the process was forcibly terminated, whether by the timeout
    /// or by external cancellation.
    pub fn timed_out(&self) -> bool {
        self.termination != Termination::Exited
    }

    /// The text reported for this run: stderr when it has content, stdout
    /// otherwise.
    pub fn report_text(&self) -> &str {
        if self.stderr.trim().is_empty() {
            &self.stdout
        } else {
            &self.stderr
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_outcome(stdout: &str, stderr: &str, termination: Termination) -> ExecutionOutcome {
        ExecutionOutcome {
            exit_code: 0,
            stdout: stdout.to_string(),
            stderr: stderr.to_string(),
            termination,
            duration_ms: 1,
            started_at: Utc::now(),
            completed_at: Utc::now(),
        }
    }

    #[test]
    fn test_job_record_rejects_empty_executable() {
        assert!(matches!(
            JobRecord::new("", "x"),
            Err(CmdRunnerError::InvalidJob(_))
        ));
        assert!(JobRecord::new("   ", "").is_err());
    }

    #[test]
    fn test_job_record_argument_list_keeps_spaces() {
        let job = JobRecord::new("ls", "-la /tmp").unwrap();
        assert_eq!(job.argument_list(), vec!["-la /tmp".to_string()]);
    }

    #[test]
    fn test_job_record_empty_argument_has_no_tokens() {
        let job = JobRecord::new("true", "").unwrap();
        assert!(job.argument_list().is_empty());
    }

    #[test]
    fn test_job_record_wire_shape() {
        let job = JobRecord::new("echo", "hi there").unwrap();
        let value: serde_json::Value = serde_json::from_slice(&job.to_bytes().unwrap()).unwrap();
        assert_eq!(value["executable"], "echo");
        assert_eq!(value["argument"], "hi there");
    }

    #[test]
    fn test_job_record_missing_argument_defaults_to_empty() {
        let job = JobRecord::from_bytes(br#"{"executable":"date"}"#).unwrap();
        assert_eq!(job.executable(), "date");
        assert_eq!(job.argument(), "");

        let job = JobRecord::from_bytes(br#"{"executable":"date","argument":null}"#).unwrap();
        assert_eq!(job.argument(), "");
    }

    #[test]
    fn test_job_record_accepts_legacy_field_names() {
        let job = JobRecord::from_bytes(br#"{"File":"echo","Args":"a b"}"#).unwrap();
        assert_eq!(job.executable(), "echo");
        assert_eq!(job.argument(), "a b");
    }

    #[test]
    fn test_job_record_malformed_payloads() {
        let bodies: [&[u8]; 4] = [
            b"not json",
            br#"{"argument":"x"}"#,
            br#"{"executable":""}"#,
            b"[1,2]",
        ];
        for body in bodies {
            assert!(matches!(
                JobRecord::from_bytes(body),
                Err(CmdRunnerError::MalformedPayload(_))
            ));
        }
    }

    #[test]
    fn test_outcome_timed_out_covers_cancellation() {
        assert!(!create_test_outcome("", "", Termination::Exited).timed_out());
        assert!(create_test_outcome("", "", Termination::TimedOut).timed_out());
        assert!(create_test_outcome("", "", Termination::Cancelled).timed_out());
    }

    #[test]
    fn test_outcome_report_text_prefers_stderr() {
        let outcome = create_test_outcome("out", "err", Termination::Exited);
        assert_eq!(outcome.report_text(), "err");

        let outcome = create_test_outcome("out", " \n", Termination::Exited);
        assert_eq!(outcome.report_text(), "out");
    }
}
