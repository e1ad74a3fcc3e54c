use std::path::{Path, PathBuf};
use std::time::Duration;

use cmdrunner_core::{quote_all, CmdRunnerError, JobRecord, Result};

/// Everything needed to launch one process.
#[derive(Debug, Clone)]
pub struct ExecuteRequest {
    pub executable: String,
    pub args: Vec<String>,
    pub timeout: Duration,
    /// Written to the child's stdin, which is then closed. When `None` the
    /// child gets no stdin at all.
    pub stdin: Option<String>,
    pub env: Vec<(String, String)>,
    pub working_directory: Option<PathBuf>,
}

impl ExecuteRequest {
    pub fn new(executable: impl Into<String>, timeout: Duration) -> Self {
        Self {
            executable: executable.into(),
            args: Vec::new(),
            timeout,
            stdin: None,
            env: Vec::new(),
            working_directory: None,
        }
    }

    /// Request for a received job: its single argument becomes one token.
    pub fn for_job(job: &JobRecord, timeout: Duration) -> Self {
        Self::new(job.executable(), timeout).with_args(job.argument_list())
    }

    pub fn with_arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn with_stdin(mut self, input: impl Into<String>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn with_work_dir<P: AsRef<Path>>(mut self, dir: P) -> Self {
        self.working_directory = Some(dir.as_ref().to_path_buf());
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.executable.trim().is_empty() {
            return Err(CmdRunnerError::InvalidRequest(
                "executable must not be empty".to_string(),
            ));
        }
        if self.timeout.is_zero() {
            return Err(CmdRunnerError::InvalidRequest(
                "timeout must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Command line for log output.
    pub fn display(&self) -> String {
        let mut parts = vec![self.executable.clone()];
        parts.extend(self.args.iter().cloned());
        quote_all(parts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_for_job_keeps_single_token() {
        let job = JobRecord::new("ls", "-l /my dir").unwrap();
        let request = ExecuteRequest::for_job(&job, Duration::from_secs(5));
        assert_eq!(request.executable, "ls");
        assert_eq!(request.args, vec!["-l /my dir".to_string()]);
        assert!(request.stdin.is_none());
    }

    #[test]
    fn test_request_validate() {
        assert!(ExecuteRequest::new("echo", Duration::from_secs(1)).validate().is_ok());
        assert!(matches!(
            ExecuteRequest::new("", Duration::from_secs(1)).validate(),
            Err(CmdRunnerError::InvalidRequest(_))
        ));
        assert!(matches!(
            ExecuteRequest::new("echo", Duration::ZERO).validate(),
            Err(CmdRunnerError::InvalidRequest(_))
        ));
    }

    #[test]
    fn test_request_display_quotes_arguments() {
        let request = ExecuteRequest::new("echo", Duration::from_secs(1))
            .with_arg("a")
            .with_arg("b c");
        assert_eq!(request.display(), "echo a \"b c\"");
    }
}
