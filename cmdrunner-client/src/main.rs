use clap::{Parser, Subcommand};
use cmdrunner_core::{quote_all, Config, ExecutionOutcome, JobRecord};
use cmdrunner_runner::{
    install_shutdown_handler, ExecuteRequest, LogSink, ProcessExecutor, Worker, WorkerOptions,
};
use reqwest::Client;
use serde_json::json;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::time::Duration;

mod transport;

use transport::HttpTransport;

/// Exit status used when `exec` had to kill the process.
const EXIT_TIMED_OUT: i32 = 124;
/// Exit status used when `exec` could not start the process.
const EXIT_LAUNCH_FAILED: i32 = 127;

#[derive(Parser)]
#[command(name = "cmdrunner")]
#[command(about = "Submit, run and consume remote commands", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Server URL (overrides worker.server_url)
    #[arg(long)]
    server: Option<String>,

    /// Path to a TOML config file
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Check server health
    Health,

    /// Queue a command for a worker and return immediately
    Submit {
        /// Program to run on the worker
        executable: String,

        /// Single argument, passed to the program as one token
        argument: Option<String>,
    },

    /// Run a command locally with the same executor a worker uses
    Exec {
        /// Program to run
        executable: String,

        /// Single argument, passed to the program as one token
        argument: Option<String>,

        /// Kill the process after this many seconds
        #[arg(short, long, default_value = "3600")]
        timeout_secs: u64,

        /// Text written to the process's stdin
        #[arg(long)]
        stdin: Option<String>,

        /// Print the full outcome as JSON
        #[arg(long)]
        json: bool,
    },

    /// Print arguments the way they appear in log lines
    Quote {
        args: Vec<String>,
    },

    /// Consume jobs from the server and run them until interrupted
    Worker {
        /// Queue to consume (overrides broker.queue)
        #[arg(short, long)]
        queue: Option<String>,

        /// Maximum number of jobs running at once; 0 means unbounded
        #[arg(long)]
        max_concurrent: Option<usize>,

        /// Per-job timeout in seconds (overrides worker.job_timeout_secs)
        #[arg(long)]
        timeout_secs: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(server) = cli.server {
        config.worker.server_url = server;
    }
    let server = config.worker.server_url.trim_end_matches('/').to_string();
    let client = Client::new();

    match cli.command {
        Commands::Health => {
            let url = format!("{}/health", server);
            let response = client.get(&url).send().await?;
            if response.status().is_success() {
                println!("Server is healthy");
                process::exit(0);
            } else {
                eprintln!("Server is unhealthy");
                process::exit(1);
            }
        }
        Commands::Submit { executable, argument } => {
            let code =
                submit_command(&client, &server, &executable, argument.as_deref().unwrap_or(""))
                    .await?;
            process::exit(code);
        }
        Commands::Exec {
            executable,
            argument,
            timeout_secs,
            stdin,
            json,
        } => {
            let code = exec_local(executable, argument, timeout_secs, stdin, json).await?;
            process::exit(code);
        }
        Commands::Quote { args } => {
            println!("{}", quote_all(&args));
        }
        Commands::Worker {
            queue,
            max_concurrent,
            timeout_secs,
        } => {
            if let Some(queue) = queue {
                config.broker.queue = queue;
            }
            if let Some(max_concurrent) = max_concurrent {
                config.worker.max_concurrent_jobs = max_concurrent;
            }
            if let Some(timeout_secs) = timeout_secs {
                if timeout_secs == 0 {
                    anyhow::bail!("--timeout-secs must be greater than zero");
                }
                config.worker.job_timeout_secs = timeout_secs;
            }
            run_worker(client, &server, &config).await?;
        }
    }

    Ok(())
}

/// Returns the process exit status: 0 once queued, 1 when the server refused.
async fn submit_command(
    client: &Client,
    server: &str,
    executable: &str,
    argument: &str,
) -> anyhow::Result<i32> {
    // Validate locally so an obviously bad job never leaves the machine.
    let job = JobRecord::new(executable, argument)?;

    let url = format!("{}/command/run", server);
    let payload = json!({
        "executable": job.executable(),
        "argument": job.argument(),
    });

    let response = client.post(&url).json(&payload).send().await?;

    if response.status().is_success() {
        let mut parts = vec![job.executable().to_string()];
        parts.extend(job.argument_list());
        println!("✓ Command queued: {}", quote_all(&parts));
        Ok(0)
    } else {
        let error_text = response.text().await.unwrap_or_default();
        eprintln!("Failed to submit command: {}", error_text);
        Ok(1)
    }
}

async fn exec_local(
    executable: String,
    argument: Option<String>,
    timeout_secs: u64,
    stdin: Option<String>,
    json: bool,
) -> anyhow::Result<i32> {
    let mut request = ExecuteRequest::new(executable, Duration::from_secs(timeout_secs));
    if let Some(argument) = argument.filter(|a| !a.is_empty()) {
        request = request.with_arg(argument);
    }
    if let Some(stdin) = stdin {
        request = request.with_stdin(stdin);
    }

    let cancel = install_shutdown_handler();
    let result = ProcessExecutor::new().execute(&request, &cancel).await;
    let code = exec_exit_status(&result);

    match result {
        Ok(outcome) => {
            if json {
                println!("{}", serde_json::to_string_pretty(&outcome)?);
            } else {
                print!("{}", outcome.stdout);
                eprint!("{}", outcome.stderr);
            }
            if outcome.timed_out() {
                eprintln!("Process terminated ({:?})", outcome.termination);
            }
        }
        Err(e) if e.is_launch_failure() => eprintln!("{}", e),
        Err(e) => return Err(e.into()),
    }

    Ok(code.unwrap_or(1))
}

/// Exit status for `exec`: the child's own code, [`EXIT_TIMED_OUT`] when it
/// was killed, [`EXIT_LAUNCH_FAILED`] when it never started. `None` for any
/// other error.
fn exec_exit_status(result: &cmdrunner_core::Result<ExecutionOutcome>) -> Option<i32> {
    match result {
        Ok(outcome) if outcome.timed_out() => Some(EXIT_TIMED_OUT),
        Ok(outcome) => Some(outcome.exit_code),
        Err(e) if e.is_launch_failure() => Some(EXIT_LAUNCH_FAILED),
        Err(_) => None,
    }
}

async fn run_worker(client: Client, server: &str, config: &Config) -> anyhow::Result<()> {
    let transport = HttpTransport::new(client, server, config.broker.poll_wait());
    let options = WorkerOptions::from_config(&config.broker, &config.worker);

    println!("Consuming '{}' from {}. Press Ctrl-C to exit.", options.queue, server);

    let worker = Worker::new(Arc::new(transport), Arc::new(LogSink), options);
    worker.run(install_shutdown_handler()).await?;

    println!("DONE!");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use cmdrunner_core::{CmdRunnerError, Termination};

    fn create_test_outcome(exit_code: i32, termination: Termination) -> ExecutionOutcome {
        ExecutionOutcome {
            exit_code,
            stdout: String::new(),
            stderr: String::new(),
            termination,
            duration_ms: 1,
            started_at: Utc::now(),
            completed_at: Utc::now(),
        }
    }

    #[test]
    fn test_exec_exit_status_mirrors_child() {
        assert_eq!(exec_exit_status(&Ok(create_test_outcome(0, Termination::Exited))), Some(0));
        assert_eq!(exec_exit_status(&Ok(create_test_outcome(3, Termination::Exited))), Some(3));
    }

    #[test]
    fn test_exec_exit_status_killed() {
        let timed_out = Ok(create_test_outcome(-1, Termination::TimedOut));
        assert_eq!(exec_exit_status(&timed_out), Some(EXIT_TIMED_OUT));

        let cancelled = Ok(create_test_outcome(-1, Termination::Cancelled));
        assert_eq!(exec_exit_status(&cancelled), Some(EXIT_TIMED_OUT));
    }

    #[test]
    fn test_exec_exit_status_launch_failure() {
        let launch = Err(CmdRunnerError::LaunchFailure {
            executable: "missing".to_string(),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "not found"),
        });
        assert_eq!(exec_exit_status(&launch), Some(EXIT_LAUNCH_FAILED));

        let invalid = Err(CmdRunnerError::InvalidRequest("timeout must be greater than zero".to_string()));
        assert_eq!(exec_exit_status(&invalid), None);
    }

    #[tokio::test]
    async fn test_submit_rejected_exits_one() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/command/run")
            .with_status(400)
            .with_body(r#"{"error":"executable must not be empty"}"#)
            .create_async()
            .await;

        let code = submit_command(&Client::new(), &server.url(), "echo", "hi")
            .await
            .unwrap();
        assert_eq!(code, 1);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_submit_accepted_exits_zero() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/command/run")
            .match_body(mockito::Matcher::Json(json!({
                "executable": "echo",
                "argument": "hi there",
            })))
            .with_status(200)
            .create_async()
            .await;

        let code = submit_command(&Client::new(), &server.url(), "echo", "hi there")
            .await
            .unwrap();
        assert_eq!(code, 0);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_submit_blank_executable_never_sent() {
        let err = submit_command(&Client::new(), "http://127.0.0.1:1", " ", "x")
            .await
            .unwrap_err();
        assert!(err.downcast_ref::<CmdRunnerError>().is_some());
    }
}
