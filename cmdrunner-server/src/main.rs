use axum::{
    body::Bytes,
    extract::{rejection::JsonRejection, Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use clap::Parser;
use cmdrunner_core::{Config, InMemoryTransport, JobRecord, JobTransport};
use cmdrunner_runner::{install_shutdown_handler, LogSink, Worker, WorkerOptions};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

mod dispatcher;

use dispatcher::Dispatcher;

#[derive(Parser)]
#[command(name = "cmdrunner-server")]
#[command(about = "Accepts commands over HTTP and queues them for workers", long_about = None)]
struct Cli {
    /// Path to a TOML config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Address to listen on (overrides server.listen_addr)
    #[arg(long)]
    listen: Option<String>,

    /// Queue that submitted jobs are dispatched to (overrides broker.queue)
    #[arg(long)]
    queue: Option<String>,

    /// Also run a worker inside this process
    #[arg(long)]
    embedded_worker: bool,
}

#[derive(Clone)]
struct AppState {
    dispatcher: Dispatcher,
    transport: Arc<dyn JobTransport>,
    max_poll_wait: Duration,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(listen) = cli.listen {
        config.server.listen_addr = listen;
    }
    if let Some(queue) = cli.queue {
        config.broker.queue = queue;
    }
    config.server.embedded_worker |= cli.embedded_worker;

    let broker = Arc::new(InMemoryTransport::new());
    let transport: Arc<dyn JobTransport> = broker.clone();
    let dispatcher = Dispatcher::connect(transport.clone(), config.broker.queue.clone()).await?;

    let state = AppState {
        dispatcher,
        transport: transport.clone(),
        max_poll_wait: config.broker.poll_wait(),
    };

    let shutdown = install_shutdown_handler();

    // Long-polling consumers hold requests open; closing the broker first
    // lets them return so graceful shutdown can finish.
    {
        let broker = broker.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            shutdown.cancelled().await;
            broker.close();
        });
    }

    let worker = if config.server.embedded_worker {
        let worker = Worker::new(
            transport.clone(),
            Arc::new(LogSink),
            WorkerOptions::from_config(&config.broker, &config.worker),
        );
        let shutdown = shutdown.clone();
        info!("Starting embedded worker");
        Some(tokio::spawn(async move { worker.run(shutdown).await }))
    } else {
        None
    };

    let app = app(state);

    let listener = tokio::net::TcpListener::bind(&config.server.listen_addr).await?;
    info!("Server listening on http://{}", config.server.listen_addr);
    axum::serve(listener, app)
        .with_graceful_shutdown({
            let shutdown = shutdown.clone();
            async move { shutdown.cancelled().await }
        })
        .await?;

    if let Some(worker) = worker {
        match worker.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(error = %e, "embedded worker failed"),
            Err(e) => error!(error = %e, "embedded worker panicked"),
        }
    }

    info!("Server stopped");
    Ok(())
}

fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/command/run", post(run_command))
        .route("/api/v1/queues/:queue/messages", post(publish_message))
        .route("/api/v1/queues/:queue/receive", post(receive_message))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health_check() -> &'static str {
    "OK"
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(ErrorResponse {
            error: message.into(),
        }),
    )
        .into_response()
}

#[derive(Deserialize)]
struct RunCommandRequest {
    #[serde(default, alias = "File", alias = "file")]
    executable: Option<String>,
    #[serde(default, alias = "Args", alias = "args")]
    argument: Option<String>,
}

/// Validate a submitted command and hand it to the dispatcher.
///
/// Returns as soon as the job is queued; the caller never learns how the
/// command went.
async fn run_command(
    State(state): State<AppState>,
    payload: Result<Json<RunCommandRequest>, JsonRejection>,
) -> Response {
    let Json(req) = match payload {
        Ok(payload) => payload,
        Err(rejection) => {
            info!(error = %rejection, "Rejected command submission");
            return error_response(StatusCode::BAD_REQUEST, rejection.body_text());
        }
    };

    let job = match JobRecord::new(
        req.executable.unwrap_or_default(),
        req.argument.unwrap_or_default(),
    ) {
        Ok(job) => job,
        Err(e) => {
            info!(error = %e, "Rejected command submission");
            return error_response(StatusCode::BAD_REQUEST, e.to_string());
        }
    };

    match state.dispatcher.dispatch(&job).await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(e) => {
            error!(error = %e, "Failed to dispatch job");
            error_response(StatusCode::SERVICE_UNAVAILABLE, e.to_string())
        }
    }
}

async fn publish_message(
    State(state): State<AppState>,
    Path(queue): Path<String>,
    body: Bytes,
) -> Response {
    let published = async {
        state.transport.declare_queue(&queue).await?;
        state.transport.publish(&queue, body.to_vec()).await
    }
    .await;

    match published {
        Ok(()) => StatusCode::OK.into_response(),
        Err(e) => {
            warn!(queue = %queue, error = %e, "Publish failed");
            error_response(StatusCode::SERVICE_UNAVAILABLE, e.to_string())
        }
    }
}

#[derive(Deserialize)]
struct ReceiveParams {
    wait_ms: Option<u64>,
}

/// Long-poll for the next message on a queue.
///
/// The message is removed from the queue as soon as it is handed out.
/// `204` means nothing arrived within the wait, `410` that the broker is
/// shutting down.
async fn receive_message(
    State(state): State<AppState>,
    Path(queue): Path<String>,
    Query(params): Query<ReceiveParams>,
) -> Response {
    let wait = params
        .wait_ms
        .map(Duration::from_millis)
        .unwrap_or(state.max_poll_wait)
        .min(state.max_poll_wait);

    if let Err(e) = state.transport.declare_queue(&queue).await {
        return error_response(StatusCode::SERVICE_UNAVAILABLE, e.to_string());
    }

    match tokio::time::timeout(wait, state.transport.receive(&queue)).await {
        Ok(Ok(Some(body))) => {
            ([(header::CONTENT_TYPE, "application/json")], body).into_response()
        }
        Ok(Ok(None)) => StatusCode::GONE.into_response(),
        Ok(Err(e)) => {
            warn!(queue = %queue, error = %e, "Receive failed");
            error_response(StatusCode::SERVICE_UNAVAILABLE, e.to_string())
        }
        Err(_) => StatusCode::NO_CONTENT.into_response(),
    }
}
