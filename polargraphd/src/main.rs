//! # polargraphd
//!
//! Accepts draw jobs over HTTP and streams them to a polargraph plotter on a serial link.

use std::{
    path::PathBuf,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
};

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use clap::Parser;
use polargraph::{
    link::{SerialLink, DEFAULT_BAUD_RATE, DEFAULT_LINK_DEVICE},
    spawn_disconnect_listener, CartesianPosition, Command, ConnectionState, DrawJob,
    DrawingExecutor, ExecutorState, ForceContinue, JobError, JobEvent, JobSummary,
    LinkSession, PlotterConfig,
};
use serde::Serialize;

/// Command line arguments.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Args {
    /// Serial device the plotter is on.
    #[arg(long, default_value = DEFAULT_LINK_DEVICE)]
    device: String,
    /// Baud rate of the serial device.
    #[arg(long, default_value_t = DEFAULT_BAUD_RATE)]
    baud: u32,
    /// Address to listen on.
    #[arg(long, default_value = "0.0.0.0:1789")]
    bind: String,
    /// JSON file with the machine's measurements and timing.
    #[arg(long)]
    config: Option<PathBuf>,
}

/// How far through its commands a job is.
#[derive(Debug, Clone, Copy, Serialize)]
struct Progress {
    /// Commands dealt with so far.
    completed: usize,
    /// Commands in the job.
    total: usize,
}

/// How the last job ended.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "snake_case")]
enum JobReport {
    /// It ran to the end.
    Finished(JobSummary),
    /// It stopped early.
    Failed(String),
}

/// The job currently being drawn.
struct RunningJob {
    /// Tells this job apart from the ones before it.
    id: u64,
    /// Lets the operator end the current wait.
    force_continue: ForceContinue,
    /// How far it has got.
    progress: Progress,
}

/// Shared between request handlers.
struct AppState {
    /// Drives the plotter.
    executor: Arc<DrawingExecutor>,
    /// Numbers jobs as they are started.
    next_job_id: AtomicU64,
    /// The job being drawn, if any.
    running: Mutex<Option<RunningJob>>,
    /// How the last job ended.
    last_job: Mutex<Option<JobReport>>,
}

impl AppState {
    /// Gets the running job slot.
    fn running(&self) -> MutexGuard<'_, Option<RunningJob>> {
        self.running.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Updates the running job, if it is still the one with this id.
    fn update_running(&self, id: u64, update: impl FnOnce(&mut Option<RunningJob>)) {
        let mut running = self.running();
        if running.as_ref().is_some_and(|job| job.id == id) {
            update(&mut running);
        }
    }

    /// Gets the last job's report.
    fn last_job(&self) -> MutexGuard<'_, Option<JobReport>> {
        self.last_job.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// What `GET /status` returns.
#[derive(Debug, Serialize)]
struct Status {
    /// What the executor is doing.
    executor: ExecutorState,
    /// The state of the link.
    connection: ConnectionState,
    /// Where the plotter last said the pen was.
    last_position: Option<CartesianPosition>,
    /// How far the running job has got.
    progress: Option<Progress>,
    /// How the last job ended.
    last_job: Option<JobReport>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => PlotterConfig::load(path)?,
        None => PlotterConfig::default(),
    };

    let link = Arc::new(SerialLink::new(args.device, args.baud));
    let session = Arc::new(LinkSession::new(link));
    if let Err(err) = session.ensure_connected() {
        log::warn!("Plotter not available yet, will keep trying: {err}");
    }
    spawn_disconnect_listener(session.clone());

    let executor = DrawingExecutor::new(session, config.machine, config.executor_settings());
    let state = Arc::new(AppState {
        executor: Arc::new(executor),
        next_job_id: AtomicU64::new(0),
        running: Mutex::new(None),
        last_job: Mutex::new(None),
    });

    let app = Router::new()
        .route(
            "/",
            get("You are lost wayward traveller, there is naught for you here"),
        )
        .route("/jobs", post(start_job))
        .route("/jobs/force-continue", post(force_continue))
        .route("/status", get(status))
        .route("/init", post(initialise))
        .route("/commands", post(send_command))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(args.bind.as_str()).await?;
    log::info!("Listening on {}", args.bind);
    axum::serve(listener, app).await?;
    Ok(())
}

/// The HTTP status to answer a job or command that could not be started with.
fn job_error_status(err: &JobError) -> StatusCode {
    match err {
        JobError::NotConnected | JobError::Send(_) => StatusCode::SERVICE_UNAVAILABLE,
        JobError::Busy => StatusCode::CONFLICT,
        JobError::NoPathData | JobError::EmptyPolyline { .. } | JobError::InvalidProjection(_) => {
            StatusCode::BAD_REQUEST
        }
        JobError::Aborted { .. } | JobError::WorkerLost => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Handles requests to draw a job.
async fn start_job(State(state): State<Arc<AppState>>, Json(job): Json<DrawJob>) -> Response {
    let handle = match state.executor.spawn(&job) {
        Ok(handle) => handle,
        Err(err) => {
            log::warn!("Rejected job: {err}");
            return (job_error_status(&err), err.to_string()).into_response();
        }
    };

    let (force_continue, events, done) = handle.into_parts();
    let id = state.next_job_id.fetch_add(1, Ordering::SeqCst);
    *state.running() = Some(RunningJob {
        id,
        force_continue,
        progress: Progress {
            completed: 0,
            total: 0,
        },
    });

    let watcher = state.clone();
    tokio::task::spawn_blocking(move || {
        for event in events {
            match event {
                JobEvent::Started { commands } => watcher.update_running(id, |running| {
                    if let Some(running) = running {
                        running.progress.total = commands;
                    }
                }),
                JobEvent::CommandFinished(outcome) => watcher.update_running(id, |running| {
                    if let Some(running) = running {
                        running.progress.completed = outcome.index + 1;
                    }
                }),
                JobEvent::Notice(_) | JobEvent::Position(_) | JobEvent::Finished(_) => {}
            }
        }

        let report = match done.recv().unwrap_or(Err(JobError::WorkerLost)) {
            Ok(summary) => JobReport::Finished(summary),
            Err(err) => {
                log::error!("Job failed: {err}");
                JobReport::Failed(err.to_string())
            }
        };
        *watcher.last_job() = Some(report);
        watcher.update_running(id, |running| *running = None);
    });

    (StatusCode::ACCEPTED, "Job started").into_response()
}

/// Handles requests to stop waiting for the plotter.
async fn force_continue(State(state): State<Arc<AppState>>) -> Response {
    match state.running().as_ref() {
        Some(running) => {
            running.force_continue.trigger();
            (StatusCode::OK, "Continuing").into_response()
        }
        None => (StatusCode::NOT_FOUND, "No job is running").into_response(),
    }
}

/// Handles requests for the state of the plotter.
async fn status(State(state): State<Arc<AppState>>) -> Json<Status> {
    let session = state.executor.session();
    Json(Status {
        executor: state.executor.state(),
        connection: session.state(),
        last_position: session.last_position(),
        progress: state.running().as_ref().map(|running| running.progress),
        last_job: state.last_job().clone(),
    })
}

/// Handles requests to send the machine configuration to the plotter.
async fn initialise(State(state): State<Arc<AppState>>) -> Response {
    let executor = state.executor.clone();
    send_response(tokio::task::spawn_blocking(move || executor.initialise()).await)
}

/// Handles requests to send a single command.
async fn send_command(
    State(state): State<Arc<AppState>>,
    Json(command): Json<Command>,
) -> Response {
    let executor = state.executor.clone();
    send_response(tokio::task::spawn_blocking(move || executor.send_command(&command)).await)
}

/// Turns the result of a blocking send into a response.
fn send_response<T>(result: Result<Result<T, JobError>, tokio::task::JoinError>) -> Response {
    match result {
        Ok(Ok(_)) => (StatusCode::OK, "Sent").into_response(),
        Ok(Err(err)) => {
            log::error!("Send failed: {err}");
            (job_error_status(&err), err.to_string()).into_response()
        }
        Err(err) => (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response(),
    }
}
