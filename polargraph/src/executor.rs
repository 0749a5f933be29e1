//! `executor`
//!
//! Turns a draw job into commands and streams them to the plotter, waiting
//! for the plotter to catch up after every move.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc, Arc, Mutex, PoisonError,
    },
    thread,
    time::Duration,
};

use serde::{Deserialize, Serialize};

use crate::{
    commands::{decode, Command, DeviceEvent, DEFAULT_LINE_RESOLUTION},
    kinematics::CartesianPosition,
    link::{LinkError, LinkSession},
    machine::MachineConfig,
    projection::{project, projection, Projection, ProjectionError, SourceSize, ViewState},
    sender::{ReliableSender, RetryPolicy, Sent},
};

/// A line through a series of points, in the artwork's own coordinates.
pub type Polyline = Vec<CartesianPosition>;

/// Artwork to draw, and how it was placed on the paper when drawing was requested.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DrawJob {
    /// The lines to draw, in order.
    pub polylines: Vec<Polyline>,
    /// Size of the artwork canvas.
    pub source: SourceSize,
    /// The preview's pan and zoom when the job was created.
    #[serde(default)]
    pub view: ViewState,
}

/// What to do when a command cannot be delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorPolicy {
    /// Log it and move on to the next command.
    ///
    /// A dropped line costs less than restarting a long drawing.
    #[default]
    ContinueOnError,
    /// Stop the job.
    AbortOnError,
}

/// Timing and failure handling for the executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutorSettings {
    /// How hard to try to deliver each command.
    pub retry: RetryPolicy,
    /// Pause before moving the pen servo.
    pub pen_settle_before: Duration,
    /// Pause after moving the pen servo.
    pub pen_settle_after: Duration,
    /// How often to check for a response while waiting for the plotter.
    pub poll_interval: Duration,
    /// Resolution sent with every line.
    pub line_resolution: u32,
    /// What to do when a command cannot be delivered.
    pub error_policy: ErrorPolicy,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        ExecutorSettings {
            retry: RetryPolicy::default(),
            pen_settle_before: Duration::from_millis(1000),
            pen_settle_after: Duration::from_millis(6500),
            poll_interval: Duration::from_millis(15),
            line_resolution: DEFAULT_LINE_RESOLUTION,
            error_policy: ErrorPolicy::ContinueOnError,
        }
    }
}

/// Lets the operator give up on waiting for the plotter.
///
/// Triggering it ends the current (or next) wait for a position report, and
/// the job carries on with the following command. Each trigger ends one wait.
#[derive(Debug, Clone, Default)]
pub struct ForceContinue(Arc<AtomicBool>);

impl ForceContinue {
    /// Creates a new, untriggered [`ForceContinue`].
    pub fn new() -> Self {
        Self::default()
    }

    /// Ends the pending wait.
    pub fn trigger(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Whether a trigger is waiting to be used.
    pub fn is_triggered(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Uses up the trigger, if set.
    fn take(&self) -> bool {
        self.0.swap(false, Ordering::SeqCst)
    }
}

/// What the executor is doing with the current command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamPhase {
    /// Writing the command to the link.
    Sending,
    /// Waiting for the pen servo.
    SettlingPen,
    /// Waiting for the plotter to report its position.
    AwaitingAck,
}

/// What the executor is doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutorState {
    /// No job.
    Idle,
    /// Working out the commands for a job.
    Projecting,
    /// Sending a job's commands.
    Streaming(StreamPhase),
}

/// How a command was delivered.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Delivery {
    /// Written; the plotter does not acknowledge this command.
    Sent,
    /// Written, and the plotter reported this position afterwards.
    Synced(CartesianPosition),
    /// Written, and the operator ended the wait for the plotter.
    Overridden,
}

/// What happened to one command of a job.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandOutcome {
    /// Position of the command in the job.
    pub index: usize,
    /// The command.
    pub command: Command,
    /// How it was delivered, or why it was not.
    pub result: Result<Delivery, LinkError>,
}

/// Totals for a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct JobSummary {
    /// Number of commands in the job.
    pub commands: usize,
    /// Commands sent without waiting for an acknowledgment.
    pub sent: usize,
    /// Commands the plotter reported a position after.
    pub synced: usize,
    /// Commands whose wait the operator ended.
    pub overridden: usize,
    /// Commands that could not be delivered.
    pub failed: usize,
}

/// Progress reports from a running job.
#[derive(Debug, Clone, PartialEq)]
pub enum JobEvent {
    /// The job has been planned and is about to be sent.
    Started {
        /// Number of commands in the job.
        commands: usize,
    },
    /// A command has been dealt with.
    CommandFinished(CommandOutcome),
    /// The plotter said something that is not part of the protocol.
    Notice(String),
    /// The plotter reported where the pen is.
    Position(CartesianPosition),
    /// The job is over.
    Finished(JobSummary),
}

/// Errors that stop a job.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum JobError {
    /// The plotter is not connected.
    #[error("device not connected")]
    NotConnected,
    /// Another job is already running.
    #[error("a job is already running")]
    Busy,
    /// There is nothing to draw.
    #[error("no path data")]
    NoPathData,
    /// A polyline has no points.
    #[error("polyline {index} has no points")]
    EmptyPolyline {
        /// Which polyline.
        index: usize,
    },
    /// The artwork cannot be placed on the paper.
    #[error(transparent)]
    InvalidProjection(#[from] ProjectionError),
    /// A command failed and the job was set to abort on errors.
    #[error("command {index} failed: {source}")]
    Aborted {
        /// Position of the failed command in the job.
        index: usize,
        /// Why it failed.
        source: LinkError,
    },
    /// A single command could not be delivered.
    #[error(transparent)]
    Send(#[from] LinkError),
    /// The thread running the job went away without reporting a result.
    #[error("the job's worker stopped unexpectedly")]
    WorkerLost,
}

/// The shortest pause between checks for a response.
const MIN_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Channel into which job events are sent.
pub type JobEventTx = mpsc::Sender<JobEvent>;

/// Builds the command list for a set of lines already in machine space.
///
/// The pen is lifted and homed, each line is traced with the pen down, and
/// the pen returns home at the end.
///
/// # Arguments
/// * `polylines`: The lines, in mm.
/// * `resolution`: Resolution to send with every line.
///
/// # Returns
/// The commands in the order they must be sent.
///
/// # Errors
/// [`JobError::NoPathData`] if there are no lines, [`JobError::EmptyPolyline`] if a line has no points.
pub fn linearize(polylines: &[Polyline], resolution: u32) -> Result<Vec<Command>, JobError> {
    if polylines.is_empty() {
        return Err(JobError::NoPathData);
    }

    let line_to = |position: CartesianPosition| Command::LineTo {
        position,
        resolution,
    };

    let points: usize = polylines.iter().map(Vec::len).sum();
    let mut commands = Vec::with_capacity(points + 2 * polylines.len() + 3);
    commands.push(Command::PEN_UP);
    commands.push(Command::SetPosition {
        position: CartesianPosition::ORIGIN,
    });

    for (index, polyline) in polylines.iter().enumerate() {
        let Some((first, rest)) = polyline.split_first() else {
            return Err(JobError::EmptyPolyline { index });
        };
        commands.push(line_to(*first));
        commands.push(Command::PEN_DOWN);
        commands.extend(rest.iter().copied().map(line_to));
        commands.push(Command::PEN_UP);
    }

    commands.push(line_to(CartesianPosition::ORIGIN));
    Ok(commands)
}

/// Drives draw jobs through a link session.
pub struct DrawingExecutor {
    /// Delivers commands to the session.
    sender: ReliableSender,
    /// The machine being driven.
    machine: MachineConfig,
    /// Timing and failure handling.
    settings: ExecutorSettings,
    /// What the executor is doing.
    state: Mutex<ExecutorState>,
}

impl DrawingExecutor {
    /// Creates a new [`DrawingExecutor`].
    ///
    /// # Arguments
    /// * `session`: The plotter session, shared with anything else watching the link.
    /// * `machine`: The machine being driven.
    /// * `settings`: Timing and failure handling.
    pub fn new(
        session: Arc<LinkSession>,
        machine: MachineConfig,
        settings: ExecutorSettings,
    ) -> Self {
        DrawingExecutor {
            sender: ReliableSender::new(session, settings.retry),
            machine,
            settings,
            state: Mutex::new(ExecutorState::Idle),
        }
    }

    /// Gets the session commands are sent through.
    pub fn session(&self) -> &Arc<LinkSession> {
        self.sender.session()
    }

    /// Gets the machine being driven.
    pub fn machine(&self) -> &MachineConfig {
        &self.machine
    }

    /// Gets what the executor is doing.
    pub fn state(&self) -> ExecutorState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Sets what the executor is doing.
    fn set_state(&self, state: ExecutorState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    /// Works out the commands for a job without sending anything.
    ///
    /// # Arguments
    /// * `job`: The job to plan.
    ///
    /// # Returns
    /// The commands, in machine space.
    ///
    /// # Errors
    /// A [`JobError`] if the job has nothing to draw or cannot be placed on the paper.
    pub fn plan(&self, job: &DrawJob) -> Result<Vec<Command>, JobError> {
        if job.polylines.is_empty() {
            return Err(JobError::NoPathData);
        }
        let map = projection(job.source, job.view, &self.machine)?;
        linearize(&project_polylines(&map, &job.polylines), self.settings.line_resolution)
    }

    /// Moves the executor out of idle, unless something else already has.
    fn claim(&self, next: ExecutorState) -> Result<(), JobError> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if *state != ExecutorState::Idle {
            return Err(JobError::Busy);
        }
        *state = next;
        Ok(())
    }

    /// Claims the executor for a job and plans it.
    ///
    /// Leaves the executor in [`ExecutorState::Projecting`] on success, and
    /// idle otherwise.
    fn prepare(&self, job: &DrawJob) -> Result<Vec<Command>, JobError> {
        if !self.session().is_connected() {
            return Err(JobError::NotConnected);
        }

        self.claim(ExecutorState::Projecting)?;
        self.plan(job).inspect_err(|_| self.set_state(ExecutorState::Idle))
    }

    /// Draws a job, blocking until every command has been dealt with.
    ///
    /// # Arguments
    /// * `job`: The job to draw.
    /// * `force_continue`: Lets the operator end a wait for the plotter.
    /// * `events`: Where to report progress. Nobody has to be listening.
    ///
    /// # Returns
    /// Totals for the job.
    ///
    /// # Errors
    /// A [`JobError`] if the job cannot be started, or a command fails under [`ErrorPolicy::AbortOnError`].
    pub fn run(
        &self,
        job: &DrawJob,
        force_continue: &ForceContinue,
        events: &JobEventTx,
    ) -> Result<JobSummary, JobError> {
        let commands = self.prepare(job)?;
        let result = self.stream(&commands, force_continue, events);
        self.set_state(ExecutorState::Idle);
        result
    }

    /// Draws a job on a new thread.
    ///
    /// The job is checked and planned before this returns, so a job that
    /// cannot start is reported here and nothing is sent.
    ///
    /// # Arguments
    /// * `job`: The job to draw.
    ///
    /// # Returns
    /// A handle to follow and steer the job.
    ///
    /// # Errors
    /// A [`JobError`] if the job cannot be started.
    pub fn spawn(self: &Arc<Self>, job: &DrawJob) -> Result<JobHandle, JobError> {
        let commands = self.prepare(job)?;

        let force_continue = ForceContinue::new();
        let (events_tx, events_rx) = mpsc::channel();
        let (done_tx, done_rx) = oneshot::channel();

        let executor = Arc::clone(self);
        let worker_force_continue = force_continue.clone();
        thread::spawn(move || {
            let result = executor.stream(&commands, &worker_force_continue, &events_tx);
            executor.set_state(ExecutorState::Idle);
            let _ = done_tx.send(result);
        });

        Ok(JobHandle {
            force_continue,
            events: events_rx,
            done: done_rx,
        })
    }

    /// Sends the machine configuration to the plotter.
    ///
    /// # Errors
    /// [`JobError::Busy`] while a job is running, [`JobError::Send`] if it could not be delivered.
    pub fn initialise(&self) -> Result<Sent, JobError> {
        self.send_command(&Command::Init)
    }

    /// Sends a single command, without waiting for the plotter to act on it.
    ///
    /// Refused while a job is running. Anything the plotter said since the
    /// last command is read and dropped first.
    ///
    /// # Arguments
    /// * `command`: The command to send.
    ///
    /// # Errors
    /// [`JobError::Busy`] while a job is running, [`JobError::Send`] if it could not be delivered.
    pub fn send_command(&self, command: &Command) -> Result<Sent, JobError> {
        self.claim(ExecutorState::Streaming(StreamPhase::Sending))?;
        self.discard_stale_input();
        let sent = self.sender.send(&command.encode(&self.machine));
        self.set_state(ExecutorState::Idle);
        Ok(sent?)
    }

    /// Reads and drops anything already waiting on the link.
    ///
    /// A position report left over from an earlier command would otherwise be
    /// taken as the acknowledgment of the next one. It still updates the
    /// session's last position.
    fn discard_stale_input(&self) {
        let session = self.session();
        let link = session.link();
        loop {
            match link.available() {
                Ok(0) => return,
                Ok(_) => {}
                Err(err) => {
                    log::warn!("Could not check for stale input: {err}");
                    return;
                }
            }

            let line = match link.read_line() {
                Ok(line) => line,
                Err(err) => {
                    log::warn!("Could not read stale input: {err}");
                    return;
                }
            };
            log::debug!("Discarding stale response: {line}");
            if let Ok(DeviceEvent::Sync { position, .. }) = decode(&line, &self.machine) {
                session.set_last_position(position);
            }
        }
    }

    /// Sends every command of a planned job, in order.
    fn stream(
        &self,
        commands: &[Command],
        force_continue: &ForceContinue,
        events: &JobEventTx,
    ) -> Result<JobSummary, JobError> {
        log::info!("Drawing {} commands", commands.len());
        self.discard_stale_input();
        let _ = events.send(JobEvent::Started {
            commands: commands.len(),
        });

        let mut summary = JobSummary {
            commands: commands.len(),
            ..JobSummary::default()
        };

        for (index, command) in commands.iter().enumerate() {
            let result = self.execute(command, force_continue, events);
            match &result {
                Ok(Delivery::Sent) => summary.sent += 1,
                Ok(Delivery::Synced(_)) => summary.synced += 1,
                Ok(Delivery::Overridden) => summary.overridden += 1,
                Err(err) => {
                    summary.failed += 1;
                    log::error!("Command {index} ({command:?}) failed: {err}");
                }
            }

            let _ = events.send(JobEvent::CommandFinished(CommandOutcome {
                index,
                command: *command,
                result: result.clone(),
            }));

            if let Err(source) = result {
                if self.settings.error_policy == ErrorPolicy::AbortOnError {
                    log::error!("Aborting the job at command {index}");
                    let _ = events.send(JobEvent::Finished(summary));
                    return Err(JobError::Aborted { index, source });
                }
            }
        }

        log::info!("Finished drawing: {summary:?}");
        let _ = events.send(JobEvent::Finished(summary));
        Ok(summary)
    }

    /// Sends one command and waits for the plotter as that command requires.
    fn execute(
        &self,
        command: &Command,
        force_continue: &ForceContinue,
        events: &JobEventTx,
    ) -> Result<Delivery, LinkError> {
        let message = command.encode(&self.machine);

        if command.is_pen_movement() {
            // The servo sends nothing back, so give it time either side.
            self.set_state(ExecutorState::Streaming(StreamPhase::SettlingPen));
            thread::sleep(self.settings.pen_settle_before);
            self.set_state(ExecutorState::Streaming(StreamPhase::Sending));
            let sent = self.sender.send(&message);
            self.set_state(ExecutorState::Streaming(StreamPhase::SettlingPen));
            thread::sleep(self.settings.pen_settle_after);
            return sent.map(|_| Delivery::Sent);
        }

        self.set_state(ExecutorState::Streaming(StreamPhase::Sending));
        self.sender.send(&message)?;
        if !command.awaits_sync() {
            return Ok(Delivery::Sent);
        }

        self.set_state(ExecutorState::Streaming(StreamPhase::AwaitingAck));
        self.wait_for_sync(force_continue, events)
    }

    /// Waits for the plotter to report its position, or for the operator to give up waiting.
    fn wait_for_sync(
        &self,
        force_continue: &ForceContinue,
        events: &JobEventTx,
    ) -> Result<Delivery, LinkError> {
        let session = self.session();
        let link = session.link();

        loop {
            if force_continue.take() {
                log::warn!("Force continue, no longer waiting for the device");
                return Ok(Delivery::Overridden);
            }

            if link.available()? == 0 {
                thread::sleep(self.settings.poll_interval.max(MIN_POLL_INTERVAL));
                continue;
            }

            let line = link.read_line()?;
            log::debug!("Received: {line}");
            match decode(&line, &self.machine) {
                Ok(DeviceEvent::Sync { position, .. }) => {
                    session.set_last_position(position);
                    let _ = events.send(JobEvent::Position(position));
                    return Ok(Delivery::Synced(position));
                }
                Ok(DeviceEvent::Ready) => {}
                Ok(DeviceEvent::Message(text)) => {
                    log::warn!("Response: {text}");
                    let _ = events.send(JobEvent::Notice(text));
                }
                Err(err) => {
                    log::warn!("Ignoring response: {err}");
                    let _ = events.send(JobEvent::Notice(err.to_string()));
                }
            }
        }
    }
}

/// Moves every point of every line through a projection.
fn project_polylines(map: &Projection, polylines: &[Polyline]) -> Vec<Polyline> {
    polylines
        .iter()
        .map(|polyline| polyline.iter().map(|point| project(map, *point)).collect())
        .collect()
}

/// A job running on its own thread.
pub struct JobHandle {
    /// The job's force-continue trigger.
    force_continue: ForceContinue,
    /// Progress reports from the job.
    events: mpsc::Receiver<JobEvent>,
    /// Receives the job's result once it is over.
    done: oneshot::Receiver<Result<JobSummary, JobError>>,
}

impl JobHandle {
    /// Gets the job's force-continue trigger.
    pub fn force_continue(&self) -> &ForceContinue {
        &self.force_continue
    }

    /// Gets the job's progress reports.
    pub fn events(&self) -> &mpsc::Receiver<JobEvent> {
        &self.events
    }

    /// Splits the handle into its parts, for when they are consumed in different places.
    pub fn into_parts(
        self,
    ) -> (
        ForceContinue,
        mpsc::Receiver<JobEvent>,
        oneshot::Receiver<Result<JobSummary, JobError>>,
    ) {
        (self.force_continue, self.events, self.done)
    }

    /// Blocks until the job is over.
    ///
    /// # Errors
    /// The job's [`JobError`], or [`JobError::WorkerLost`] if the worker died.
    pub fn wait(self) -> Result<JobSummary, JobError> {
        self.done.recv().unwrap_or(Err(JobError::WorkerLost))
    }
}
