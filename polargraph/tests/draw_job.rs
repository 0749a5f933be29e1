//! Draws whole jobs against a pretend plotter that acknowledges every move.

use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc, Arc, Mutex,
    },
    time::Duration,
};

use polargraph::{
    link::{DisconnectEvent, DisconnectEvents},
    Command, DrawJob, DrawingExecutor, ExecutorSettings, ExecutorState, ForceContinue, JobEvent,
    JobSummary, Link, LinkError, LinkSession, MachineConfig, RetryPolicy, SourceSize, ViewState,
};

/// A plotter that reports its position back after every line, like the real firmware.
#[derive(Default)]
struct EchoPlotter {
    /// Whether the plotter is connected.
    connected: AtomicBool,
    /// Everything written to the plotter.
    written: Mutex<String>,
    /// Lines waiting to be read.
    replies: Mutex<VecDeque<String>>,
    /// Disconnect subscribers.
    subscribers: Mutex<Vec<mpsc::Sender<DisconnectEvent>>>,
}

impl EchoPlotter {
    /// Everything written so far.
    fn written(&self) -> String {
        self.written.lock().unwrap().clone()
    }
}

impl Link for EchoPlotter {
    fn connect(&self) -> Result<(), LinkError> {
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn write(&self, text: &str) -> Result<(), LinkError> {
        if !self.is_connected() {
            return Err(LinkError::NotConnected);
        }
        self.written.lock().unwrap().push_str(text);

        let mut replies = self.replies.lock().unwrap();
        for frame in text.lines() {
            let fields: Vec<&str> = frame.split(',').collect();
            if matches!(fields[0], "C09" | "C17") {
                replies.push_back("READY".to_string());
                replies.push_back(format!("SYNC,{},{}", fields[1], fields[2]));
            }
        }
        Ok(())
    }

    fn available(&self) -> Result<usize, LinkError> {
        Ok(self.replies.lock().unwrap().front().map_or(0, String::len))
    }

    fn read_line(&self) -> Result<String, LinkError> {
        self.replies
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| LinkError::Read("nothing to read".to_string()))
    }

    fn subscribe_disconnects(&self) -> DisconnectEvents {
        let (tx, rx) = mpsc::channel();
        self.subscribers.lock().unwrap().push(tx);
        rx
    }
}

/// A connected plotter and an executor driving it, without any of the real delays.
fn setup() -> (Arc<EchoPlotter>, Arc<DrawingExecutor>) {
    let plotter = Arc::new(EchoPlotter::default());
    let session = Arc::new(LinkSession::new(plotter.clone()));
    session.ensure_connected().unwrap();

    let settings = ExecutorSettings {
        retry: RetryPolicy {
            attempts: 3,
            backoff: Duration::ZERO,
        },
        pen_settle_before: Duration::ZERO,
        pen_settle_after: Duration::ZERO,
        poll_interval: Duration::from_millis(1),
        ..ExecutorSettings::default()
    };
    let executor = DrawingExecutor::new(session, MachineConfig::default(), settings);
    (plotter, Arc::new(executor))
}

/// A right angle and a short diagonal on a square canvas.
fn job() -> DrawJob {
    DrawJob {
        polylines: vec![
            vec![(0.0, 0.0).into(), (100.0, 0.0).into(), (100.0, 100.0).into()],
            vec![(50.0, 50.0).into(), (25.0, 75.0).into()],
        ],
        source: SourceSize {
            width: 100.0,
            height: 100.0,
        },
        view: ViewState::default(),
    }
}

#[test]
fn draw_job_wire_stream() {
    let (plotter, executor) = setup();
    let (events, _rx) = mpsc::channel();

    let summary = executor
        .run(&job(), &ForceContinue::new(), &events)
        .expect("job should run");

    assert_eq!(
        summary,
        JobSummary {
            commands: 12,
            sent: 5,
            synced: 7,
            overridden: 0,
            failed: 0
        },
        "every move was acknowledged"
    );
    insta::assert_snapshot!(plotter.written(), @r"
    C14,END
    C09,989,989,END
    C17,843,1416,2,END
    C13,END
    C17,1416,843,2,END
    C17,1961,1597,2,END
    C14,END
    C17,1398,1398,2,END
    C13,END
    C17,1474,1679,2,END
    C14,END
    C17,989,989,2,END
    ");
}

#[test]
fn spawned_job_reports_progress() {
    let (_plotter, executor) = setup();

    let handle = executor.spawn(&job()).expect("job should start");
    let (_force_continue, events, done) = handle.into_parts();
    let events: Vec<JobEvent> = events.iter().collect();
    let summary = done
        .recv()
        .expect("worker should report")
        .expect("job should succeed");

    assert_eq!(summary.synced, 7, "synced");
    assert_eq!(executor.state(), ExecutorState::Idle, "executor is free again");
    assert_eq!(
        events.first(),
        Some(&JobEvent::Started { commands: 12 }),
        "start"
    );
    assert_eq!(
        events.last(),
        Some(&JobEvent::Finished(summary)),
        "finish"
    );

    let positions: Vec<_> = events
        .iter()
        .filter_map(|event| match event {
            JobEvent::Position(position) => Some(*position),
            _ => None,
        })
        .collect();
    assert_eq!(positions.len(), 7, "one position per acknowledged move");

    let home = executor
        .session()
        .last_position()
        .expect("position should be known");
    assert!(
        home.x.abs() < 0.5 && home.y.abs() < 0.5,
        "back home, give or take a step: {home:?}"
    );
}

#[test]
fn initialise_and_single_commands() {
    let (plotter, executor) = setup();

    executor.initialise().expect("init should send");
    executor
        .send_command(&Command::PenDown {
            servo_angle: Some(90),
        })
        .expect("pen down should send");
    executor
        .send_command(&Command::MoveTo {
            position: (0.0, 0.0).into(),
        })
        .expect("move should send");

    insta::assert_snapshot!(plotter.written(), @r"
    C24,420,600,END
    C29,104,END
    C30,400,END
    C31,20,END
    C32,20,END
    C37,1,END
    C13,90,END
    C01,989,989,END
    ");
}
