//! `polargraph`
//!
//! A library for driving polargraph pen plotters: two motors hanging a pen on
//! cables, talking a small line-based protocol over a serial link.

mod commands;
mod config;
mod executor;
mod kinematics;
pub mod link;
mod machine;
mod projection;
mod sender;

pub use commands::{
    decode, Command, CommandCode, DeviceEvent, Frame, ProtocolError, DEFAULT_LINE_RESOLUTION,
    READY_TOKEN, SYNC_TOKEN,
};
pub use config::{FlowTiming, PlotterConfig};
pub use executor::{
    linearize, CommandOutcome, Delivery, DrawJob, DrawingExecutor, ErrorPolicy, ExecutorSettings,
    ExecutorState, ForceContinue, JobError, JobEvent, JobEventTx, JobHandle, JobSummary, Polyline,
    StreamPhase,
};
pub use kinematics::{to_cartesian, to_motor, CartesianPosition, GeometryError, MotorPosition};
pub use link::{spawn_disconnect_listener, ConnectionState, Link, LinkError, LinkSession};
pub use machine::{ConfigError, MachineConfig, MachineDimensions};
pub use projection::{
    project, projection, MachineSpace, Projection, ProjectionError, SourceSize, SourceSpace,
    ViewState, PAPER_PREVIEW_SCALE,
};
pub use sender::{ReliableSender, RetryPolicy, Sent};
