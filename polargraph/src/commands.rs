//! `commands`
//!
//! Renders commands into the text frames the plotter firmware understands,
//! and decodes what the firmware says back.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{
    kinematics::{to_cartesian, to_motor, CartesianPosition, GeometryError, MotorPosition},
    machine::MachineConfig,
};

/// Terminates every frame.
const FRAME_END: &str = "END";
/// The line the firmware sends when it is idle and waiting for a command.
pub const READY_TOKEN: &str = "READY";
/// Prefix of a line reporting the current cable lengths.
pub const SYNC_TOKEN: &str = "SYNC";
/// The line resolution used when none is given.
pub const DEFAULT_LINE_RESOLUTION: u32 = 2;

/// Command codes, as the firmware numbers them.
///
/// The firmware counts commands in hundreds and only the leading digits go on
/// the wire, so the codes are kept as a fixed table rather than worked out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandCode {
    /// Move at full speed.
    MoveTo,
    /// Overwrite the position the firmware thinks it is at.
    SetPosition,
    /// Lower the pen.
    PenDown,
    /// Lift the pen.
    PenUp,
    /// Draw a straight line.
    LineTo,
    /// Set the machine width and height.
    MachineSize,
    /// Set the pulley circumference.
    PulleyCircumference,
    /// Set the steps per revolution.
    StepsPerRevolution,
    /// Set the maximum speed.
    MaxSpeed,
    /// Set the acceleration.
    Acceleration,
    /// Set the step multiplier.
    StepMultiplier,
}

impl CommandCode {
    /// Gets the two digits sent on the wire for this code.
    pub const fn wire_code(self) -> &'static str {
        match self {
            CommandCode::MoveTo => "01",
            CommandCode::SetPosition => "09",
            CommandCode::PenDown => "13",
            CommandCode::PenUp => "14",
            CommandCode::LineTo => "17",
            CommandCode::MachineSize => "24",
            CommandCode::PulleyCircumference => "29",
            CommandCode::StepsPerRevolution => "30",
            CommandCode::MaxSpeed => "31",
            CommandCode::Acceleration => "32",
            CommandCode::StepMultiplier => "37",
        }
    }
}

/// A single line on the wire: `C<code>,<args...>,END`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Which command this frame carries.
    code: CommandCode,
    /// Arguments, already formatted.
    args: Vec<String>,
}

impl Frame {
    /// Creates a new [`Frame`].
    ///
    /// # Arguments
    /// * `code`: The command code.
    /// * `args`: The arguments, in the order the firmware expects them.
    pub fn new(code: CommandCode, args: Vec<String>) -> Self {
        Frame { code, args }
    }

    /// Gets the command code of this frame.
    pub fn code(&self) -> CommandCode {
        self.code
    }

    /// Gets the formatted arguments of this frame.
    pub fn args(&self) -> &[String] {
        &self.args
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "C{},", self.code.wire_code())?;
        for arg in &self.args {
            write!(f, "{arg},")?;
        }
        writeln!(f, "{FRAME_END}")
    }
}

/// A request for the plotter to do something.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Command {
    /// Move to a position as fast as possible, not necessarily in a straight line.
    MoveTo {
        /// Where to move to.
        position: CartesianPosition,
    },
    /// Tell the firmware the pen is at this position, without moving.
    SetPosition {
        /// Where the pen is.
        position: CartesianPosition,
    },
    /// Lower the pen onto the paper.
    PenDown {
        /// Servo angle to use, the firmware default if `None`.
        servo_angle: Option<u16>,
    },
    /// Lift the pen off the paper.
    PenUp {
        /// Servo angle to use, the firmware default if `None`.
        servo_angle: Option<u16>,
    },
    /// Draw a straight line to a position.
    LineTo {
        /// Where the line ends.
        position: CartesianPosition,
        /// Length of the segments the firmware splits the line into.
        resolution: u32,
    },
    /// Send the machine configuration to the firmware.
    Init,
}

impl Command {
    /// Lower the pen with the firmware's default servo angle.
    pub const PEN_DOWN: Command = Command::PenDown { servo_angle: None };
    /// Lift the pen with the firmware's default servo angle.
    pub const PEN_UP: Command = Command::PenUp { servo_angle: None };

    /// A straight line at the default resolution.
    pub fn line_to(position: CartesianPosition) -> Self {
        Command::LineTo {
            position,
            resolution: DEFAULT_LINE_RESOLUTION,
        }
    }

    /// Whether the firmware reports its position once this command is done.
    ///
    /// The executor waits for that report before sending anything else.
    pub fn awaits_sync(&self) -> bool {
        matches!(self, Command::LineTo { .. } | Command::SetPosition { .. })
    }

    /// Whether this command moves the pen servo.
    ///
    /// The firmware does not acknowledge these; the servo needs time to settle instead.
    pub fn is_pen_movement(&self) -> bool {
        matches!(self, Command::PenDown { .. } | Command::PenUp { .. })
    }

    /// Renders this command into frames.
    ///
    /// # Arguments
    /// * `config`: The machine being driven.
    ///
    /// # Returns
    /// The frames, in the order they must be sent. Only [`Command::Init`] has more than one.
    pub fn frames(&self, config: &MachineConfig) -> Vec<Frame> {
        match *self {
            Command::MoveTo { position } => vec![positional(CommandCode::MoveTo, position, config)],
            Command::SetPosition { position } => {
                vec![positional(CommandCode::SetPosition, position, config)]
            }
            Command::PenDown { servo_angle } => vec![pen(CommandCode::PenDown, servo_angle)],
            Command::PenUp { servo_angle } => vec![pen(CommandCode::PenUp, servo_angle)],
            Command::LineTo {
                position,
                resolution,
            } => {
                let mut frame = positional(CommandCode::LineTo, position, config);
                frame.args.push(resolution.to_string());
                vec![frame]
            }
            Command::Init => init_frames(config),
        }
    }

    /// Renders this command into the text to write to the link.
    ///
    /// # Arguments
    /// * `config`: The machine being driven.
    ///
    /// # Returns
    /// One or more newline-terminated frames.
    pub fn encode(&self, config: &MachineConfig) -> String {
        self.frames(config)
            .iter()
            .map(ToString::to_string)
            .collect()
    }
}

/// A frame whose arguments are the cable lengths for a position.
fn positional(code: CommandCode, position: CartesianPosition, config: &MachineConfig) -> Frame {
    let MotorPosition { a, b } = to_motor(position, config);
    Frame::new(code, vec![a.to_string(), b.to_string()])
}

/// A pen servo frame, with the angle only if one was given.
fn pen(code: CommandCode, servo_angle: Option<u16>) -> Frame {
    Frame::new(code, servo_angle.iter().map(ToString::to_string).collect())
}

/// The frames that configure the firmware for a machine.
///
/// Order matters to the firmware: size, circumference, steps, speed,
/// acceleration, multiplier.
#[allow(clippy::cast_possible_truncation)]
fn init_frames(config: &MachineConfig) -> Vec<Frame> {
    let dimensions = config.dimensions();
    let circumference = config.pulley_circumference().round() as i64;

    vec![
        Frame::new(
            CommandCode::MachineSize,
            vec![dimensions.width.to_string(), dimensions.height.to_string()],
        ),
        Frame::new(
            CommandCode::PulleyCircumference,
            vec![circumference.to_string()],
        ),
        Frame::new(
            CommandCode::StepsPerRevolution,
            vec![dimensions.steps_per_revolution.to_string()],
        ),
        Frame::new(CommandCode::MaxSpeed, vec![dimensions.max_speed.to_string()]),
        Frame::new(
            CommandCode::Acceleration,
            vec![dimensions.acceleration.to_string()],
        ),
        Frame::new(
            CommandCode::StepMultiplier,
            vec![dimensions.step_multiplier.to_string()],
        ),
    ]
}

/// Something the firmware said.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceEvent {
    /// The firmware is idle.
    Ready,
    /// The firmware reported where the pen is.
    Sync {
        /// The reported cable lengths.
        motors: MotorPosition,
        /// The pen position those lengths work out to.
        position: CartesianPosition,
    },
    /// Anything else, passed on to whoever is watching.
    Message(String),
}

/// Errors that can occur when decoding a line from the firmware.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    /// The line looked like a position report but the numbers could not be read.
    #[error("malformed position report {0:?}")]
    MalformedSync(String),
    /// The reported position is not somewhere the pen can be.
    #[error("position report is unreachable: {0}")]
    Unreachable(#[from] GeometryError),
}

/// Decodes one line from the firmware.
///
/// # Arguments
/// * `line`: The line, with or without its line ending.
/// * `config`: The machine being driven, used to triangulate position reports.
///
/// # Returns
/// The decoded event.
///
/// # Errors
/// A [`ProtocolError`] if the line is a position report that cannot be used.
pub fn decode(line: &str, config: &MachineConfig) -> Result<DeviceEvent, ProtocolError> {
    let line = line.trim();

    // Blank lines carry nothing, so they are as good as a ready.
    if line.is_empty() || line == READY_TOKEN {
        return Ok(DeviceEvent::Ready);
    }

    if let Some(fields) = line.strip_prefix(SYNC_TOKEN) {
        let motors = parse_sync_fields(fields)
            .ok_or_else(|| ProtocolError::MalformedSync(line.to_string()))?;
        let position = to_cartesian(motors, config)?;
        return Ok(DeviceEvent::Sync { motors, position });
    }

    Ok(DeviceEvent::Message(line.to_string()))
}

/// Reads `,<a>,<b>` off the front of a position report.
fn parse_sync_fields(fields: &str) -> Option<MotorPosition> {
    let mut fields = fields.strip_prefix(',')?.split(',');
    let mut next_number = || {
        let field = fields.next()?;
        if field.is_empty() || !field.bytes().all(|byte| byte.is_ascii_digit()) {
            return None;
        }
        field.parse::<u32>().ok()
    };

    Some(MotorPosition {
        a: next_number()?,
        b: next_number()?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_positional() {
        let config = MachineConfig::default();

        assert_eq!(
            Command::MoveTo {
                position: CartesianPosition::ORIGIN
            }
            .encode(&config),
            "C01,989,989,END\n",
            "move"
        );
        assert_eq!(
            Command::SetPosition {
                position: CartesianPosition::ORIGIN
            }
            .encode(&config),
            "C09,989,989,END\n",
            "set position"
        );
        assert_eq!(
            Command::line_to((-50.0, 100.0).into()).encode(&config),
            "C17,1137,1382,2,END\n",
            "line with default resolution"
        );
    }

    #[test]
    fn test_encode_pen() {
        let config = MachineConfig::default();

        assert_eq!(Command::PEN_DOWN.encode(&config), "C13,END\n", "default angle");
        assert_eq!(Command::PEN_UP.encode(&config), "C14,END\n", "default angle");
        assert_eq!(
            Command::PenUp {
                servo_angle: Some(90)
            }
            .encode(&config),
            "C14,90,END\n",
            "explicit angle"
        );
    }

    #[test]
    fn test_encode_init() {
        let config = MachineConfig::default();

        let frames = Command::Init.frames(&config);
        let codes: Vec<_> = frames.iter().map(|frame| frame.code().wire_code()).collect();
        assert_eq!(codes, ["24", "29", "30", "31", "32", "37"], "frame order");
        assert_eq!(
            frames[1].args(),
            [(16.62 * std::f64::consts::TAU).round().to_string()],
            "circumference"
        );

        assert_eq!(
            Command::Init.encode(&config),
            "C24,420,600,END\nC29,104,END\nC30,400,END\nC31,20,END\nC32,20,END\nC37,1,END\n",
            "whole block"
        );
    }

    #[test]
    fn test_decode() {
        let config = MachineConfig::default();

        assert_eq!(decode("READY\r\n", &config), Ok(DeviceEvent::Ready), "ready");
        assert_eq!(decode("\r\n", &config), Ok(DeviceEvent::Ready), "blank line");
        assert_eq!(
            decode("hello there", &config),
            Ok(DeviceEvent::Message("hello there".to_string())),
            "anything else"
        );

        let Ok(DeviceEvent::Sync { motors, position }) = decode("SYNC,1000,1000", &config) else {
            panic!("SYNC,1000,1000 should decode");
        };
        assert_eq!(motors, MotorPosition { a: 1000, b: 1000 }, "motors");
        let expected = to_cartesian(motors, &config).unwrap();
        assert!(
            (position.x - expected.x).abs() <= config.millimeters_per_step()
                && (position.y - expected.y).abs() <= config.millimeters_per_step(),
            "position"
        );
    }

    #[test]
    fn test_decode_bad_sync() {
        let config = MachineConfig::default();

        assert_eq!(
            decode("SYNC,12,x", &config),
            Err(ProtocolError::MalformedSync("SYNC,12,x".to_string())),
            "not a number"
        );
        assert_eq!(
            decode("SYNC,-1,5", &config),
            Err(ProtocolError::MalformedSync("SYNC,-1,5".to_string())),
            "negative"
        );
        assert_eq!(
            decode("SYNC,10,5000", &config),
            Err(ProtocolError::Unreachable(GeometryError(MotorPosition {
                a: 10,
                b: 5000
            }))),
            "cables cannot meet"
        );
    }
}
