//! `serial`
//!
//! A [`Link`] over a serial port. A paired Bluetooth plotter shows up as one
//! of these, e.g. `/dev/rfcomm0`.

use std::{
    io::{self, Read, Write},
    sync::{mpsc, Mutex, MutexGuard},
    time::Duration,
};

use serialport::SerialPort;

use super::{lock, DisconnectEvent, DisconnectEvents, Link, LinkError};

/// The default device to talk to.
pub const DEFAULT_LINK_DEVICE: &str = "/dev/rfcomm0";
/// The default baud rate of the plotter's serial module.
pub const DEFAULT_BAUD_RATE: u32 = 9600;
/// How long a single read may block.
const READ_TIMEOUT: Duration = Duration::from_millis(500);

/// An open port and anything read from it that is not a whole line yet.
struct OpenPort {
    /// The port itself.
    port: Box<dyn SerialPort>,
    /// Bytes read but not yet returned.
    pending: Vec<u8>,
}

/// A plotter on the end of a serial port.
pub struct SerialLink {
    /// Path of the serial device.
    path: String,
    /// Baud rate to open the port at.
    baud_rate: u32,
    /// The port, if connected.
    port: Mutex<Option<OpenPort>>,
    /// Who to tell when the port goes away.
    subscribers: Mutex<Vec<mpsc::Sender<DisconnectEvent>>>,
}

impl SerialLink {
    /// Creates a new [`SerialLink`]. Does not open the port.
    ///
    /// # Arguments
    /// * `path`: The serial device, e.g. [`DEFAULT_LINK_DEVICE`].
    /// * `baud_rate`: The baud rate to open the port at.
    pub fn new(path: impl Into<String>, baud_rate: u32) -> Self {
        SerialLink {
            path: path.into(),
            baud_rate,
            port: Mutex::new(None),
            subscribers: Mutex::new(Vec::new()),
        }
    }

    /// Gets the path of the serial device.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Closes the port, telling subscribers.
    pub fn disconnect(&self) {
        let mut port = lock(&self.port);
        if port.take().is_some() {
            drop(port);
            self.notify_disconnected();
        }
    }

    /// Forgets the port after it has failed, and tells subscribers.
    fn lost(&self, mut port: MutexGuard<'_, Option<OpenPort>>, err: &io::Error) -> LinkError {
        log::error!("Lost {}: {err}", self.path);
        *port = None;
        drop(port);
        self.notify_disconnected();
        LinkError::NotConnected
    }

    /// Sends a [`DisconnectEvent`] to every live subscriber.
    fn notify_disconnected(&self) {
        lock(&self.subscribers).retain(|subscriber| subscriber.send(DisconnectEvent).is_ok());
    }
}

/// Whether an I/O error means the port is gone rather than just slow.
fn port_gone(err: &io::Error) -> bool {
    !matches!(
        err.kind(),
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}

/// Takes the first whole line out of a buffer, if there is one.
fn take_line(pending: &mut Vec<u8>) -> Option<String> {
    let end = pending.iter().position(|byte| *byte == b'\n')?;
    let mut line: Vec<u8> = pending.drain(..=end).collect();
    line.pop();
    if line.last() == Some(&b'\r') {
        line.pop();
    }
    Some(String::from_utf8_lossy(&line).into_owned())
}

impl Link for SerialLink {
    fn connect(&self) -> Result<(), LinkError> {
        let mut port = lock(&self.port);
        if port.is_some() {
            return Ok(());
        }

        let opened = serialport::new(&self.path, self.baud_rate)
            .timeout(READ_TIMEOUT)
            .open()
            .map_err(|err| LinkError::Connect(format!("{}: {err}", self.path)))?;
        log::info!("Connected to {} at {} baud", self.path, self.baud_rate);
        *port = Some(OpenPort {
            port: opened,
            pending: Vec::new(),
        });
        Ok(())
    }

    fn is_connected(&self) -> bool {
        lock(&self.port).is_some()
    }

    fn write(&self, text: &str) -> Result<(), LinkError> {
        let mut port = lock(&self.port);
        let Some(open) = port.as_mut() else {
            return Err(LinkError::NotConnected);
        };

        match open
            .port
            .write_all(text.as_bytes())
            .and_then(|()| open.port.flush())
        {
            Ok(()) => Ok(()),
            Err(err) if port_gone(&err) => Err(self.lost(port, &err)),
            Err(err) => Err(LinkError::Write(err.to_string())),
        }
    }

    fn available(&self) -> Result<usize, LinkError> {
        let port = lock(&self.port);
        let Some(open) = port.as_ref() else {
            return Err(LinkError::NotConnected);
        };

        let waiting = open
            .port
            .bytes_to_read()
            .map_err(|err| LinkError::Read(err.to_string()))?;
        Ok(open.pending.len() + waiting as usize)
    }

    fn read_line(&self) -> Result<String, LinkError> {
        let mut port = lock(&self.port);
        let mut buffer = [0_u8; 256];

        loop {
            let Some(open) = port.as_mut() else {
                return Err(LinkError::NotConnected);
            };
            if let Some(line) = take_line(&mut open.pending) {
                return Ok(line);
            }

            match open.port.read(&mut buffer) {
                Ok(0) => {
                    let err = io::Error::from(io::ErrorKind::UnexpectedEof);
                    return Err(self.lost(port, &err));
                }
                Ok(read) => open.pending.extend_from_slice(&buffer[..read]),
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) if port_gone(&err) => return Err(self.lost(port, &err)),
                Err(err) => return Err(LinkError::Read(err.to_string())),
            }
        }
    }

    fn subscribe_disconnects(&self) -> DisconnectEvents {
        let (tx, rx) = mpsc::channel();
        lock(&self.subscribers).push(tx);
        rx
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_take_line() {
        let mut pending = b"SYNC,1,2\r\nREA".to_vec();
        assert_eq!(take_line(&mut pending), Some("SYNC,1,2".to_string()), "first line");
        assert_eq!(pending, b"REA", "partial line is kept");
        assert_eq!(take_line(&mut pending), None, "no whole line yet");

        pending.extend_from_slice(b"DY\n");
        assert_eq!(take_line(&mut pending), Some("READY".to_string()), "completed");
    }

    #[test]
    fn test_unopened_port() {
        let link = SerialLink::new("/dev/does-not-exist", DEFAULT_BAUD_RATE);
        assert!(!link.is_connected(), "not opened yet");
        assert_eq!(link.write("C14,END\n"), Err(LinkError::NotConnected), "write");
        assert_eq!(link.available(), Err(LinkError::NotConnected), "available");
        assert!(
            matches!(link.connect(), Err(LinkError::Connect(_))),
            "missing device"
        );
    }
}
