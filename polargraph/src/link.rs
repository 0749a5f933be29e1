//! `link`
//!
//! The connection to the plotter, and the session that shares it between the
//! drawing executor and the disconnect listener.

mod serial;

use std::{
    sync::{mpsc, Arc, Mutex, MutexGuard, PoisonError},
    thread::{self, JoinHandle},
};

use serde::Serialize;

pub use serial::{SerialLink, DEFAULT_BAUD_RATE, DEFAULT_LINK_DEVICE};

use crate::kinematics::CartesianPosition;

/// Errors that can occur when talking over a [`Link`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LinkError {
    /// The link is not connected to the device.
    #[error("not connected")]
    NotConnected,
    /// Connecting to the device failed.
    #[error("failed to connect: {0}")]
    Connect(String),
    /// Writing to the device failed.
    #[error("failed to write: {0}")]
    Write(String),
    /// Reading from the device failed.
    #[error("failed to read: {0}")]
    Read(String),
    /// A message could not be sent within the retry budget.
    #[error("gave up after {attempts} attempts, last error: {last}")]
    SendFailed {
        /// How many writes were attempted.
        attempts: u32,
        /// The error from the final attempt.
        last: Box<LinkError>,
    },
}

impl LinkError {
    /// Whether this error means the device has gone away and a reconnect may help.
    pub fn is_not_connected(&self) -> bool {
        matches!(self, LinkError::NotConnected)
    }
}

/// Sent to subscribers when a link loses its device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DisconnectEvent;

/// Channel on which [`DisconnectEvent`]s are received.
pub type DisconnectEvents = mpsc::Receiver<DisconnectEvent>;

/// A bidirectional, line-based channel to the plotter.
///
/// Implementations are shared between threads, so every method takes `&self`.
pub trait Link: Send + Sync {
    /// Connects to the device.
    ///
    /// # Errors
    /// A [`LinkError`] if the device cannot be reached.
    fn connect(&self) -> Result<(), LinkError>;

    /// Whether the device is currently connected.
    fn is_connected(&self) -> bool;

    /// Writes text to the device.
    ///
    /// # Errors
    /// [`LinkError::NotConnected`] if the device is not connected, otherwise a [`LinkError::Write`].
    fn write(&self, text: &str) -> Result<(), LinkError>;

    /// How many bytes are waiting to be read.
    ///
    /// # Errors
    /// A [`LinkError`] if the device cannot be queried.
    fn available(&self) -> Result<usize, LinkError>;

    /// Reads one line from the device, without its line ending.
    ///
    /// # Errors
    /// A [`LinkError`] if no line could be read.
    fn read_line(&self) -> Result<String, LinkError>;

    /// Subscribes to disconnect notifications.
    fn subscribe_disconnects(&self) -> DisconnectEvents;
}

/// Where a [`LinkSession`] is in establishing its connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// No device is connected.
    Disconnected,
    /// A connection attempt is in progress.
    Connecting,
    /// The device is connected.
    Connected,
}

/// A live connection to one plotter.
///
/// Connecting goes through [`LinkSession::ensure_connected`], which only lets
/// one attempt run at a time and does nothing if the device is already there,
/// so the sender and the disconnect listener can both call it freely.
pub struct LinkSession {
    /// The link to the device.
    link: Arc<dyn Link>,
    /// Held for the duration of a connection attempt.
    connect_guard: Mutex<()>,
    /// Set while a connection attempt is in progress.
    connecting: Mutex<bool>,
    /// The last position the device reported.
    last_position: Mutex<Option<CartesianPosition>>,
}

impl LinkSession {
    /// Creates a new [`LinkSession`] around a link. Does not connect.
    pub fn new(link: Arc<dyn Link>) -> Self {
        LinkSession {
            link,
            connect_guard: Mutex::new(()),
            connecting: Mutex::new(false),
            last_position: Mutex::new(None),
        }
    }

    /// Gets the underlying link.
    pub fn link(&self) -> &dyn Link {
        self.link.as_ref()
    }

    /// Gets the state of the connection.
    pub fn state(&self) -> ConnectionState {
        if *lock(&self.connecting) {
            ConnectionState::Connecting
        } else if self.link.is_connected() {
            ConnectionState::Connected
        } else {
            ConnectionState::Disconnected
        }
    }

    /// Whether the device is connected.
    pub fn is_connected(&self) -> bool {
        self.link.is_connected()
    }

    /// Connects to the device unless it is already connected.
    ///
    /// # Errors
    /// A [`LinkError`] if the connection attempt failed.
    pub fn ensure_connected(&self) -> Result<(), LinkError> {
        let _guard = lock(&self.connect_guard);
        if self.link.is_connected() {
            return Ok(());
        }

        *lock(&self.connecting) = true;
        let result = self.link.connect();
        *lock(&self.connecting) = false;
        result
    }

    /// Gets the last position the device reported, if any.
    pub fn last_position(&self) -> Option<CartesianPosition> {
        *lock(&self.last_position)
    }

    /// Records a position reported by the device.
    pub fn set_last_position(&self, position: CartesianPosition) {
        *lock(&self.last_position) = Some(position);
    }
}

/// Locks a mutex, carrying on with the data if another thread panicked while holding it.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Long-running task that reconnects a session whenever its link reports a disconnect.
///
/// The task ends when the link drops its subscribers.
///
/// # Arguments
/// * `session`: The session to keep connected.
///
/// # Returns
/// The handle of the listener thread.
pub fn spawn_disconnect_listener(session: Arc<LinkSession>) -> JoinHandle<()> {
    let disconnects = session.link().subscribe_disconnects();
    thread::spawn(move || {
        for _ in disconnects {
            log::warn!("Device disconnected, trying to reconnect...");
            match session.ensure_connected() {
                Ok(()) => log::info!("Reconnected."),
                Err(err) => log::error!("Reconnection failed: {err}"),
            }
        }
    })
}
