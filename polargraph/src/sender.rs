//! `sender`
//!
//! Gets a single message to the plotter, reconnecting and retrying as needed.

use std::{sync::Arc, thread, time::Duration};

use serde::{Deserialize, Serialize};

use crate::link::{LinkError, LinkSession};

/// How hard to try to get a message through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// How many writes to attempt before giving up.
    pub attempts: u32,
    /// How long to wait between attempts.
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            attempts: 10,
            backoff: Duration::from_secs(5),
        }
    }
}

/// A message made it onto the link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sent {
    /// Which attempt succeeded, counting from 1.
    pub attempts: u32,
}

/// Writes messages to a session, retrying failed writes.
#[derive(Clone)]
pub struct ReliableSender {
    /// The session to write to.
    session: Arc<LinkSession>,
    /// How hard to try.
    policy: RetryPolicy,
}

impl ReliableSender {
    /// Creates a new [`ReliableSender`].
    pub fn new(session: Arc<LinkSession>, policy: RetryPolicy) -> Self {
        ReliableSender { session, policy }
    }

    /// Gets the session this sender writes to.
    pub fn session(&self) -> &Arc<LinkSession> {
        &self.session
    }

    /// Sends a message.
    ///
    /// A write that fails because the device is not connected triggers a
    /// reconnect before the next attempt. Every failure, reconnect or not,
    /// uses up one attempt and waits out the backoff.
    ///
    /// # Arguments
    /// * `message`: The text to write, usually one or more encoded frames.
    ///
    /// # Returns
    /// Which attempt succeeded.
    ///
    /// # Errors
    /// [`LinkError::SendFailed`] once every attempt has failed.
    pub fn send(&self, message: &str) -> Result<Sent, LinkError> {
        let attempts = self.policy.attempts.max(1);
        let mut last = LinkError::NotConnected;

        for attempt in 1..=attempts {
            match self.session.link().write(message) {
                Ok(()) => {
                    log::debug!("Sent: {}", message.trim_end());
                    return Ok(Sent { attempts: attempt });
                }
                Err(err) => {
                    log::error!("Failed to send {:?}: {err}", message.trim_end());
                    if err.is_not_connected() {
                        log::info!("Reconnecting... {attempt}/{attempts}");
                        match self.session.ensure_connected() {
                            Ok(()) => log::info!("Reconnected."),
                            Err(reconnect_err) => {
                                log::error!("Reconnection failed: {reconnect_err}");
                            }
                        }
                    }
                    last = err;
                }
            }

            if attempt < attempts {
                thread::sleep(self.policy.backoff);
            }
        }

        Err(LinkError::SendFailed {
            attempts,
            last: Box::new(last),
        })
    }
}

/// A retry policy that does not wait between attempts.
#[cfg(test)]
pub(crate) fn impatient(attempts: u32) -> RetryPolicy {
    RetryPolicy {
        attempts,
        backoff: Duration::ZERO,
    }
}
