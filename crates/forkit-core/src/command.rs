//! Line-oriented control channel between the supervisor and the fork server
//!
//! One command per line, whitespace separated:
//!
//! ```text
//! spawn <count>
//! setconfig <name> <value>
//! ```

use crate::{ForkitError, Result};
use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, PollTimeout};
use std::io::{ErrorKind, Read};
use std::os::fd::{AsFd, AsRawFd, RawFd};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Longest accepted command line; longer lines are discarded
pub const MAX_LINE_LEN: usize = 4096;

const READ_CHUNK: usize = 1024;

/// A parsed control command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Fork this many workers; non-positive counts are rejected by the pool
    Spawn(i64),
    /// Apply a named configuration directive
    SetConfig { name: String, value: String },
    /// Anything else, kept for logging
    Unknown(String),
}

impl Command {
    /// Parse one line. Blank lines yield `None`.
    pub fn parse(line: &str) -> Result<Option<Self>> {
        let mut tokens = line.split_whitespace();
        let Some(verb) = tokens.next() else {
            return Ok(None);
        };

        let command = match verb {
            "spawn" => {
                let count = tokens.next().ok_or_else(|| {
                    ForkitError::CommandProtocol("spawn requires a count".into())
                })?;
                let count = count.parse::<i64>().map_err(|e| {
                    ForkitError::CommandProtocol(format!("invalid spawn count {count:?}: {e}"))
                })?;
                Self::Spawn(count)
            }
            "setconfig" => match (tokens.next(), tokens.next()) {
                (Some(name), Some(value)) => Self::SetConfig {
                    name: name.to_owned(),
                    value: value.to_owned(),
                },
                _ => {
                    return Err(ForkitError::CommandProtocol(
                        "setconfig requires a name and a value".into(),
                    ));
                }
            },
            _ => return Ok(Some(Self::Unknown(line.trim().to_owned()))),
        };

        // Exactly `spawn <N>` or `setconfig <name> <value>`.
        if tokens.next().is_some() {
            return Ok(Some(Self::Unknown(line.trim().to_owned())));
        }

        Ok(Some(command))
    }
}

/// Outcome of one [`CommandChannel::read_line`] call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    Line(String),
    /// Nothing arrived before the poll timeout
    Idle,
    /// End of stream, or termination was requested
    Closed,
}

/// Reads newline-terminated commands from a descriptor with a bounded wait
pub struct CommandChannel<R> {
    source: R,
    buffer: Vec<u8>,
    discarding: bool,
    timeout: Duration,
    terminate: Arc<AtomicBool>,
}

impl<R: Read + AsFd> CommandChannel<R> {
    pub fn new(source: R, timeout: Duration, terminate: Arc<AtomicBool>) -> Self {
        Self {
            source,
            buffer: Vec::with_capacity(READ_CHUNK),
            discarding: false,
            timeout,
            terminate,
        }
    }

    /// Raw descriptor of the channel, closed by forked workers
    pub fn raw_fd(&self) -> RawFd {
        self.source.as_fd().as_raw_fd()
    }

    /// Return the next complete line, waiting at most the configured timeout.
    ///
    /// Buffered lines are returned without polling.
    pub fn read_line(&mut self) -> Result<ChannelEvent> {
        loop {
            if let Some(line) = self.take_line() {
                return Ok(ChannelEvent::Line(line));
            }

            if self.terminate.load(Ordering::SeqCst) {
                return Ok(ChannelEvent::Closed);
            }

            if !self.wait_readable()? {
                return Ok(ChannelEvent::Idle);
            }

            if self.terminate.load(Ordering::SeqCst) {
                return Ok(ChannelEvent::Closed);
            }

            let mut chunk = [0u8; READ_CHUNK];
            match self.source.read(&mut chunk) {
                Ok(0) => {
                    if !self.buffer.is_empty() {
                        tracing::debug!(bytes = self.buffer.len(), "dropping unterminated command at end of stream");
                    }
                    return Ok(ChannelEvent::Closed);
                }
                Ok(n) => self.push(&chunk[..n]),
                Err(e) if matches!(e.kind(), ErrorKind::Interrupted | ErrorKind::WouldBlock) => {}
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Poll for input. `false` means the timeout elapsed.
    fn wait_readable(&self) -> Result<bool> {
        let millis = u16::try_from(self.timeout.as_millis()).unwrap_or(u16::MAX);
        let mut fds = [PollFd::new(self.source.as_fd(), PollFlags::POLLIN)];

        match nix::poll::poll(&mut fds, PollTimeout::from(millis)) {
            Ok(0) => Ok(false),
            Ok(_) | Err(Errno::EINTR) => Ok(true),
            Err(e) => Err(ForkitError::CommandProtocol(format!("poll failed: {e}"))),
        }
    }

    fn push(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);

        if self.buffer.len() > MAX_LINE_LEN && !self.buffer.contains(&b'\n') {
            tracing::error!(max = MAX_LINE_LEN, "command line too long, discarding");
            self.buffer.clear();
            self.discarding = true;
        }
    }

    fn take_line(&mut self) -> Option<String> {
        loop {
            let pos = self.buffer.iter().position(|&b| b == b'\n')?;
            let raw: Vec<u8> = self.buffer.drain(..=pos).collect();

            // Tail of a line already reported as too long.
            if std::mem::take(&mut self.discarding) {
                continue;
            }
            if pos > MAX_LINE_LEN {
                tracing::error!(max = MAX_LINE_LEN, len = pos, "command line too long, discarding");
                continue;
            }

            let line = String::from_utf8_lossy(&raw[..pos]);
            return Some(line.trim_end_matches('\r').to_owned());
        }
    }
}
