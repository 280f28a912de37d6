//! Waiting for the display socket with tokio.
//!
//! [`AsyncDisplayFd`] registers a duplicate of the connection socket with the
//! tokio reactor. The async dispatch functions go through the same
//! prepare/read/cancel protocol as blocking dispatch, so they can be mixed with
//! threads reading the same connection.

use std::{
    io::{self, ErrorKind},
    os::fd::OwnedFd,
};

use tokio::io::{Interest, unix::AsyncFd};
use tracing::trace;

use crate::{
    connection::{ConnectionError, READ_BUDGET, ReadIntent},
    display::Display,
    event_queue::EventQueue,
};

/// The display socket, registered with the tokio reactor.
#[derive(Debug)]
pub struct AsyncDisplayFd {
    fd: AsyncFd<OwnedFd>,
}

impl AsyncDisplayFd {
    /// Registers the socket of `display`.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Fails if the display is destroyed or the socket cannot be registered.
    pub fn new(display: &Display) -> Result<Self, ConnectionError> {
        let fd = display
            .get_fd()
            .ok_or(ConnectionError::Disconnected)?
            .try_clone_to_owned()?;
        let fd = AsyncFd::with_interest(fd, Interest::READABLE | Interest::WRITABLE)?;
        Ok(Self { fd })
    }

    /// Waits until the compositor sent something.
    ///
    /// # Errors
    ///
    /// Returns the error of the reactor.
    pub async fn readable(&self) -> io::Result<()> {
        let mut guard = self.fd.readable().await?;
        guard.clear_ready();
        Ok(())
    }

    /// Dispatches the default queue, waiting for events without blocking the thread.
    ///
    /// # Errors
    ///
    /// Returns the fatal error of the connection.
    pub async fn dispatch(&self, display: &Display) -> Result<usize, ConnectionError> {
        self.dispatch_with(display, None).await
    }

    /// Dispatches `queue`, waiting for events without blocking the thread.
    ///
    /// # Errors
    ///
    /// Returns the fatal error of the connection.
    pub async fn dispatch_queue(
        &self,
        display: &Display,
        queue: &EventQueue,
    ) -> Result<usize, ConnectionError> {
        self.dispatch_with(display, Some(queue)).await
    }

    async fn dispatch_with(
        &self,
        display: &Display,
        queue: Option<&EventQueue>,
    ) -> Result<usize, ConnectionError> {
        loop {
            let dispatched = match queue {
                Some(queue) => display.dispatch_queue_pending(queue)?,
                None => display.dispatch_pending()?,
            };
            if dispatched > 0 {
                return Ok(dispatched);
            }

            let prepared = match queue {
                Some(queue) => display.prepare_read_queue(queue),
                None => display.prepare_read(),
            };
            let intent = match prepared {
                Ok(intent) => intent,
                Err(ConnectionError::EventsPending) => continue,
                Err(err) => return Err(err),
            };

            self.flush(display).await?;
            self.wait_and_read(intent).await?;
        }
    }

    async fn flush(&self, display: &Display) -> Result<(), ConnectionError> {
        loop {
            match display.flush() {
                Ok(_) => return Ok(()),
                Err(ConnectionError::WouldBlock) => {
                    trace!("Socket full, waiting until writable");
                    let mut guard = self.fd.writable().await?;
                    guard.clear_ready();
                }
                // The compositor may have left an error behind; reading will tell.
                Err(ConnectionError::Io(err)) if err.kind() == ErrorKind::BrokenPipe => {
                    return Ok(());
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn wait_and_read(&self, intent: ReadIntent) -> Result<(), ConnectionError> {
        let mut guard = self.fd.readable().await?;
        let read = intent.read_events_async().await?;
        // Only a drained socket clears readiness: a waiter never read, and a full
        // budget may have left data behind.
        if read.is_some_and(|read| read < READ_BUDGET) {
            guard.clear_ready();
        }
        Ok(())
    }
}
