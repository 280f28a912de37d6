//! Coordination of socket reads between threads.
//!
//! A thread that wants to read first declares its intent with
//! [`Connection::prepare_read_queue`], then either reads or cancels. Only the
//! last thread of a round touches the socket; everyone else waits until that read
//! is over, so no thread can go to sleep on the socket while the events it waits
//! for were already sorted into its queue by another thread.

use std::os::fd::{AsFd, BorrowedFd};

use tracing::{trace, warn};

use parking_lot::MutexGuard;

use super::{Connection, ConnectionError, ConnectionState};
use crate::event_queue::QueueId;

/// The bookkeeping of one read round.
#[derive(Debug, Default)]
pub(crate) struct ReadGate {
    readers: usize,
    serial: u64,
}

/// What withdrawing an intent means for the caller.
#[derive(Debug, PartialEq, Eq)]
enum Withdrawal {
    /// The caller was the last reader of the round.
    Last,
    /// Others are still preparing; the round ends when `serial` changes.
    Wait(u64),
    /// No intent was declared.
    Unpaired,
}

impl ReadGate {
    fn declare(&mut self) {
        self.readers += 1;
    }

    fn withdraw(&mut self) -> Withdrawal {
        match self.readers {
            0 => Withdrawal::Unpaired,
            1 => {
                self.readers = 0;
                Withdrawal::Last
            }
            _ => {
                self.readers -= 1;
                Withdrawal::Wait(self.serial)
            }
        }
    }

    fn finish_round(&mut self) {
        self.serial = self.serial.wrapping_add(1);
    }

    /// The number of threads that declared an intent in the current round.
    #[cfg(test)]
    const fn readers(&self) -> usize {
        self.readers
    }
}

/// A declared intention to read from the connection.
///
/// Obtained from `prepare_read`; consume it with [`ReadIntent::read_events`] or
/// [`ReadIntent::cancel_read`]. Dropping it cancels.
#[must_use = "a read intent blocks other readers until it is read or cancelled"]
#[derive(Debug)]
pub struct ReadIntent {
    connection: Connection,
    pending: bool,
}

impl Connection {
    /// Reads as the last reader of the round, then ends the round.
    fn read_round(
        &self,
        mut guard: MutexGuard<'_, ConnectionState>,
    ) -> Result<usize, ConnectionError> {
        let state = &mut *guard;
        let result = state.check().and_then(|()| state.read_from(self.socket()));
        state.read.finish_round();
        drop(guard);
        self.round_finished();
        if let Ok(read) = &result {
            trace!("Read {read} bytes from the compositor");
        }
        result
    }

    /// Declares an intent to read events for `queue`.
    ///
    /// # Errors
    ///
    /// Fails with [`ConnectionError::EventsPending`] if the queue already holds
    /// events; they have to be dispatched first.
    pub(crate) fn prepare_read_queue(&self, queue: QueueId) -> Result<ReadIntent, ConnectionError> {
        let mut state = self.lock();
        state.check()?;
        if !state.queues.contains(queue) {
            return Err(ConnectionError::InvalidQueue);
        }
        if !state.queues.is_empty(queue) {
            return Err(ConnectionError::EventsPending);
        }
        state.read.declare();
        Ok(ReadIntent {
            connection: self.clone(),
            pending: true,
        })
    }
}

impl ReadIntent {
    /// The socket to poll for readability before calling [`Self::read_events`].
    #[must_use]
    pub fn connection_fd(&self) -> BorrowedFd<'_> {
        self.connection.socket().as_fd()
    }

    /// Reads from the socket and sorts the events into their queues.
    ///
    /// Only the last reader of a round reads; the others block until it is done and
    /// return `0`. The socket is non-blocking, so with nothing to read this returns
    /// immediately as well. Events are not dispatched.
    ///
    /// # Errors
    ///
    /// Returns the fatal error of the connection if reading failed or the
    /// compositor reported one.
    pub fn read_events(mut self) -> Result<usize, ConnectionError> {
        self.pending = false;
        let connection = &self.connection;
        let mut guard = connection.lock();

        match guard.read.withdraw() {
            Withdrawal::Last => connection.read_round(guard),
            Withdrawal::Wait(serial) => {
                while guard.read.serial == serial && !guard.closed {
                    connection.0.read_done.wait(&mut guard);
                }
                guard.check().map(|()| 0)
            }
            Withdrawal::Unpaired => {
                warn!("read_events without a matching prepare_read");
                guard.check().map(|()| 0)
            }
        }
    }

    /// [`Self::read_events`] for async tasks: a reader that is not the last one
    /// awaits the end of the round instead of blocking the thread.
    ///
    /// Returns `Some` with the bytes read if this task did the read, `None` if
    /// another reader did.
    #[cfg(feature = "tokio")]
    pub(crate) async fn read_events_async(mut self) -> Result<Option<usize>, ConnectionError> {
        self.pending = false;
        let connection = &self.connection;
        let serial = {
            let mut guard = connection.lock();
            match guard.read.withdraw() {
                Withdrawal::Last => return connection.read_round(guard).map(Some),
                Withdrawal::Wait(serial) => serial,
                Withdrawal::Unpaired => {
                    warn!("read_events without a matching prepare_read");
                    return guard.check().map(|()| None);
                }
            }
        };

        loop {
            let mut round = std::pin::pin!(connection.0.round_done.notified());
            // Registered before checking, so a round ending in between still wakes us.
            round.as_mut().enable();
            {
                let state = connection.lock();
                if state.read.serial != serial || state.closed {
                    return state.check().map(|()| None);
                }
            }
            round.await;
        }
    }

    /// Withdraws the intent without reading.
    ///
    /// If this was the last pending reader, the threads waiting in
    /// [`Self::read_events`] are woken up.
    pub fn cancel_read(mut self) {
        self.cancel();
    }

    fn cancel(&mut self) {
        if !std::mem::take(&mut self.pending) {
            return;
        }
        let mut state = self.connection.lock();
        match state.read.withdraw() {
            Withdrawal::Last => {
                state.read.finish_round();
                drop(state);
                self.connection.round_finished();
            }
            Withdrawal::Wait(_) => {}
            Withdrawal::Unpaired => warn!("cancel_read without a matching prepare_read"),
        }
    }
}

impl Drop for ReadIntent {
    fn drop(&mut self) {
        self.cancel();
    }
}
