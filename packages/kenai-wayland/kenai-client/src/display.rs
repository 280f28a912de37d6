//! `wl_display`: connecting to the compositor and driving the connection.

use std::{
    env,
    ffi::OsString,
    io,
    os::{
        fd::{AsFd, BorrowedFd, FromRawFd, OwnedFd, RawFd},
        unix::net::UnixStream,
    },
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use kenai_core::{
    protocol::core_interfaces::{CALLBACK_INTERFACE, REGISTRY_INTERFACE, display_request},
    wire::message::Argument,
};
use thiserror::Error;
use tracing::{debug, info};

use crate::{
    callback::Callback,
    connection::{Connection, ConnectionError, FatalError, ReadIntent},
    event_queue::{EventQueue, QueueId},
    object_map::DISPLAY_ID,
    proxy::{Borrowed, Proxy},
    registry::Registry,
};

const DEFAULT_DISPLAY: &str = "wayland-0";

/// A connection to a Wayland compositor, seen through its `wl_display` object.
///
/// Dropping the display closes the connection; every proxy created from it becomes
/// invalid.
#[derive(Debug)]
pub struct Display {
    connection: Option<Connection>,
    proxy: Proxy<Borrowed>,
}

impl Display {
    /// Connects to the compositor named by the environment.
    ///
    /// `WAYLAND_SOCKET` takes precedence and names an already connected file
    /// descriptor. Otherwise `WAYLAND_DISPLAY` (default `wayland-0`) is the socket
    /// name, relative to `XDG_RUNTIME_DIR` unless it is an absolute path.
    ///
    /// # Errors
    ///
    /// This function will return an error if the socket cannot be located or
    /// connected to.
    pub fn connect() -> Result<Self, ConnectError> {
        if let Some(value) = env::var_os("WAYLAND_SOCKET") {
            let fd = parse_socket_fd(&value)?;
            // SAFETY: the launching process handed this descriptor over to us through
            // WAYLAND_SOCKET, nothing else in this process owns it.
            let fd = unsafe { OwnedFd::from_raw_fd(fd) };
            return Self::connect_to_fd(fd);
        }

        let path = socket_path(env::var_os("WAYLAND_DISPLAY"), env::var_os("XDG_RUNTIME_DIR"))?;
        Self::connect_to_path(&path)
    }

    /// Connects to the socket `name`, relative to `XDG_RUNTIME_DIR` unless absolute.
    ///
    /// # Errors
    ///
    /// This function will return an error if the socket cannot be located or
    /// connected to.
    pub fn connect_to_name(name: impl Into<OsString>) -> Result<Self, ConnectError> {
        let path = socket_path(Some(name.into()), env::var_os("XDG_RUNTIME_DIR"))?;
        Self::connect_to_path(&path)
    }

    fn connect_to_path(path: &Path) -> Result<Self, ConnectError> {
        let stream = UnixStream::connect(path).map_err(|source| ConnectError::Connect {
            path: path.to_owned(),
            source,
        })?;
        info!("Connected to {}", path.display());
        Self::connect_to_fd(stream.into())
    }

    /// Uses an already connected socket.
    ///
    /// # Errors
    ///
    /// Fails if the socket cannot be switched to non-blocking mode.
    pub fn connect_to_fd(fd: OwnedFd) -> Result<Self, ConnectError> {
        let connection = Connection::new(UnixStream::from(fd)).map_err(ConnectError::Setup)?;
        let proxy = Proxy::from_id(&connection, Some(DISPLAY_ID));
        debug!("Display ready");
        Ok(Self {
            connection: Some(connection),
            proxy,
        })
    }

    /// Returns `true` until the display is destroyed.
    #[must_use]
    pub fn valid(&self) -> bool {
        self.connection
            .as_ref()
            .is_some_and(|connection| !connection.is_closed())
    }

    /// The shared connection handle.
    #[must_use]
    pub const fn connection(&self) -> Option<&Connection> {
        self.connection.as_ref()
    }

    /// The `wl_display` object, used as a factory for [`Proxy::create`].
    #[must_use]
    pub const fn proxy(&self) -> &Proxy<Borrowed> {
        &self.proxy
    }

    fn connection_or_err(&self) -> Result<&Connection, ConnectionError> {
        self.connection.as_ref().ok_or(ConnectionError::Disconnected)
    }

    fn factory(&self) -> Result<&Proxy<Borrowed>, ConnectionError> {
        self.connection_or_err()?;
        Ok(&self.proxy)
    }

    fn queue_id(&self, queue: &EventQueue) -> Result<QueueId, ConnectionError> {
        let connection = self.connection_or_err()?;
        match queue.id() {
            Some(id) if connection.owns(queue.weak_connection()) => Ok(id),
            _ => Err(ConnectionError::InvalidQueue),
        }
    }

    /// The socket, for waiting on readiness outside the library.
    #[must_use]
    pub fn get_fd(&self) -> Option<BorrowedFd<'_>> {
        self.connection
            .as_ref()
            .map(|connection| connection.socket().as_fd())
    }

    /// Writes buffered requests to the compositor. See [`Connection::flush`].
    ///
    /// # Errors
    ///
    /// Returns [`ConnectionError::WouldBlock`] when the socket is full.
    pub fn flush(&self) -> Result<usize, ConnectionError> {
        self.connection_or_err()?.flush()
    }

    /// Dispatches the default queue, reading from the socket if it is empty.
    ///
    /// Blocks until at least one read happened. Returns the number of events
    /// dispatched, which may be `0`.
    ///
    /// # Errors
    ///
    /// Returns the fatal error of the connection.
    pub fn dispatch(&self) -> Result<usize, ConnectionError> {
        self.connection_or_err()?.dispatch_queue(QueueId::DEFAULT)
    }

    /// Dispatches the events already in the default queue without reading.
    ///
    /// # Errors
    ///
    /// Returns the fatal error of the connection.
    pub fn dispatch_pending(&self) -> Result<usize, ConnectionError> {
        self.connection_or_err()?
            .dispatch_queue_pending(QueueId::DEFAULT)
    }

    /// [`Self::dispatch`] for `queue`.
    ///
    /// # Errors
    ///
    /// Fails with [`ConnectionError::InvalidQueue`] for a queue of another
    /// connection or a destroyed one.
    pub fn dispatch_queue(&self, queue: &EventQueue) -> Result<usize, ConnectionError> {
        let id = self.queue_id(queue)?;
        self.connection_or_err()?.dispatch_queue(id)
    }

    /// [`Self::dispatch_pending`] for `queue`.
    ///
    /// # Errors
    ///
    /// Fails with [`ConnectionError::InvalidQueue`] for a queue of another
    /// connection or a destroyed one.
    pub fn dispatch_queue_pending(&self, queue: &EventQueue) -> Result<usize, ConnectionError> {
        let id = self.queue_id(queue)?;
        self.connection_or_err()?.dispatch_queue_pending(id)
    }

    /// Blocks until the compositor has processed every request sent so far.
    ///
    /// Events sent in response are dispatched on the default queue before this
    /// returns. Returns the number of events dispatched.
    ///
    /// # Errors
    ///
    /// Returns the fatal error of the connection.
    pub fn roundtrip(&self) -> Result<usize, ConnectionError> {
        self.roundtrip_on(QueueId::DEFAULT)
    }

    /// [`Self::roundtrip`], dispatching `queue` while waiting.
    ///
    /// # Errors
    ///
    /// Returns the fatal error of the connection.
    pub fn roundtrip_queue(&self, queue: &EventQueue) -> Result<usize, ConnectionError> {
        let id = self.queue_id(queue)?;
        self.roundtrip_on(id)
    }

    fn roundtrip_on(&self, queue: QueueId) -> Result<usize, ConnectionError> {
        let connection = self.connection_or_err()?;
        let done = Arc::new(AtomicBool::new(false));

        let proxy = Proxy::create(self.factory()?, &CALLBACK_INTERFACE)?;
        proxy.set_queue_id(queue)?;
        let id = proxy.id();
        let callback = Callback::from(proxy);
        callback.set_done_handler({
            let done = done.clone();
            move |_| done.store(true, Ordering::Release)
        });
        self.proxy
            .marshal(display_request::SYNC, vec![Argument::NewId(id)])?;

        let mut dispatched = 0;
        while !done.load(Ordering::Acquire) {
            dispatched += connection.dispatch_queue(queue)?;
        }
        drop(callback);
        Ok(dispatched)
    }

    /// Asks the compositor for a `wl_callback` that fires once every request sent
    /// before it has been processed.
    ///
    /// # Errors
    ///
    /// Fails if the connection is closed or broken.
    pub fn sync(&self) -> Result<Callback, ConnectionError> {
        let proxy = Proxy::create(self.factory()?, &CALLBACK_INTERFACE)?;
        let id = proxy.id();
        let callback = Callback::from(proxy);
        self.proxy
            .marshal(display_request::SYNC, vec![Argument::NewId(id)])?;
        Ok(callback)
    }

    /// Creates the registry. Its `global` events announce every global.
    ///
    /// # Errors
    ///
    /// Fails if the connection is closed or broken.
    pub fn get_registry(&self) -> Result<Registry, ConnectionError> {
        let proxy = Proxy::create(self.factory()?, &REGISTRY_INTERFACE)?;
        let id = proxy.id();
        let registry = Registry::from(proxy);
        self.proxy
            .marshal(display_request::GET_REGISTRY, vec![Argument::NewId(id)])?;
        Ok(registry)
    }

    /// Creates a new event queue on this connection.
    ///
    /// # Errors
    ///
    /// Fails if the connection is closed or broken.
    pub fn create_queue(&self) -> Result<EventQueue, ConnectionError> {
        EventQueue::new(self.connection_or_err()?)
    }

    /// Declares an intent to read events for the default queue.
    ///
    /// # Errors
    ///
    /// Fails with [`ConnectionError::EventsPending`] while the default queue holds
    /// events.
    pub fn prepare_read(&self) -> Result<ReadIntent, ConnectionError> {
        self.connection_or_err()?
            .prepare_read_queue(QueueId::DEFAULT)
    }

    /// Declares an intent to read events for `queue`.
    ///
    /// # Errors
    ///
    /// Fails with [`ConnectionError::EventsPending`] while `queue` holds events.
    pub fn prepare_read_queue(&self, queue: &EventQueue) -> Result<ReadIntent, ConnectionError> {
        let id = self.queue_id(queue)?;
        self.connection_or_err()?.prepare_read_queue(id)
    }

    /// The fatal error of the connection, if any.
    #[must_use]
    pub fn get_error(&self) -> Option<FatalError> {
        self.connection.as_ref()?.get_error()
    }

    /// Closes the connection. Calling it again does nothing.
    pub fn destroy(&mut self) {
        self.proxy.destroy();
        if let Some(connection) = self.connection.take() {
            connection.close();
        }
    }
}

impl Drop for Display {
    fn drop(&mut self) {
        self.destroy();
    }
}

fn parse_socket_fd(value: &std::ffi::OsStr) -> Result<RawFd, ConnectError> {
    value
        .to_str()
        .and_then(|text| text.trim().parse::<RawFd>().ok())
        .filter(|fd| *fd >= 0)
        .ok_or_else(|| ConnectError::InvalidSocketFd(value.to_string_lossy().into_owned()))
}

fn socket_path(
    display: Option<OsString>,
    runtime_dir: Option<OsString>,
) -> Result<PathBuf, ConnectError> {
    let display = PathBuf::from(display.unwrap_or_else(|| DEFAULT_DISPLAY.into()));
    if display.is_absolute() {
        return Ok(display);
    }
    let runtime_dir = runtime_dir.ok_or(ConnectError::NoXdgRuntimeDir)?;
    Ok(PathBuf::from(runtime_dir).join(display))
}

/// Errors that can occur when establishing a connection to a Wayland compositor.
#[derive(Debug, Error)]
pub enum ConnectError {
    /// The `XDG_RUNTIME_DIR` environment variable is not set.
    #[error("XDG_RUNTIME_DIR cannot be found in the environment.")]
    NoXdgRuntimeDir,
    /// `WAYLAND_SOCKET` does not hold a file descriptor number.
    #[error("WAYLAND_SOCKET is not a file descriptor: {0:?}")]
    InvalidSocketFd(String),
    /// Could not connect to the Wayland display.
    #[error("Could not connect to wayland display at {}: {source}", .path.display())]
    Connect {
        /// The socket path.
        path: PathBuf,
        /// The underlying error.
        source: io::Error,
    },
    /// The socket could not be prepared.
    #[error("Could not set up the connection: {0}")]
    Setup(#[source] io::Error),
}
