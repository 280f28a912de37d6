//! The non-blocking Unix stream socket underneath a connection.

use std::{
    collections::VecDeque,
    io::{self, IoSlice, IoSliceMut},
    net::Shutdown,
    os::{
        fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd},
        unix::net::UnixStream,
    },
};

use nix::{
    poll::{PollFd, PollFlags, PollTimeout, poll},
    sys::socket::{ControlMessage, ControlMessageOwned, MsgFlags, recvmsg, sendmsg},
};

/// The most descriptors the compositor accepts alongside one chunk of data.
pub(crate) const MAX_FDS_OUT: usize = 28;

/// Send and receive halves of the compositor socket.
#[derive(Debug)]
pub(crate) struct Socket(UnixStream);

impl Socket {
    pub(crate) fn new(stream: UnixStream) -> io::Result<Self> {
        stream.set_nonblocking(true)?;
        Ok(Self(stream))
    }

    /// Sends as much of `bytes` as the socket accepts, attaching `fds` as
    /// `SCM_RIGHTS` ancillary data.
    ///
    /// Returns `WouldBlock` instead of waiting when the socket buffer is full.
    pub(crate) fn send_with_fds(&self, bytes: &[u8], fds: &[RawFd]) -> io::Result<usize> {
        let iov = [IoSlice::new(bytes)];
        let rights = [ControlMessage::ScmRights(fds)];
        let cmsgs: &[ControlMessage<'_>] = if fds.is_empty() { &[] } else { &rights };

        sendmsg::<()>(
            self.0.as_raw_fd(),
            &iov,
            cmsgs,
            MsgFlags::MSG_DONTWAIT | MsgFlags::MSG_NOSIGNAL,
            None,
        )
        .map_err(io::Error::from)
    }

    /// Reads whatever is available into `buf`, appending received descriptors to `fds`.
    ///
    /// Returns `Ok(0)` when the compositor closed the connection.
    pub(crate) fn recv_with_fds(
        &self,
        buf: &mut [u8],
        fds: &mut VecDeque<OwnedFd>,
    ) -> io::Result<usize> {
        let mut cmsg_buffer = nix::cmsg_space!([RawFd; MAX_FDS_OUT]);
        let mut iov = [IoSliceMut::new(buf)];

        let msg = recvmsg::<()>(
            self.0.as_raw_fd(),
            &mut iov,
            Some(&mut cmsg_buffer),
            MsgFlags::MSG_DONTWAIT | MsgFlags::MSG_CMSG_CLOEXEC,
        )
        .map_err(io::Error::from)?;

        for cmsg in msg.cmsgs().map_err(io::Error::from)? {
            if let ControlMessageOwned::ScmRights(received) = cmsg {
                fds.extend(received.into_iter().map(|fd| {
                    // SAFETY: the kernel just installed this descriptor for us and nothing else owns it.
                    unsafe { OwnedFd::from_raw_fd(fd) }
                }));
            }
        }

        Ok(msg.bytes)
    }

    /// Blocks until the socket reports one of `interest`, returning the reported flags.
    pub(crate) fn wait(&self, interest: PollFlags) -> io::Result<PollFlags> {
        let mut fds = [PollFd::new(self.0.as_fd(), interest)];
        loop {
            match poll(&mut fds, PollTimeout::NONE) {
                Ok(_) => return Ok(fds[0].revents().unwrap_or(PollFlags::empty())),
                Err(nix::errno::Errno::EINTR) => {}
                Err(err) => return Err(err.into()),
            }
        }
    }

    pub(crate) fn shutdown(&self) -> io::Result<()> {
        self.0.shutdown(Shutdown::Both)
    }
}

impl AsFd for Socket {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.0.as_fd()
    }
}
