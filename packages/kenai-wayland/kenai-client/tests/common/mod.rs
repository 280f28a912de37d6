//! A scripted compositor on the other end of a socket pair, and a few interfaces
//! to talk to it with.

#![allow(dead_code)]

use std::{
    collections::VecDeque,
    io::{IoSlice, IoSliceMut},
    os::{
        fd::{AsRawFd, FromRawFd, OwnedFd, RawFd},
        unix::net::UnixStream,
    },
    time::Duration,
};

use kenai_client::{
    ObjectId,
    display::Display,
    protocol::core_interfaces::{
        CALLBACK_INTERFACE, DISPLAY_INTERFACE, REGISTRY_INTERFACE, display_event,
    },
    proxy::Object,
    registry::Registry,
};
use kenai_core::{
    protocol::Interface,
    wire::{
        HEADER_SIZE,
        message::{Argument, demarshal, marshal},
        serde::{Decode, MessageHeader},
    },
};
use nix::sys::socket::{ControlMessage, ControlMessageOwned, MsgFlags, recvmsg, sendmsg};

pub mod interfaces;
pub mod objects;

/// Connects a display to a fresh fake compositor.
pub fn setup() -> (Display, FakeServer) {
    let (client, server) = UnixStream::pair().unwrap();
    let display = Display::connect_to_fd(client.into()).unwrap();
    (display, FakeServer::new(server))
}

/// Connects and creates the registry, consuming `get_registry` on the server side.
/// Returns the registry id as the server saw it.
pub fn with_registry() -> (Display, FakeServer, Registry, ObjectId) {
    let (display, mut server) = setup();
    let registry = display.get_registry().unwrap();
    display.flush().unwrap();
    let request = server.read_request(&DISPLAY_INTERFACE);
    assert_eq!((request.object_id, request.opcode), (1, 1), "expected wl_display.get_registry");
    let registry_id = request.new_id(0);
    (display, server, registry, registry_id)
}

/// Binds global `name` and consumes the `bind` request on the server side.
pub fn bind<T: Object>(
    display: &Display,
    server: &mut FakeServer,
    registry: &Registry,
    name: u32,
    version: u32,
) -> T {
    let object: T = registry.bind(name, version).unwrap();
    display.flush().unwrap();
    let request = server.read_request(&REGISTRY_INTERFACE);
    assert_eq!(request.opcode, 0, "expected wl_registry.bind");
    assert_eq!(request.new_id(3), object.proxy().id());
    object
}

/// Installs a test subscriber so `RUST_LOG=trace` shows the wire traffic.
pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init()
        .ok();
}

/// A decoded request.
#[derive(Debug)]
pub struct Request {
    pub object_id: ObjectId,
    pub opcode: u16,
    pub args: Vec<Argument>,
}

impl Request {
    pub fn new_id(&self, index: usize) -> ObjectId {
        match &self.args[index] {
            Argument::NewId(id) => *id,
            other => panic!("argument {index} is not a new_id: {other:?}"),
        }
    }
}

pub struct FakeServer {
    stream: UnixStream,
    buffer: Vec<u8>,
    fds: VecDeque<OwnedFd>,
    serial: u32,
}

impl FakeServer {
    pub fn new(stream: UnixStream) -> Self {
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        Self {
            stream,
            buffer: Vec::new(),
            fds: VecDeque::new(),
            serial: 0,
        }
    }

    pub fn send_event(
        &mut self,
        object_id: ObjectId,
        interface: &'static Interface,
        opcode: u16,
        args: Vec<Argument>,
    ) {
        let desc = interface.event(opcode).unwrap();
        let mut bytes = Vec::new();
        let mut fds = Vec::new();
        marshal(object_id, opcode, desc, args, &mut bytes, &mut fds).unwrap();
        self.send_raw(&bytes, &fds);
    }

    pub fn send_raw(&mut self, bytes: &[u8], fds: &[OwnedFd]) {
        let raw: Vec<RawFd> = fds.iter().map(AsRawFd::as_raw_fd).collect();
        let iov = [IoSlice::new(bytes)];
        let rights = [ControlMessage::ScmRights(&raw)];
        let cmsgs: &[ControlMessage<'_>] = if raw.is_empty() { &[] } else { &rights };
        let sent = sendmsg::<()>(self.stream.as_raw_fd(), &iov, cmsgs, MsgFlags::empty(), None)
            .unwrap();
        assert_eq!(sent, bytes.len());
    }

    pub fn delete_id(&mut self, id: ObjectId) {
        self.send_event(
            1,
            &DISPLAY_INTERFACE,
            display_event::DELETE_ID,
            vec![Argument::Uint(id)],
        );
    }

    pub fn post_error(&mut self, object_id: ObjectId, code: u32, message: &str) {
        self.send_event(
            1,
            &DISPLAY_INTERFACE,
            display_event::ERROR,
            vec![
                Argument::Object(Some(object_id)),
                Argument::Uint(code),
                Argument::Str(Some(message.to_owned())),
            ],
        );
    }

    fn fill(&mut self, needed: usize) {
        while self.buffer.len() < needed {
            let mut chunk = [0u8; 4096];
            let read = {
                let mut iov = [IoSliceMut::new(&mut chunk)];
                let mut space = nix::cmsg_space!([RawFd; 28]);
                let msg = recvmsg::<()>(
                    self.stream.as_raw_fd(),
                    &mut iov,
                    Some(&mut space),
                    MsgFlags::MSG_CMSG_CLOEXEC,
                )
                .expect("no request arrived");
                for cmsg in msg.cmsgs().unwrap() {
                    if let ControlMessageOwned::ScmRights(fds) = cmsg {
                        self.fds.extend(
                            fds.into_iter()
                                .map(|fd| unsafe { OwnedFd::from_raw_fd(fd) }),
                        );
                    }
                }
                msg.bytes
            };
            assert!(read > 0, "the client hung up");
            self.buffer.extend_from_slice(&chunk[..read]);
        }
    }

    /// Reads the next request, raw.
    pub fn read_raw(&mut self) -> (MessageHeader, Vec<u8>) {
        self.fill(HEADER_SIZE);
        let header = MessageHeader::decode(&self.buffer).unwrap();
        let size = usize::from(header.size);
        self.fill(size);
        let message: Vec<u8> = self.buffer.drain(..size).collect();
        (header, message)
    }

    /// Reads the next request and decodes it as a request of `interface`.
    pub fn read_request(&mut self, interface: &'static Interface) -> Request {
        let (header, message) = self.read_raw();
        let desc = interface
            .request(header.opcode)
            .unwrap_or_else(|| panic!("{} has no request {}", interface.name, header.opcode));
        let args = demarshal(desc, &message[HEADER_SIZE..], &mut self.fds).unwrap();
        Request {
            object_id: header.object_id,
            opcode: header.opcode,
            args,
        }
    }

    /// Answers a `wl_display.sync` the way a compositor does: `done`, then
    /// `delete_id`. Returns the callback id.
    pub fn answer_sync(&mut self) -> ObjectId {
        let request = self.read_request(&DISPLAY_INTERFACE);
        assert_eq!((request.object_id, request.opcode), (1, 0), "expected wl_display.sync");
        let callback = request.new_id(0);
        self.serial += 1;
        self.send_event(callback, &CALLBACK_INTERFACE, 0, vec![Argument::Uint(self.serial)]);
        self.delete_id(callback);
        callback
    }

    /// Takes the next descriptor received with a request.
    pub fn take_fd(&mut self) -> Option<OwnedFd> {
        self.fds.pop_front()
    }
}
