mod common;

use std::{sync::Arc, thread};

use common::{setup, with_registry};
use kenai_client::{
    Argument,
    connection::ConnectionError,
    protocol::core_interfaces::REGISTRY_INTERFACE,
};
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use parking_lot::Mutex;

fn announce(server: &mut common::FakeServer, registry: u32, name: u32) {
    server.send_event(
        registry,
        &REGISTRY_INTERFACE,
        0,
        vec![
            Argument::Uint(name),
            Argument::Str(Some("wl_seat".to_owned())),
            Argument::Uint(7),
        ],
    );
}

#[test]
fn pending_events_block_prepare() {
    let (display, mut server, registry, registry_id) = with_registry();
    let names = Arc::new(Mutex::new(Vec::new()));
    registry.set_global_handler({
        let names = names.clone();
        move |global| names.lock().push(global.name)
    });
    announce(&mut server, registry_id, 1);

    let intent = display.prepare_read().unwrap();
    let mut fds = [PollFd::new(intent.connection_fd(), PollFlags::POLLIN)];
    assert_eq!(poll(&mut fds, PollTimeout::from(5000u16)).unwrap(), 1);
    assert!(intent.read_events().unwrap() > 0);

    // Reading alone runs no handler.
    assert!(names.lock().is_empty());
    assert!(matches!(
        display.prepare_read(),
        Err(ConnectionError::EventsPending)
    ));
    assert_eq!(display.dispatch_pending().unwrap(), 1);
    assert_eq!(*names.lock(), vec![1]);

    display.prepare_read().unwrap().cancel_read();
}

#[test]
fn other_queues_do_not_block_prepare() {
    let (display, mut server, _registry, registry_id) = with_registry();
    let queue = display.create_queue().unwrap();
    announce(&mut server, registry_id, 2);

    let intent = display.prepare_read_queue(&queue).unwrap();
    intent.read_events().unwrap();
    // The event landed on the default queue, not on ours.
    display.prepare_read_queue(&queue).unwrap().cancel_read();
    assert!(matches!(
        display.prepare_read(),
        Err(ConnectionError::EventsPending)
    ));
}

#[test]
fn cancel_releases_waiting_reader() {
    let (display, _server) = setup();
    let first = display.prepare_read().unwrap();
    let second = display.prepare_read().unwrap();

    // Whichever side gets there first, the reader returns without data.
    let reader = thread::spawn(move || first.read_events());
    second.cancel_read();
    assert_eq!(reader.join().unwrap().unwrap(), 0);
}

#[test]
fn only_the_last_reader_reads() {
    let (display, mut server, registry, registry_id) = with_registry();
    let names = Arc::new(Mutex::new(Vec::new()));
    registry.set_global_handler({
        let names = names.clone();
        move |global| names.lock().push(global.name)
    });
    announce(&mut server, registry_id, 3);

    let first = display.prepare_read().unwrap();
    let second = display.prepare_read().unwrap();
    let waiting = thread::spawn(move || first.read_events());
    let read = second.read_events().unwrap();
    let waited = waiting.join().unwrap().unwrap();

    // One of the two read the event, the other one found nothing to do.
    assert!(read.min(waited) == 0 && read.max(waited) > 0);
    assert_eq!(display.dispatch_pending().unwrap(), 1);
    assert_eq!(*names.lock(), vec![3]);
}

#[test]
fn dropped_intent_cancels() {
    let (display, mut server, _registry, registry_id) = with_registry();
    drop(display.prepare_read().unwrap());

    announce(&mut server, registry_id, 4);
    // A leaked reader would make this wait forever.
    let intent = display.prepare_read().unwrap();
    let mut fds = [PollFd::new(intent.connection_fd(), PollFlags::POLLIN)];
    poll(&mut fds, PollTimeout::from(5000u16)).unwrap();
    assert!(intent.read_events().unwrap() > 0);
}

#[test]
fn dispatch_returns_after_one_read() {
    let (display, mut server, _registry, registry_id) = with_registry();
    announce(&mut server, registry_id, 5);
    announce(&mut server, registry_id, 6);
    // Both arrive in one read; no global handler is set, the registry listener still runs.
    assert_eq!(display.dispatch().unwrap(), 2);
    assert_eq!(display.dispatch_pending().unwrap(), 0);
}
