//! `wl_callback`, the one-shot completion object.

use std::sync::Arc;

use kenai_core::{
    protocol::{Interface, core_interfaces::CALLBACK_INTERFACE},
    wire::message::Argument,
};
use parking_lot::Mutex;
use tracing::warn;

use crate::proxy::{Event, Listener, Object, Proxy};

type DoneHandler = Box<dyn FnOnce(u32) + Send>;

#[derive(Default)]
struct CallbackHandlers {
    done: Mutex<Option<DoneHandler>>,
}

impl CallbackHandlers {
    fn done(&self, event: Event<'_>) {
        let [Argument::Uint(data)] = event.args.as_slice() else {
            warn!("Malformed wl_callback.done: {:?}", event.args);
            return;
        };
        // Taken before calling, the handler may well set a new one.
        let handler = self.done.lock().take();
        if let Some(handler) = handler {
            handler(*data);
        }
    }
}

static LISTENER: Listener<CallbackHandlers> = Listener {
    interface: &CALLBACK_INTERFACE,
    handlers: &[CallbackHandlers::done],
};

/// A `wl_callback`, as returned by [`Display::sync`](crate::display::Display::sync).
///
/// The compositor sends `done` once and destroys the object itself, so dropping a
/// callback never sends a request.
#[derive(Debug)]
pub struct Callback {
    proxy: Proxy,
    handlers: Arc<CallbackHandlers>,
}

impl Callback {
    /// Sets the function called with the event data of `done`.
    pub fn set_done_handler(&self, handler: impl FnOnce(u32) + Send + 'static) {
        *self.handlers.done.lock() = Some(Box::new(handler));
    }

    /// Releases the callback locally.
    pub fn destroy(&mut self) {
        self.proxy.destroy();
    }
}

impl From<Proxy> for Callback {
    fn from(proxy: Proxy) -> Self {
        let handlers = Arc::new(CallbackHandlers::default());
        if let Err(err) = proxy.add_listener(&LISTENER, handlers.clone()) {
            warn!("Could not listen on wl_callback: {err}");
        }
        Self { proxy, handlers }
    }
}

impl Object for Callback {
    const INTERFACE: &'static Interface = &CALLBACK_INTERFACE;

    fn proxy(&self) -> &Proxy {
        &self.proxy
    }
}

impl std::fmt::Debug for CallbackHandlers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackHandlers")
            .field("done", &self.done.lock().is_some())
            .finish()
    }
}
