//! `wl_registry`, the list of globals the compositor advertises.

use std::{fmt, sync::Arc};

use kenai_core::{
    protocol::{Interface, core_interfaces::REGISTRY_INTERFACE},
    wire::message::Argument,
};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::{
    connection::ConnectionError,
    proxy::{Borrowed, Event, Listener, Object, Ownership, Proxy},
};

/// Opcode of `wl_registry.bind`.
const BIND: u16 = 0;

/// A global advertised by the compositor.
#[derive(Debug)]
pub struct Global<'a> {
    /// The numeric name of the global, valid until it is removed.
    pub name: u32,
    /// The interface the global implements.
    pub interface: &'a str,
    /// The highest version the compositor supports.
    pub version: u32,
    registry: Proxy<Borrowed>,
}

impl Global<'_> {
    /// Binds this global at `version`.
    ///
    /// The version is capped at what both sides support.
    ///
    /// # Errors
    ///
    /// Fails if the registry is gone or the global implements another interface.
    pub fn bind<T: Object>(&self, version: u32) -> Result<T, ConnectionError> {
        if self.interface != T::INTERFACE.name {
            return Err(ConnectionError::WrongInterface {
                expected: T::INTERFACE.name,
                found: self.interface.to_owned(),
            });
        }
        let version = version.min(self.version).min(T::INTERFACE.version);
        bind(&self.registry, self.name, version)
    }
}

type GlobalHandler = Box<dyn FnMut(&Global<'_>) + Send>;
type GlobalRemoveHandler = Box<dyn FnMut(u32) + Send>;

#[derive(Default)]
struct RegistryHandlers {
    global: Mutex<Option<GlobalHandler>>,
    global_remove: Mutex<Option<GlobalRemoveHandler>>,
}

impl RegistryHandlers {
    fn global(&self, event: Event<'_>) {
        let [
            Argument::Uint(name),
            Argument::Str(Some(interface)),
            Argument::Uint(version),
        ] = event.args.as_slice()
        else {
            warn!("Malformed wl_registry.global: {:?}", event.args);
            return;
        };
        debug!("Global {name}: {interface} v{version}");

        let global = Global {
            name: *name,
            interface,
            version: *version,
            registry: Proxy::from_id(event.connection, Some(event.sender)),
        };
        // The handler runs without the lock held so it can replace itself.
        let handler = self.global.lock().take();
        if let Some(mut handler) = handler {
            handler(&global);
            self.global.lock().get_or_insert(handler);
        }
    }

    fn global_remove(&self, event: Event<'_>) {
        let [Argument::Uint(name)] = event.args.as_slice() else {
            warn!("Malformed wl_registry.global_remove: {:?}", event.args);
            return;
        };
        debug!("Global {name} removed");

        let handler = self.global_remove.lock().take();
        if let Some(mut handler) = handler {
            handler(*name);
            self.global_remove.lock().get_or_insert(handler);
        }
    }
}

impl fmt::Debug for RegistryHandlers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegistryHandlers")
            .field("global", &self.global.lock().is_some())
            .field("global_remove", &self.global_remove.lock().is_some())
            .finish()
    }
}

static LISTENER: Listener<RegistryHandlers> = Listener {
    interface: &REGISTRY_INTERFACE,
    handlers: &[RegistryHandlers::global, RegistryHandlers::global_remove],
};

/// The `wl_registry` of a display, from [`Display::get_registry`](crate::display::Display::get_registry).
#[derive(Debug)]
pub struct Registry {
    proxy: Proxy,
    handlers: Arc<RegistryHandlers>,
}

impl Registry {
    /// Sets the function called for every `global` event.
    ///
    /// Globals that already exist are announced right after the registry is
    /// created, so set this before the next dispatch.
    pub fn set_global_handler(&self, handler: impl FnMut(&Global<'_>) + Send + 'static) {
        *self.handlers.global.lock() = Some(Box::new(handler));
    }

    /// Sets the function called with the name of every removed global.
    pub fn set_global_remove_handler(&self, handler: impl FnMut(u32) + Send + 'static) {
        *self.handlers.global_remove.lock() = Some(Box::new(handler));
    }

    /// Binds the global `name` as a `T` at `version`.
    ///
    /// # Errors
    ///
    /// Fails if the registry is not valid or the request cannot be sent.
    pub fn bind<T: Object>(&self, name: u32, version: u32) -> Result<T, ConnectionError> {
        bind(&self.proxy, name, version)
    }

    /// Releases the registry locally. `wl_registry` has no destructor request.
    pub fn destroy(&mut self) {
        self.proxy.destroy();
    }
}

fn bind<T: Object, O: Ownership>(
    registry: &Proxy<O>,
    name: u32,
    version: u32,
) -> Result<T, ConnectionError> {
    let proxy = Proxy::create_versioned(registry, T::INTERFACE, version)?;
    let id = proxy.id();
    let object = T::from(proxy);
    registry.marshal(
        BIND,
        vec![
            Argument::Uint(name),
            Argument::Str(Some(T::INTERFACE.name.to_owned())),
            Argument::Uint(version),
            Argument::NewId(id),
        ],
    )?;
    Ok(object)
}

impl From<Proxy> for Registry {
    fn from(proxy: Proxy) -> Self {
        let handlers = Arc::new(RegistryHandlers::default());
        if let Err(err) = proxy.add_listener(&LISTENER, handlers.clone()) {
            warn!("Could not listen on wl_registry: {err}");
        }
        Self { proxy, handlers }
    }
}

impl Object for Registry {
    const INTERFACE: &'static Interface = &REGISTRY_INTERFACE;

    fn proxy(&self) -> &Proxy {
        &self.proxy
    }
}
