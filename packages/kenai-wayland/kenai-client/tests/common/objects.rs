//! Thin wrappers over the test interfaces, in the shape generated code gives them.

use std::{os::fd::OwnedFd, sync::Arc};

use kenai_client::{
    ObjectId,
    connection::ConnectionError,
    proxy::{Event, Listener, Object, Proxy},
};
use kenai_core::{protocol::Interface, wire::message::Argument};
use parking_lot::Mutex;

use super::interfaces::{
    COMPOSITOR_INTERFACE, DATA_DEVICE_INTERFACE, DATA_OFFER_INTERFACE, KEYBOARD_INTERFACE,
    OUTPUT_INTERFACE, REGION_INTERFACE, SHM_INTERFACE, SHM_POOL_INTERFACE, SURFACE_INTERFACE,
};

macro_rules! object {
    ($name:ident, $interface:expr) => {
        impl Object for $name {
            const INTERFACE: &'static Interface = &$interface;

            fn proxy(&self) -> &Proxy {
                &self.proxy
            }
        }
    };
}

fn create<T: Object>(factory: &Proxy, opcode: u16) -> Result<T, ConnectionError> {
    let proxy = Proxy::create(factory, T::INTERFACE)?;
    let id = proxy.id();
    let object = T::from(proxy);
    factory.marshal(opcode, vec![Argument::NewId(id)])?;
    Ok(object)
}

/// `wl_compositor`, no events.
#[derive(Debug)]
pub struct Compositor {
    pub proxy: Proxy,
}

impl Compositor {
    pub fn create_surface(&self) -> Result<Surface, ConnectionError> {
        create(&self.proxy, 0)
    }

    pub fn create_region(&self) -> Result<Region, ConnectionError> {
        create(&self.proxy, 1)
    }
}

impl From<Proxy> for Compositor {
    fn from(proxy: Proxy) -> Self {
        Self { proxy }
    }
}
object!(Compositor, COMPOSITOR_INTERFACE);

/// `wl_region`, destroyed with a request.
#[derive(Debug)]
pub struct Region {
    pub proxy: Proxy,
}

impl Region {
    pub fn add(&self, x: i32, y: i32, width: i32, height: i32) -> Result<(), ConnectionError> {
        self.proxy.marshal(
            1,
            vec![
                Argument::Int(x),
                Argument::Int(y),
                Argument::Int(width),
                Argument::Int(height),
            ],
        )
    }

    pub fn destroy(&mut self) {
        self.proxy.destroy_with_request(0, Vec::new()).ok();
    }
}

impl Drop for Region {
    fn drop(&mut self) {
        self.destroy();
    }
}

impl From<Proxy> for Region {
    fn from(proxy: Proxy) -> Self {
        Self { proxy }
    }
}
object!(Region, REGION_INTERFACE);

/// State shared with the `wl_output` handlers.
#[derive(Debug, Default)]
pub struct OutputState {
    pub scales: Mutex<Vec<i32>>,
}

impl OutputState {
    fn scale(&self, event: Event<'_>) {
        if let [Argument::Int(scale)] = event.args.as_slice() {
            self.scales.lock().push(*scale);
        }
    }

    fn name(&self, _event: Event<'_>) {}
}

static OUTPUT_LISTENER: Listener<OutputState> = Listener {
    interface: &OUTPUT_INTERFACE,
    handlers: &[OutputState::scale, OutputState::name],
};

#[derive(Debug)]
pub struct Output {
    pub proxy: Proxy,
    pub state: Arc<OutputState>,
}

impl From<Proxy> for Output {
    fn from(proxy: Proxy) -> Self {
        let state = Arc::new(OutputState::default());
        proxy.add_listener(&OUTPUT_LISTENER, state.clone()).unwrap();
        Self { proxy, state }
    }
}
object!(Output, OUTPUT_INTERFACE);

/// What a surface saw: the outputs it entered, resolved to their wrappers' state.
#[derive(Debug, Default)]
pub struct SurfaceState {
    pub entered: Mutex<Vec<Option<Arc<OutputState>>>>,
    pub left: Mutex<Vec<Option<ObjectId>>>,
}

impl SurfaceState {
    fn enter(&self, event: Event<'_>) {
        if let [Argument::Object(output)] = event.args.as_slice() {
            let state = event.connection.object_context::<OutputState>(*output);
            self.entered.lock().push(state);
        }
    }

    fn leave(&self, event: Event<'_>) {
        if let [Argument::Object(output)] = event.args.as_slice() {
            self.left.lock().push(*output);
        }
    }
}

pub static SURFACE_LISTENER: Listener<SurfaceState> = Listener {
    interface: &SURFACE_INTERFACE,
    handlers: &[SurfaceState::enter, SurfaceState::leave],
};

#[derive(Debug)]
pub struct Surface {
    pub proxy: Proxy,
    pub state: Arc<SurfaceState>,
}

impl Surface {
    pub fn attach(&self, buffer: Option<ObjectId>) -> Result<(), ConnectionError> {
        self.proxy.marshal(
            1,
            vec![Argument::Object(buffer), Argument::Int(0), Argument::Int(0)],
        )
    }

    pub fn commit(&self) -> Result<(), ConnectionError> {
        self.proxy.marshal(2, Vec::new())
    }

    pub fn offset(&self, x: i32, y: i32) -> Result<(), ConnectionError> {
        self.proxy.marshal(3, vec![Argument::Int(x), Argument::Int(y)])
    }
}

impl From<Proxy> for Surface {
    fn from(proxy: Proxy) -> Self {
        let state = Arc::new(SurfaceState::default());
        proxy.add_listener(&SURFACE_LISTENER, state.clone()).unwrap();
        Self { proxy, state }
    }
}
object!(Surface, SURFACE_INTERFACE);

/// `wl_shm`, used to send a descriptor.
#[derive(Debug)]
pub struct Shm {
    pub proxy: Proxy,
}

impl Shm {
    pub fn create_pool(&self, fd: OwnedFd, size: i32) -> Result<Proxy, ConnectionError> {
        let pool = Proxy::create(&self.proxy, &SHM_POOL_INTERFACE)?;
        self.proxy.marshal(
            0,
            vec![
                Argument::NewId(pool.id()),
                Argument::Fd(fd),
                Argument::Int(size),
            ],
        )?;
        Ok(pool)
    }
}

impl From<Proxy> for Shm {
    fn from(proxy: Proxy) -> Self {
        Self { proxy }
    }
}
object!(Shm, SHM_INTERFACE);

/// Keymaps received by a `wl_keyboard`.
#[derive(Debug, Default)]
pub struct KeyboardState {
    pub keymaps: Mutex<Vec<(u32, OwnedFd, u32)>>,
}

impl KeyboardState {
    fn keymap(&self, event: Event<'_>) {
        let mut args = event.args.into_iter();
        if let (Some(Argument::Uint(format)), Some(Argument::Fd(fd)), Some(Argument::Uint(size))) =
            (args.next(), args.next(), args.next())
        {
            self.keymaps.lock().push((format, fd, size));
        }
    }
}

static KEYBOARD_LISTENER: Listener<KeyboardState> = Listener {
    interface: &KEYBOARD_INTERFACE,
    handlers: &[KeyboardState::keymap],
};

#[derive(Debug)]
pub struct Keyboard {
    pub proxy: Proxy,
    pub state: Arc<KeyboardState>,
}

impl From<Proxy> for Keyboard {
    fn from(proxy: Proxy) -> Self {
        let state = Arc::new(KeyboardState::default());
        proxy.add_listener(&KEYBOARD_LISTENER, state.clone()).unwrap();
        Self { proxy, state }
    }
}
object!(Keyboard, KEYBOARD_INTERFACE);

/// Offers announced by a `wl_data_device`; the offers are adopted in the handler.
#[derive(Debug, Default)]
pub struct DataDeviceState {
    pub offers: Mutex<Vec<Proxy>>,
    pub failures: Mutex<Vec<String>>,
}

impl DataDeviceState {
    fn data_offer(&self, event: Event<'_>) {
        if let [Argument::NewId(id)] = event.args.as_slice() {
            match Proxy::from_new_id(event.connection, *id, &DATA_OFFER_INTERFACE) {
                Ok(offer) => self.offers.lock().push(offer),
                Err(err) => self.failures.lock().push(err.to_string()),
            }
        }
    }
}

static DATA_DEVICE_LISTENER: Listener<DataDeviceState> = Listener {
    interface: &DATA_DEVICE_INTERFACE,
    handlers: &[DataDeviceState::data_offer],
};

#[derive(Debug)]
pub struct DataDevice {
    pub proxy: Proxy,
    pub state: Arc<DataDeviceState>,
}

impl From<Proxy> for DataDevice {
    fn from(proxy: Proxy) -> Self {
        let state = Arc::new(DataDeviceState::default());
        proxy
            .add_listener(&DATA_DEVICE_LISTENER, state.clone())
            .unwrap();
        Self { proxy, state }
    }
}
object!(DataDevice, DATA_DEVICE_INTERFACE);
