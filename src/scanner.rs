//! Scanner / session tracker: subscribes to USB attach/detach notification,
//! classifies devices, owns per-port session state, and drives the boot
//! protocol for each device it recognizes.

use crate::blob::BlobProvider;
use crate::boot::{file_server, second_stage_boot};
use crate::config::Config;
use crate::error::ProtocolError;
use crate::events::{EventSink, Session};
use crate::identity::{classify, device_id, port_id, Classification, Family};
use crate::transport::UsbTransport;
use log::{debug, info, warn};
use parking_lot::Mutex;
use rusb::{Context, Device, Hotplug, HotplugBuilder, Registration, UsbContext};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

const POLL_INTERVAL: Duration = Duration::from_millis(500);
const HOTPLUG_EVENT_TIMEOUT: Duration = Duration::from_millis(200);

/// A classification snapshot taken from a live device. Detach handling
/// needs only this -- never a live `Device` handle, since by definition
/// the device is on its way out.
#[derive(Debug, Clone)]
struct DeviceSnapshot {
    device_id: String,
    port_id: String,
    classification: Classification,
    serial_index: u8,
}

fn snapshot_device<T: UsbContext>(device: &Device<T>) -> Option<DeviceSnapshot> {
    let desc = device.device_descriptor().ok()?;
    Some(DeviceSnapshot {
        device_id: device_id(device),
        port_id: port_id(device),
        classification: classify(desc.vendor_id(), desc.product_id()),
        serial_index: desc.serial_number_string_index().unwrap_or(0),
    })
}

struct SharedState {
    sessions: Mutex<HashMap<String, Session>>,
    seen_ids: Mutex<HashSet<String>>,
    sink: Arc<dyn EventSink>,
    blobs: Arc<dyn BlobProvider>,
    config: Config,
}

impl SharedState {
    /// Inserts a session for `port_id` if one doesn't already exist,
    /// emitting `attach` exactly once for the insertion. Returns whether a
    /// session now exists (it may have existed already).
    fn ensure_session(&self, port_id: &str, family: Family) {
        let mut created = None;
        {
            let mut sessions = self.sessions.lock();
            if !sessions.contains_key(port_id) {
                let session = Session::new(port_id.to_string(), family, self.sink.clone());
                created = Some(session.snapshot());
                sessions.insert(port_id.to_string(), session);
            }
        }
        if let Some(info) = created {
            self.sink.on_attach(&info);
        }
    }

    /// Advances the named session's step, removing and emitting `detach`
    /// if that reaches the terminal step.
    fn advance_step(&self, port_id: &str, step: u32) {
        let mut sessions = self.sessions.lock();
        let Some(session) = sessions.get_mut(port_id) else {
            return;
        };
        session.set_step(step);
        if session.is_terminal() {
            let info = session.snapshot();
            sessions.remove(port_id);
            drop(sessions);
            self.sink.on_detach(&info);
        }
    }

    /// Removes the named session outright (a fatal protocol error, or an
    /// assumed-unplugged timer firing), emitting `detach`.
    fn fail_session(&self, port_id: &str, message: &str) {
        self.sink.on_error(message);
        let removed = self.sessions.lock().remove(port_id);
        if let Some(session) = removed {
            self.sink.on_detach(&session.snapshot());
        }
    }
}

/// Subscribes to USB attach/detach notification and drives the boot
/// protocol for every Pi in boot-ROM state it observes.
pub struct Scanner {
    shared: Arc<SharedState>,
    context: Context,
    running: Arc<AtomicBool>,
    registration: Mutex<Option<Registration<Context>>>,
    event_thread: Mutex<Option<JoinHandle<()>>>,
    poll_thread: Mutex<Option<JoinHandle<()>>>,
}

impl Scanner {
    pub fn new(
        config: Config,
        blobs: Arc<dyn BlobProvider>,
        sink: Arc<dyn EventSink>,
    ) -> Result<Self, ProtocolError> {
        let context = Context::new()?;
        let shared = Arc::new(SharedState {
            sessions: Mutex::new(HashMap::new()),
            seen_ids: Mutex::new(HashSet::new()),
            sink,
            blobs,
            config,
        });
        Ok(Self {
            shared,
            context,
            running: Arc::new(AtomicBool::new(false)),
            registration: Mutex::new(None),
            event_thread: Mutex::new(None),
            poll_thread: Mutex::new(None),
        })
    }

    /// Performs the initial classification sweep, emits `ready`, then
    /// subscribes to live attach/detach notification. Any session created
    /// during the sweep is guaranteed to have been announced before `ready`
    /// fires.
    pub fn start(&self) -> Result<(), ProtocolError> {
        self.running.store(true, Ordering::SeqCst);

        for device in self.context.devices()?.iter() {
            handle_attach(&self.shared, device);
        }
        self.shared.sink.on_ready();

        if rusb::has_hotplug() {
            self.start_hotplug()?;
        } else {
            warn!("host libusb build lacks hotplug support; falling back to polling");
            self.start_polling();
        }

        Ok(())
    }

    fn start_hotplug(&self) -> Result<(), ProtocolError> {
        let handler = Box::new(HotplugHandler {
            shared: self.shared.clone(),
        });
        let registration = HotplugBuilder::new()
            .enumerate(false)
            .register(self.context.clone(), handler)?;
        *self.registration.lock() = Some(registration);

        let context = self.context.clone();
        let running = self.running.clone();
        let handle = std::thread::spawn(move || {
            while running.load(Ordering::SeqCst) {
                let _ = context.handle_events(Some(HOTPLUG_EVENT_TIMEOUT));
            }
        });
        *self.event_thread.lock() = Some(handle);
        Ok(())
    }

    fn start_polling(&self) {
        let shared = self.shared.clone();
        let context = self.context.clone();
        let running = self.running.clone();
        let handle = std::thread::spawn(move || poll_loop(shared, context, running));
        *self.poll_thread.lock() = Some(handle);
    }

    /// Unsubscribes from attach/detach, cancels the polling fallback if it
    /// was running, and clears the session table. No `detach` events are
    /// emitted here -- callers must treat `stop` as a hard quiesce, not a
    /// graceful wind-down.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        *self.registration.lock() = None;

        if let Some(handle) = self.event_thread.lock().take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.poll_thread.lock().take() {
            let _ = handle.join();
        }

        self.shared.sessions.lock().clear();
        self.shared.seen_ids.lock().clear();
    }
}

struct HotplugHandler {
    shared: Arc<SharedState>,
}

impl Hotplug<Context> for HotplugHandler {
    fn device_arrived(&mut self, device: Device<Context>) {
        handle_attach(&self.shared, device);
    }

    fn device_left(&mut self, device: Device<Context>) {
        if let Some(snapshot) = snapshot_device(&device) {
            handle_detach(&self.shared, &snapshot);
        }
    }
}

/// Attach path, shared by the initial sweep and live hotplug/poll events.
///
/// Dedups on `device_id`, classifies, and for a boot-capable device spawns
/// a dedicated worker thread to run the protocol so one device's blocking
/// USB I/O can never stall another's.
fn handle_attach(shared: &Arc<SharedState>, device: Device<Context>) {
    let Some(snapshot) = snapshot_device(&device) else {
        return;
    };

    {
        let mut seen = shared.seen_ids.lock();
        if seen.contains(&snapshot.device_id) {
            return;
        }
        seen.insert(snapshot.device_id.clone());
    }

    match snapshot.classification {
        Classification::MassStorageOfInterest => {
            let last_step = shared.sessions.lock().get(&snapshot.port_id).map(Session::last_step);
            if let Some(last_step) = last_step {
                debug!("{} re-enumerated as mass storage, session complete", snapshot.port_id);
                shared.advance_step(&snapshot.port_id, last_step);
            }
        }
        Classification::Unrelated => {}
        Classification::BootCapable(family) => {
            shared.ensure_session(&snapshot.port_id, family);

            let shared = shared.clone();
            let port_id = snapshot.port_id.clone();
            let serial_index = snapshot.serial_index;
            std::thread::spawn(move || run_protocol(shared, device, port_id, family, serial_index));
        }
    }
}

/// Detach path: arms the 5s "assumed unplugged" timer unless the device
/// reappears with its step advanced in the meantime.
fn handle_detach(shared: &Arc<SharedState>, snapshot: &DeviceSnapshot) {
    shared.seen_ids.lock().remove(&snapshot.device_id);

    let family = match snapshot.classification {
        Classification::BootCapable(family) => family,
        _ => return,
    };

    shared.ensure_session(&snapshot.port_id, family);

    let armed_step = if snapshot.serial_index == 0 {
        1
    } else {
        family.last_step().saturating_sub(1)
    };

    {
        let mut sessions = shared.sessions.lock();
        if let Some(session) = sessions.get_mut(&snapshot.port_id) {
            session.set_step(armed_step);
        }
    }

    let shared = shared.clone();
    let port_id = snapshot.port_id.clone();
    let grace = shared.config.detach_grace;
    std::thread::spawn(move || {
        std::thread::sleep(grace);
        let still_armed = shared
            .sessions
            .lock()
            .get(&port_id)
            .map(|s| s.step() == armed_step)
            .unwrap_or(false);
        if still_armed {
            info!("{port_id} did not come back within the detach grace period, removing session");
            let removed = shared.sessions.lock().remove(&port_id);
            if let Some(session) = removed {
                shared.sink.on_detach(&session.snapshot());
            }
        }
    });
}

/// Runs the protocol for one physical device on its own thread: opens the
/// transport, dispatches stage-1 or the file-server loop by serial index,
/// and tears the session down on any error.
fn run_protocol(
    shared: Arc<SharedState>,
    device: Device<Context>,
    port_id: String,
    family: Family,
    serial_index: u8,
) {
    let transport = match UsbTransport::open(device, &shared.config) {
        Ok(t) => t,
        Err(e) => {
            shared.fail_session(&port_id, &format!("opening transport: {e}"));
            return;
        }
    };

    let result = if serial_index == 0 || serial_index == 3 {
        debug!("{port_id} in stage-1, uploading bootcode");
        second_stage_boot(&transport, family, shared.blobs.as_ref())
    } else {
        debug!("{port_id} in file-server phase");
        let backoff = shared.config.file_server_backoff;
        let post_settle = shared.config.post_server_settle;
        let shared = shared.clone();
        let port_id = port_id.clone();
        file_server(
            &transport,
            family,
            shared.blobs.as_ref(),
            2,
            backoff,
            post_settle,
            move |step| {
                shared.advance_step(&port_id, step);
            },
        )
    };

    if let Err(e) = result {
        shared.fail_session(&port_id, &e.to_string());
    }
}

/// Polling fallback for hosts whose libusb build lacks native hotplug
/// support: diffs the enumerated device list on a fixed interval.
fn poll_loop(shared: Arc<SharedState>, context: Context, running: Arc<AtomicBool>) {
    let mut last_seen: HashMap<String, DeviceSnapshot> = HashMap::new();

    while running.load(Ordering::SeqCst) {
        let mut current_ids = HashSet::new();

        if let Ok(devices) = context.devices() {
            for device in devices.iter() {
                let Some(snapshot) = snapshot_device(&device) else {
                    continue;
                };
                current_ids.insert(snapshot.device_id.clone());
                let is_new = !last_seen.contains_key(&snapshot.device_id);
                last_seen.insert(snapshot.device_id.clone(), snapshot);
                if is_new {
                    handle_attach(&shared, device);
                }
            }
        }

        let vanished: Vec<String> = last_seen
            .keys()
            .filter(|id| !current_ids.contains(*id))
            .cloned()
            .collect();
        for id in vanished {
            if let Some(snapshot) = last_seen.remove(&id) {
                handle_detach(&shared, &snapshot);
            }
        }

        std::thread::sleep(POLL_INTERVAL);
    }
}
