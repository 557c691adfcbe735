//! Device driver harness.
//!
//! A [`Device`] owns one attached product: its framer, persisted profiles,
//! background loops and color routing. Every user-facing setter returns a
//! [`Status`]; once the device is stopped they all return
//! [`Status::Failure`].

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cluster::{Cluster, ClusterController, ClusterWriteFn};
use crate::color::Rgb;
use crate::comm;
use crate::config::Config;
use crate::device::{DeviceDescriptor, Link, ProductKind};
use crate::effect::{EffectKind, EffectState};
use crate::error::{Error, Result, Status};
use crate::framer::{Framer, RESPONSE_DATA_OFFSET};
use crate::input::{self, InputEvent};
use crate::keyassign::{self, Action, KeyAssigner, KeyAssignment};
use crate::macros::{InputSynth, MacroLibrary};
use crate::openrgb::{self, ExternalController, ExternalTarget};
use crate::profile::{DeviceProfile, ProfileSet};
use crate::rgb::{RgbLibrary, RgbProfile, RgbSource};
use crate::safety;
use crate::sink::{self, ClusterGate, ClusterSink, ColorSink, ColorSource, ExternalSink, HidSink};
use crate::speed::{SpeedController, SpeedLibrary, SPEED_TICK};
use crate::store::ProfileStore;
use crate::task::{self, Shutdown, TaskSet};
use crate::telemetry::{self, DeviceStats, TELEMETRY_TICK};
use crate::temperature::{TempSource, TemperatureCache};
use crate::transport::HidTransport;

/// Cadence of the wireless keep-alive.
pub const KEEP_ALIVE_TICK: Duration = Duration::from_secs(20);

/// How often a static zone frame is rewritten.
const FIXED_FRAME_INTERVAL: Duration = Duration::from_secs(1);

/// Process-wide services a device works against.
#[derive(Clone)]
pub struct Services {
    pub config: Arc<Config>,
    pub store: Arc<dyn ProfileStore>,
    pub temperatures: Arc<TemperatureCache>,
    pub synth: Arc<dyn InputSynth>,
    pub cluster: Arc<Cluster>,
    pub external: Arc<ExternalTarget>,
    pub speed_profiles: Arc<RwLock<SpeedLibrary>>,
    pub macros: Arc<RwLock<MacroLibrary>>,
}

/// Mutable per-device state, guarded by one lock.
struct DeviceState {
    profiles: ProfileSet,
    keys: KeyAssigner,
    source: ColorSource,
    sniper: bool,
}

/// What this instance registered with the shared color sources. A newer
/// instance under the same serial replaces these entries, so removal goes
/// by identity.
#[derive(Default)]
struct Registrations {
    external: Option<Arc<ExternalController>>,
    cluster: Option<ClusterWriteFn>,
}

/// A running color loop and the switch that stops it.
struct RenderTask {
    shutdown: Shutdown,
    handle: JoinHandle<()>,
}

enum FrameSource {
    Effect(EffectState),
    Fixed(Vec<u8>),
}

impl FrameSource {
    fn interval(&self) -> Duration {
        match self {
            Self::Effect(e) => e.kind().frame_interval(),
            Self::Fixed(_) => FIXED_FRAME_INTERVAL,
        }
    }
}

/// Exported view of a device.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceSnapshot {
    pub product: String,
    pub serial: String,
    pub firmware: String,
    pub kind: String,
    pub active_profile: String,
    pub profiles: Vec<String>,
    pub rgb_profile: String,
    pub source: String,
    pub stats: DeviceStats,
}

pub struct Device {
    descriptor: &'static DeviceDescriptor,
    serial: String,
    product: String,
    firmware: String,
    framer: Arc<Framer>,
    services: Services,
    state: Mutex<DeviceState>,
    rgb: Mutex<RgbLibrary>,
    stats: Mutex<DeviceStats>,
    speed: Mutex<SpeedController>,
    shutdown: Shutdown,
    tasks: TaskSet,
    render: tokio::sync::Mutex<Option<RenderTask>>,
    registrations: Mutex<Registrations>,
    input_exit: Arc<AtomicBool>,
    stopped: AtomicBool,
    runtime: Handle,
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("product", &self.product)
            .field("serial", &self.serial)
            .field("firmware", &self.firmware)
            .finish_non_exhaustive()
    }
}

/// `major.minor.patch` from a firmware reply.
fn parse_firmware(resp: &[u8]) -> Option<String> {
    let d = resp.get(RESPONSE_DATA_OFFSET..RESPONSE_DATA_OFFSET + 4)?;
    Some(format!("{}.{}.{}", d[0], d[1], u16::from_le_bytes([d[2], d[3]])))
}

/// Static frame built from the profile's zone colors.
fn zone_frame(profile: &DeviceProfile, leds: usize) -> Vec<u8> {
    let brightness = profile.brightness();
    let mut frame = vec![0u8; leds * 3];
    for zone in profile.zone_colors.values() {
        let c = zone.color.scale(brightness);
        let color = [c.red, c.green, c.blue];
        for pos in zone.packet_index.iter().filter(|p| **p < leds) {
            frame[pos * 3..pos * 3 + 3].copy_from_slice(&color);
        }
    }
    frame
}

fn wanted_source(profile: &DeviceProfile) -> ColorSource {
    if profile.openrgb_integration {
        ColorSource::External
    } else if profile.rgb_cluster {
        ColorSource::Cluster
    } else {
        ColorSource::Local
    }
}

impl Device {
    /// Bring a device up.
    ///
    /// Reads the firmware version, loads or creates its profiles, switches
    /// it to software mode, pushes the stored mouse settings and starts the
    /// background loops. `input` is the button interface of products that
    /// have one.
    pub async fn init(
        descriptor: &'static DeviceDescriptor,
        transport: Box<dyn HidTransport>,
        input: Option<Box<dyn HidTransport>>,
        serial_hint: Option<&str>,
        services: Services,
    ) -> Result<Arc<Self>> {
        let framer = Arc::new(Framer::new(transport, descriptor));
        let info = framer.info();
        let serial = serial_hint
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .unwrap_or(info.serial);
        if serial.is_empty() {
            return Err(Error::DeviceNotFound(format!("{} without a serial number", descriptor.name)));
        }
        let product = if info.product.is_empty() {
            descriptor.name.to_string()
        } else {
            info.product
        };

        let handshake = {
            let framer = Arc::clone(&framer);
            tokio::task::spawn_blocking(move || -> Result<String> {
                if descriptor.kind == ProductKind::Psu {
                    return Ok(String::from("n/a"));
                }
                let cmd = framer.commands();
                let firmware = parse_firmware(&framer.transfer(cmd.get_firmware, &[]))
                    .ok_or_else(|| Error::Timeout("firmware query".into()))?;
                framer.transfer(cmd.software_mode, &[]);
                Ok(firmware)
            })
        };
        let firmware = handshake.await.map_err(|e| Error::Protocol(e.to_string()))??;

        let store = Arc::clone(&services.store);
        let profiles = ProfileSet::load(&*store, descriptor, &serial)?;
        let rgb = RgbLibrary::load(&*store, &serial, descriptor.name)?;
        let hash = profiles.active().key_assignment_hash.clone();
        let keys = KeyAssigner::new(
            descriptor.buttons,
            keyassign::load_assignments(&*store, &hash, descriptor.buttons)?,
        );

        let device = Arc::new(Self {
            descriptor,
            serial,
            product,
            firmware,
            framer,
            services,
            state: Mutex::new(DeviceState {
                profiles,
                keys,
                source: ColorSource::Local,
                sniper: false,
            }),
            rgb: Mutex::new(rgb),
            stats: Mutex::new(DeviceStats::default()),
            speed: Mutex::new(SpeedController::new(descriptor)),
            shutdown: Shutdown::new(),
            tasks: TaskSet::new(),
            render: tokio::sync::Mutex::new(None),
            registrations: Mutex::new(Registrations::default()),
            input_exit: Arc::new(AtomicBool::new(false)),
            stopped: AtomicBool::new(false),
            runtime: Handle::current(),
        });

        device.blocking(|d| d.apply_settings()).await;
        device.start_loops(input);
        device.refresh_lighting().await;
        info!(
            product = %device.product,
            serial = %device.serial,
            firmware = %device.firmware,
            "device initialized"
        );
        Ok(device)
    }

    pub fn descriptor(&self) -> &'static DeviceDescriptor {
        self.descriptor
    }

    pub fn serial(&self) -> &str {
        &self.serial
    }

    pub fn product(&self) -> &str {
        &self.product
    }

    pub fn firmware(&self) -> &str {
        &self.firmware
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    pub fn color_source(&self) -> ColorSource {
        self.state.lock().source
    }

    pub fn active_profile(&self) -> DeviceProfile {
        self.state.lock().profiles.active().clone()
    }

    pub fn active_profile_name(&self) -> String {
        self.state.lock().profiles.active_name().to_string()
    }

    pub fn profile_names(&self) -> Vec<String> {
        self.state.lock().profiles.names()
    }

    pub fn key_assignments(&self) -> keyassign::KeyAssignments {
        self.state.lock().keys.entries().clone()
    }

    /// Latest telemetry.
    pub fn stats(&self) -> Result<DeviceStats> {
        if self.is_stopped() {
            return Err(Error::Closed);
        }
        Ok(self.stats.lock().clone())
    }

    pub fn snapshot(&self) -> DeviceSnapshot {
        let state = self.state.lock();
        DeviceSnapshot {
            product: self.product.clone(),
            serial: self.serial.clone(),
            firmware: self.firmware.clone(),
            kind: format!("{:?}", self.descriptor.kind),
            active_profile: state.profiles.active_name().to_string(),
            profiles: state.profiles.names(),
            rgb_profile: state.profiles.active().rgb_profile.clone(),
            source: format!("{:?}", state.source),
            stats: self.stats.lock().clone(),
        }
    }

    /// Run `f` on a blocking worker. `None` if the worker panicked.
    async fn blocking<T, F>(self: &Arc<Self>, f: F) -> Option<T>
    where
        T: Send + 'static,
        F: FnOnce(&Device) -> T + Send + 'static,
    {
        let device = Arc::clone(self);
        match tokio::task::spawn_blocking(move || f(&*device)).await {
            Ok(v) => Some(v),
            Err(e) => {
                warn!(serial = %self.serial, error = %e, "blocking device call failed");
                None
            }
        }
    }

    // ---- hardware settings ----

    fn write_setting(&self, endpoint: &[u8], payload: &[u8], setting: &'static str) -> bool {
        if self.is_stopped() {
            return false;
        }
        let resp = self.framer.write_command(endpoint, payload, 0);
        match comm::ack_status(&resp) {
            Some(status) if status != 0 => {
                warn!(serial = %self.serial, setting, status, "device rejected setting");
                false
            }
            _ => {
                debug!(serial = %self.serial, setting, payload_hex = format_args!("{:02X?}", payload), "setting written");
                true
            }
        }
    }

    /// DPI of the current stage, or the sniper stage while sniper is held.
    fn write_dpi(&self) -> bool {
        let Some(range) = self.descriptor.dpi else {
            return false;
        };
        let value = {
            let state = self.state.lock();
            let profile = state.profiles.active();
            let stage = if state.sniper {
                profile.sniper_stage()
            } else {
                profile.current_stage()
            };
            match stage {
                Some(s) => s.value,
                None => return false,
            }
        };
        let value = safety::clamp_dpi(&range, value).to_le_bytes();
        let payload = [value[0], value[1], value[0], value[1]];
        self.write_setting(self.framer.commands().endpoints.dpi, &payload, "dpi")
    }

    /// Push every stored mouse setting to the device.
    fn apply_settings(&self) {
        let profile = self.active_profile();
        let desc = self.descriptor;
        let endpoints = self.framer.commands().endpoints;
        if let Ok(rate) = safety::validate_polling_rate(desc, profile.polling_rate) {
            self.write_setting(endpoints.polling_rate, &[rate.code()], "polling rate");
        }
        if desc.angle_snapping {
            self.write_setting(
                endpoints.angle_snapping,
                &[u8::from(profile.angle_snapping)],
                "angle snapping",
            );
        }
        if desc.lift_height {
            self.write_setting(endpoints.lift_height, &[profile.lift_height], "lift height");
        }
        if desc.sleep_mode {
            self.write_setting(endpoints.sleep_mode, &[profile.sleep_mode], "sleep mode");
        }
        self.write_dpi();
    }

    // ---- color routing ----

    fn read_temperature(&self, source: &TempSource) -> f32 {
        match source {
            TempSource::Liquid => self.stats.lock().probe(0).unwrap_or_default(),
            TempSource::Probe(i) => self.stats.lock().probe(*i as usize).unwrap_or_default(),
            other => self.services.temperatures.get(other),
        }
    }

    fn frame_source(&self) -> FrameSource {
        let state = self.state.lock();
        let profile = state.profiles.active();
        let leds = self.descriptor.led_channels;
        let kind = match RgbSource::resolve(&profile.rgb_profile) {
            Some(RgbSource::Zones) => return FrameSource::Fixed(zone_frame(profile, leds)),
            Some(RgbSource::Effect(kind)) => kind,
            None => {
                warn!(serial = %self.serial, rgb_profile = %profile.rgb_profile, "unknown RGB profile, lights off");
                EffectKind::Off
            }
        };
        if let Some(src) = kind.temperature_source() {
            self.services.temperatures.watch(src);
        }
        let config = self.rgb.lock().profile(kind).effect_config(profile.brightness());
        FrameSource::Effect(EffectState::new(kind, config, leds))
    }

    async fn render_loop(self: Arc<Self>, mut source: FrameSource, mut cancel: watch::Receiver<bool>) {
        let started = Instant::now();
        let interval = source.interval();
        let sink: Arc<dyn ColorSink> = Arc::new(HidSink::new(Arc::clone(&self.framer)));
        loop {
            if *cancel.borrow() || self.framer.is_exiting() {
                break;
            }
            let frame = match &mut source {
                FrameSource::Effect(effect) => {
                    let temperature = effect
                        .kind()
                        .temperature_source()
                        .map(|s| f64::from(self.read_temperature(&s)));
                    effect.render_bytes(started.elapsed().as_secs_f64(), temperature)
                }
                FrameSource::Fixed(frame) => frame.clone(),
            };
            let sink = Arc::clone(&sink);
            if tokio::task::spawn_blocking(move || sink.write(&frame, 0)).await.is_err() {
                break;
            }
            if !task::sleep_or_cancel(interval, &mut cancel).await {
                break;
            }
        }
        debug!(serial = %self.serial, "render loop stopped");
    }

    fn spawn_render(self: &Arc<Self>) -> RenderTask {
        let shutdown = Shutdown::new();
        let source = self.frame_source();
        let handle = tokio::spawn(Arc::clone(self).render_loop(source, shutdown.subscribe()));
        RenderTask { shutdown, handle }
    }

    fn spawn_external(self: &Arc<Self>) -> RenderTask {
        let (sink, rx) = ExternalSink::channel();
        let controller = Arc::new(ExternalController::new(
            self.descriptor.kind.into(),
            &self.product,
            &self.serial,
            &self.firmware,
            openrgb::zones_for(self.descriptor),
            Arc::new(sink),
        ));
        self.services.external.register(Arc::clone(&controller));
        self.registrations.lock().external = Some(controller);
        let shutdown = Shutdown::new();
        let target: Arc<dyn ColorSink> = Arc::new(HidSink::new(Arc::clone(&self.framer)));
        let handle = tokio::spawn(sink::drain_external(rx, target, shutdown.subscribe()));
        RenderTask { shutdown, handle }
    }

    fn register_cluster(self: &Arc<Self>) {
        let weak: Weak<Self> = Arc::downgrade(self);
        let gate: ClusterGate = Arc::new(move || {
            let device = weak.upgrade().filter(|d| !d.is_stopped())?;
            let state = device.state.lock();
            let profile = state.profiles.active();
            let brightness = profile.rgb_cluster.then(|| profile.brightness());
            brightness
        });
        let sink = ClusterSink::new(Arc::clone(&self.framer), gate);
        let write: ClusterWriteFn = Arc::new(move |buffer, channel| sink.write(buffer, channel));
        self.services.cluster.register(ClusterController {
            product: self.product.clone(),
            serial: self.serial.clone(),
            led_channels: self.descriptor.led_channels,
            write: Arc::clone(&write),
        });
        self.registrations.lock().cluster = Some(write);
    }

    fn leave_source(&self, source: ColorSource) {
        match source {
            ColorSource::External => {
                if let Some(controller) = self.registrations.lock().external.take() {
                    self.services.external.unregister_controller(&controller);
                }
            }
            ColorSource::Cluster => {
                if let Some(write) = self.registrations.lock().cluster.take() {
                    self.services.cluster.unregister_write(&self.serial, &write);
                }
            }
            ColorSource::Local => {}
        }
    }

    /// Stop the current color loop and start the one the active profile
    /// asks for. The old loop has finished its last write before the new
    /// one starts.
    pub async fn refresh_lighting(self: &Arc<Self>) {
        if self.descriptor.led_channels == 0 {
            return;
        }
        let mut slot = self.render.lock().await;
        if let Some(old) = slot.take() {
            old.shutdown.trigger();
            if let Err(e) = old.handle.await {
                warn!(serial = %self.serial, error = %e, "render loop ended abnormally");
            }
        }
        if self.is_stopped() {
            return;
        }
        let (source, previous) = {
            let mut state = self.state.lock();
            let wanted = wanted_source(state.profiles.active());
            (wanted, std::mem::replace(&mut state.source, wanted))
        };
        if previous != source {
            self.leave_source(previous);
            info!(serial = %self.serial, from = ?previous, to = ?source, "color source changed");
        }
        *slot = match source {
            ColorSource::Local => Some(self.spawn_render()),
            ColorSource::External => Some(self.spawn_external()),
            ColorSource::Cluster => {
                self.register_cluster();
                None
            }
        };
    }

    // ---- background loops ----

    fn speed_tick(&self) {
        let assignments: BTreeMap<u8, String> = self.state.lock().profiles.active().speed_profiles.clone();
        let library = self.services.speed_profiles.read().clone();
        let graph = self.services.config.graph_profiles;
        let written = self.speed.lock().tick(
            &self.framer,
            &assignments,
            &library,
            &|source: &TempSource| {
                self.services.temperatures.watch(source.clone());
                self.read_temperature(source)
            },
            graph,
        );
        let mut stats = self.stats.lock();
        for (channel, duty) in written {
            stats.set_duty(channel, duty);
        }
    }

    /// Spawn a loop running `step` on a blocking worker every `period`.
    fn spawn_periodic(self: &Arc<Self>, name: &'static str, period: Duration, step: fn(&Device)) {
        let device = Arc::clone(self);
        let mut cancel = self.shutdown.subscribe();
        self.tasks.spawn(name, async move {
            while task::sleep_or_cancel(period, &mut cancel).await {
                if device.blocking(step).await.is_none() {
                    break;
                }
            }
            debug!(serial = %device.serial, task = name, "loop stopped");
        });
    }

    fn start_loops(self: &Arc<Self>, input: Option<Box<dyn HidTransport>>) {
        let desc = self.descriptor;
        if matches!(desc.kind, ProductKind::FanHub | ProductKind::Psu) || desc.wireless {
            self.spawn_periodic("telemetry", TELEMETRY_TICK, |d| {
                telemetry::poll(&d.framer, d.descriptor, &d.stats)
            });
        }
        if desc.kind == ProductKind::FanHub && desc.fan_channels > 0 {
            if self.services.config.manual {
                info!(serial = %self.serial, "manual mode, speed controller disabled");
            } else {
                self.spawn_periodic("speed", SPEED_TICK, Device::speed_tick);
            }
        }
        if desc.wireless {
            self.spawn_periodic("keep-alive", KEEP_ALIVE_TICK, |d| {
                d.framer.transfer(d.framer.commands().endpoints.keep_alive, &[]);
            });
        }
        if let (Some(transport), Some(layout)) = (input, desc.input) {
            let device = Arc::clone(self);
            let exit = Arc::clone(&self.input_exit);
            self.tasks.spawn("input", async move {
                let result = tokio::task::spawn_blocking(move || {
                    input::run(&*transport, &layout, &exit, |event| device.on_input(event));
                })
                .await;
                if let Err(e) = result {
                    warn!(error = %e, "input dispatcher ended abnormally");
                }
            });
        }
    }

    // ---- input ----

    /// Handle one decoded input event. Runs on the input thread.
    pub fn on_input(self: &Arc<Self>, event: InputEvent) {
        match event {
            InputEvent::Battery(level) => self.stats.lock().battery = Some(level),
            InputEvent::Buttons(mask) => {
                let actions = {
                    let macros = self.services.macros.read();
                    self.state.lock().keys.handle(mask, &macros)
                };
                for action in actions {
                    self.execute(action);
                }
            }
        }
    }

    fn execute(self: &Arc<Self>, action: Action) {
        let synth = &self.services.synth;
        match action {
            Action::Key { code, press } => synth.send_key(code, press),
            Action::Button { code, press } => synth.send_button(code, press),
            Action::Text(text) => synth.send_text(&text),
            Action::Delay(d) => std::thread::sleep(d),
            Action::DpiUp => self.step_dpi(1),
            Action::DpiDown => self.step_dpi(-1),
            Action::SniperOn => self.set_sniper(true),
            Action::SniperOff => self.set_sniper(false),
            Action::RotateProfile => {
                let name = self.rotate_profile_state();
                info!(serial = %self.serial, profile = %name, "profile rotated from device");
                let device = Arc::clone(self);
                self.runtime.spawn(async move { device.apply_active_profile().await });
            }
        }
    }

    fn step_dpi(&self, delta: i32) {
        let changed = {
            let mut state = self.state.lock();
            let changed = state.profiles.active_mut().step_dpi(delta);
            if changed {
                if let Err(e) = state.profiles.save_active(&*self.services.store) {
                    warn!(serial = %self.serial, error = %e, "failed to save DPI stage");
                }
            }
            changed
        };
        if changed {
            self.write_dpi();
        }
    }

    fn set_sniper(self: &Arc<Self>, on: bool) {
        let changed = std::mem::replace(&mut self.state.lock().sniper, on) != on;
        if changed {
            debug!(serial = %self.serial, on, "sniper");
            self.write_dpi();
            self.spawn_refresh();
        }
    }

    fn spawn_refresh(self: &Arc<Self>) {
        let device = Arc::clone(self);
        self.runtime.spawn(async move { device.refresh_lighting().await });
    }

    // ---- user profiles ----

    /// Reload what depends on the active profile's key-assignment hash.
    fn reload_keys(&self, state: &mut DeviceState) {
        let hash = state.profiles.active().key_assignment_hash.clone();
        match keyassign::load_assignments(&*self.services.store, &hash, self.descriptor.buttons) {
            Ok(entries) => state.keys = KeyAssigner::new(self.descriptor.buttons, entries),
            Err(e) => warn!(serial = %self.serial, error = %e, "failed to load key assignments"),
        }
    }

    fn rotate_profile_state(&self) -> String {
        let mut state = self.state.lock();
        let name = state.profiles.rotate(&*self.services.store);
        self.reload_keys(&mut state);
        name
    }

    /// Re-apply everything the active profile controls.
    async fn apply_active_profile(self: &Arc<Self>) {
        if self.is_stopped() {
            return;
        }
        self.speed.lock().reset();
        self.blocking(|d| d.apply_settings()).await;
        self.refresh_lighting().await;
    }

    pub fn new_user_profile(&self, name: &str) -> Status {
        if self.is_stopped() {
            return Status::Failure;
        }
        self.state.lock().profiles.create(&*self.services.store, name)
    }

    pub fn delete_user_profile(&self, name: &str) -> Status {
        if self.is_stopped() {
            return Status::Failure;
        }
        self.state.lock().profiles.delete(&*self.services.store, name)
    }

    pub async fn switch_user_profile(self: &Arc<Self>, name: &str) -> Status {
        if self.is_stopped() {
            return Status::Failure;
        }
        let status = {
            let mut state = self.state.lock();
            let status = state.profiles.switch(&*self.services.store, name);
            if status.is_ok() {
                self.reload_keys(&mut state);
            }
            status
        };
        if status.is_ok() {
            self.apply_active_profile().await;
        }
        status
    }

    /// Switch to the next profile in name order.
    pub async fn rotate_user_profile(self: &Arc<Self>) -> Status {
        if self.is_stopped() {
            return Status::Failure;
        }
        self.rotate_profile_state();
        self.apply_active_profile().await;
        Status::Ok
    }

    // ---- setters ----

    /// Mutate the active profile and persist it when `f` succeeds.
    fn update_profile(&self, f: impl FnOnce(&mut DeviceProfile) -> Status) -> Status {
        if self.is_stopped() {
            return Status::Failure;
        }
        let mut state = self.state.lock();
        let status = f(state.profiles.active_mut());
        if status.is_ok() {
            if let Err(e) = state.profiles.save_active(&*self.services.store) {
                warn!(serial = %self.serial, error = %e, "failed to save profile");
                return Status::Failure;
            }
        }
        status
    }

    pub async fn set_brightness(self: &Arc<Self>, value: i64) -> Status {
        let Ok(value) = safety::validate_brightness(value) else {
            return Status::Failure;
        };
        let status = self.update_profile(|p| {
            p.brightness_slider = value;
            Status::Ok
        });
        if status.is_ok() {
            self.refresh_lighting().await;
        }
        status
    }

    /// Select an effect by name, or the zone colors.
    pub async fn set_rgb_profile(self: &Arc<Self>, name: &str) -> Status {
        if self.descriptor.led_channels == 0 || RgbSource::resolve(name).is_none() {
            return Status::Failure;
        }
        let status = self.update_profile(|p| {
            p.rgb_profile = name.to_string();
            Status::Ok
        });
        if status.is_ok() {
            self.refresh_lighting().await;
        }
        status
    }

    /// Replace the parameters of one effect in the device's RGB library.
    pub async fn update_rgb_profile(self: &Arc<Self>, kind: EffectKind, profile: RgbProfile) -> Status {
        if self.is_stopped() {
            return Status::Failure;
        }
        {
            let mut rgb = self.rgb.lock();
            rgb.profiles.insert(kind.name().to_string(), profile);
            if let Err(e) = rgb.save(&*self.services.store, &self.serial) {
                warn!(serial = %self.serial, error = %e, "failed to save RGB library");
                return Status::Failure;
            }
        }
        self.refresh_lighting().await;
        Status::Ok
    }

    pub async fn set_zone_color(self: &Arc<Self>, zone: u8, color: Rgb) -> Status {
        let Some(def) = self.descriptor.zone(zone) else {
            return Status::Failure;
        };
        let status = self.update_profile(|p| {
            let entry = p.zone_colors.entry(zone).or_insert_with(|| crate::profile::ZoneColor {
                color,
                packet_index: def.positions.to_vec(),
            });
            entry.color = color;
            Status::Ok
        });
        if status.is_ok() {
            self.refresh_lighting().await;
        }
        status
    }

    /// Assign a speed profile to a fan channel. Liquid-sensed profiles
    /// need a pump on the device.
    pub fn set_speed_profile(&self, channel: u8, name: &str) -> Status {
        if safety::validate_channel(self.descriptor, channel).is_err() {
            return Status::Failure;
        }
        let sensor = match self.services.speed_profiles.read().get(name) {
            Some(profile) => profile.sensor.clone(),
            None => return Status::Failure,
        };
        if sensor == TempSource::Liquid && self.descriptor.pump_channels.is_empty() {
            return Status::PumpRequired;
        }
        let status = self.update_profile(|p| {
            p.speed_profiles.insert(channel, name.to_string());
            Status::Ok
        });
        if status.is_ok() {
            self.speed.lock().reset();
        }
        status
    }

    pub async fn set_dpi_stage(self: &Arc<Self>, index: usize) -> Status {
        if self.descriptor.dpi.is_none() {
            return Status::Failure;
        }
        let status = self.update_profile(|p| match p.dpi_profiles.get(index) {
            Some(stage) if !stage.sniper => {
                p.dpi_stage = index;
                Status::Ok
            }
            _ => Status::MissingDpiStage,
        });
        if status.is_ok() {
            self.blocking(|d| d.write_dpi()).await;
        }
        status
    }

    pub async fn set_polling_rate(self: &Arc<Self>, hz: u16) -> Status {
        let Ok(rate) = safety::validate_polling_rate(self.descriptor, hz) else {
            return Status::Failure;
        };
        let status = self.update_profile(|p| {
            p.polling_rate = rate.as_hz();
            Status::Ok
        });
        if status.is_ok() {
            self.blocking(move |d| {
                d.write_setting(d.framer.commands().endpoints.polling_rate, &[rate.code()], "polling rate")
            })
            .await;
        }
        status
    }

    pub async fn set_lift_height(self: &Arc<Self>, value: i64) -> Status {
        if !self.descriptor.lift_height {
            return Status::Failure;
        }
        let Ok(value) = safety::validate_lift_height(value) else {
            return Status::Failure;
        };
        let status = self.update_profile(|p| {
            p.lift_height = value;
            Status::Ok
        });
        if status.is_ok() {
            self.blocking(move |d| {
                d.write_setting(d.framer.commands().endpoints.lift_height, &[value], "lift height")
            })
            .await;
        }
        status
    }

    pub async fn set_angle_snapping(self: &Arc<Self>, enabled: bool) -> Status {
        if !self.descriptor.angle_snapping {
            return Status::Failure;
        }
        let status = self.update_profile(|p| {
            p.angle_snapping = enabled;
            Status::Ok
        });
        if status.is_ok() {
            self.blocking(move |d| {
                d.write_setting(
                    d.framer.commands().endpoints.angle_snapping,
                    &[u8::from(enabled)],
                    "angle snapping",
                )
            })
            .await;
        }
        status
    }

    pub async fn set_sleep_mode(self: &Arc<Self>, minutes: i64) -> Status {
        if !self.descriptor.sleep_mode {
            return Status::Failure;
        }
        let Ok(minutes) = safety::validate_sleep_minutes(minutes) else {
            return Status::Failure;
        };
        let status = self.update_profile(|p| {
            p.sleep_mode = minutes;
            Status::Ok
        });
        if status.is_ok() {
            self.blocking(move |d| d.write_setting(d.framer.commands().endpoints.sleep_mode, &[minutes], "sleep mode"))
                .await;
        }
        status
    }

    /// Hand the LEDs to the OpenRGB target, or take them back.
    pub async fn toggle_openrgb_integration(self: &Arc<Self>) -> Status {
        if self.descriptor.led_channels == 0 {
            return Status::Failure;
        }
        let status = self.update_profile(|p| {
            if p.rgb_cluster {
                return Status::SourceConflict;
            }
            p.openrgb_integration = !p.openrgb_integration;
            Status::Ok
        });
        if status.is_ok() {
            self.refresh_lighting().await;
        }
        status
    }

    /// Join or leave the RGB cluster.
    pub async fn toggle_rgb_cluster(self: &Arc<Self>) -> Status {
        if self.descriptor.led_channels == 0 {
            return Status::Failure;
        }
        let status = self.update_profile(|p| {
            if p.openrgb_integration {
                return Status::SourceConflict;
            }
            p.rgb_cluster = !p.rgb_cluster;
            Status::Ok
        });
        if status.is_ok() {
            self.refresh_lighting().await;
        }
        status
    }

    /// Replace the assignment of one button and persist the set under the
    /// active profile's hash.
    pub fn set_key_assignment(&self, mask: u32, entry: KeyAssignment) -> Status {
        if self.is_stopped() || !self.descriptor.buttons.iter().any(|b| b.mask == mask) {
            return Status::Failure;
        }
        let mut state = self.state.lock();
        if state.profiles.active().key_assignment_hash.is_empty() {
            let hash = format!("{}-{}", self.serial, state.profiles.active_name());
            state.profiles.active_mut().key_assignment_hash = hash;
            if let Err(e) = state.profiles.save_active(&*self.services.store) {
                warn!(serial = %self.serial, error = %e, "failed to save profile");
                return Status::Failure;
            }
        }
        state.keys.set(mask, entry);
        let hash = state.profiles.active().key_assignment_hash.clone();
        match keyassign::save_assignments(&*self.services.store, &hash, state.keys.entries()) {
            Ok(()) => Status::Ok,
            Err(e) => {
                warn!(serial = %self.serial, error = %e, "failed to save key assignments");
                Status::Failure
            }
        }
    }

    // ---- teardown ----

    /// Stop every loop, hand the device back to its firmware and close the
    /// transport. Calling it again does nothing.
    pub async fn stop(self: &Arc<Self>) {
        self.shutdown_with(true).await;
    }

    /// Stop every loop without touching the device or closing its handle;
    /// used after it vanished.
    pub async fn stop_dirty(self: &Arc<Self>) {
        self.shutdown_with(false).await;
    }

    async fn shutdown_with(self: &Arc<Self>, clean: bool) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(serial = %self.serial, clean, "stopping device");
        self.framer.set_exit();
        self.input_exit.store(true, Ordering::SeqCst);
        self.shutdown.trigger();
        if let Some(old) = self.render.lock().await.take() {
            old.shutdown.trigger();
            if let Err(e) = old.handle.await {
                warn!(serial = %self.serial, error = %e, "render loop ended abnormally");
            }
        }
        self.leave_source(ColorSource::External);
        self.leave_source(ColorSource::Cluster);
        self.tasks.join_all().await;

        let framer = Arc::clone(&self.framer);
        let desc = self.descriptor;
        let result = tokio::task::spawn_blocking(move || {
            if clean {
                if desc.led_channels > 0 {
                    framer.write_frame(&vec![0; desc.led_channels * 3]);
                }
                if desc.kind != ProductKind::Psu && desc.link == Link::Hid {
                    framer.transfer(framer.commands().hardware_mode, &[]);
                }
                framer.close();
            }
        })
        .await;
        if let Err(e) = result {
            warn!(serial = %self.serial, error = %e, "device teardown failed");
        }
        info!(serial = %self.serial, "device stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{descriptor, pids, VENDOR_ID};
    use crate::macros::RecordingSynth;
    use crate::store::MemoryStore;
    use crate::temperature::FixedTemperatures;
    use crate::transport::mock::MockTransport;

    fn services(store: Arc<MemoryStore>) -> Services {
        let provider = Arc::new(FixedTemperatures::new());
        let temperatures = Arc::new(TemperatureCache::new(provider));
        Services {
            config: Arc::new(Config::default()),
            store,
            temperatures: Arc::clone(&temperatures),
            synth: Arc::new(RecordingSynth::new()),
            cluster: Arc::new(Cluster::new(Default::default(), Some(temperatures))),
            external: Arc::new(ExternalTarget::new()),
            speed_profiles: Arc::new(RwLock::new(SpeedLibrary::default())),
            macros: Arc::new(RwLock::new(MacroLibrary::default())),
        }
    }

    fn firmware_reply() -> Vec<u8> {
        vec![0x00, 0x02, 0x00, 1, 2, 0x2A, 0x00]
    }

    async fn katar() -> (Arc<Device>, MockTransport, Services) {
        let desc = descriptor(VENDOR_ID, pids::KATAR_PRO_XT).unwrap();
        let mock = MockTransport::with_info("KT01", "KATAR PRO XT");
        mock.push_response(firmware_reply());
        let services = services(Arc::new(MemoryStore::new()));
        let device = Device::init(desc, Box::new(mock.clone()), None, None, services.clone())
            .await
            .unwrap();
        (device, mock, services)
    }

    #[test]
    fn firmware_parsing() {
        assert_eq!(parse_firmware(&firmware_reply()).as_deref(), Some("1.2.42"));
        assert_eq!(parse_firmware(&[0x00, 0x02]), None);
    }

    #[tokio::test]
    async fn init_reads_firmware_and_enters_software_mode() {
        let (device, mock, _) = katar().await;
        assert_eq!(device.firmware(), "1.2.42");
        assert_eq!(device.serial(), "KT01");
        let written = mock.written();
        assert_eq!(&written[0][2..4], &[0x02, 0x13]);
        assert_eq!(&written[1][2..6], &[0x01, 0x03, 0x00, 0x02]);
        device.stop().await;
    }

    #[tokio::test]
    async fn init_without_firmware_reply_fails() {
        let desc = descriptor(VENDOR_ID, pids::KATAR_PRO_XT).unwrap();
        let mock = MockTransport::with_info("KT02", "KATAR PRO XT");
        let result = Device::init(desc, Box::new(mock), None, None, services(Arc::new(MemoryStore::new()))).await;
        assert!(matches!(result, Err(Error::Timeout(_))));
    }

    #[tokio::test]
    async fn init_without_serial_fails() {
        let desc = descriptor(VENDOR_ID, pids::KATAR_PRO_XT).unwrap();
        let mock = MockTransport::new();
        let result = Device::init(desc, Box::new(mock), None, None, services(Arc::new(MemoryStore::new()))).await;
        assert!(matches!(result, Err(Error::DeviceNotFound(_))));
    }

    #[tokio::test]
    async fn stop_is_idempotent_and_returns_to_hardware_mode() {
        let (device, mock, _) = katar().await;
        device.stop().await;
        let written = mock.written();
        let hardware = written
            .iter()
            .filter(|r| r.get(2..6) == Some(&[0x01, 0x03, 0x00, 0x01][..]))
            .count();
        assert_eq!(hardware, 1);
        device.stop().await;
        assert_eq!(mock.written().len(), written.len());
        assert!(matches!(device.stats(), Err(Error::Closed)));
        assert_eq!(device.set_brightness(50).await, Status::Failure);
    }

    #[tokio::test]
    async fn dirty_stop_leaves_device_alone() {
        let (device, mock, _) = katar().await;
        mock.clear_written();
        device.stop_dirty().await;
        assert!(mock
            .written()
            .iter()
            .all(|r| r.get(2..6) != Some(&[0x01, 0x03, 0x00, 0x01][..])));
    }

    #[tokio::test]
    async fn toggles_are_mutually_exclusive() {
        let (device, _, services) = katar().await;
        assert_eq!(device.toggle_rgb_cluster().await, Status::Ok);
        assert_eq!(device.color_source(), ColorSource::Cluster);
        assert_eq!(services.cluster.len(), 1);
        assert_eq!(device.toggle_openrgb_integration().await, Status::SourceConflict);
        assert_eq!(device.toggle_rgb_cluster().await, Status::Ok);
        assert!(services.cluster.is_empty());
        assert_eq!(device.toggle_openrgb_integration().await, Status::Ok);
        assert_eq!(device.color_source(), ColorSource::External);
        assert_eq!(services.external.len(), 1);
        device.stop().await;
        assert!(services.external.is_empty());
    }

    #[tokio::test]
    async fn settings_are_validated_and_persisted() {
        let (device, _, _) = katar().await;
        assert_eq!(device.set_brightness(101).await, Status::Failure);
        assert_eq!(device.set_brightness(40).await, Status::Ok);
        assert_eq!(device.active_profile().brightness_slider, 40);
        assert_eq!(device.set_rgb_profile("nonsense").await, Status::Failure);
        assert_eq!(device.set_rgb_profile("rainbow").await, Status::Ok);
        assert_eq!(device.set_lift_height(9).await, Status::Failure);
        assert_eq!(device.set_polling_rate(1000).await, Status::Ok);
        assert_eq!(device.set_sleep_mode(10).await, Status::Failure);
        device.stop().await;
    }

    #[tokio::test]
    async fn dpi_stage_must_exist_and_not_be_sniper() {
        let (device, _, _) = katar().await;
        let stages = device.active_profile().dpi_profiles;
        let sniper = stages.iter().position(|s| s.sniper).unwrap();
        assert_eq!(device.set_dpi_stage(sniper).await, Status::MissingDpiStage);
        assert_eq!(device.set_dpi_stage(99).await, Status::MissingDpiStage);
        assert_eq!(device.set_dpi_stage(1).await, Status::Ok);
        assert_eq!(device.active_profile().dpi_stage, 1);
        device.stop().await;
    }

    #[tokio::test]
    async fn liquid_profile_needs_a_pump() {
        let desc = descriptor(VENDOR_ID, pids::COMMANDER_CORE_XT).unwrap();
        let mock = MockTransport::with_info("CX01", "iCUE COMMANDER CORE XT");
        mock.push_response(firmware_reply());
        let services = services(Arc::new(MemoryStore::new()));
        let device = Device::init(desc, Box::new(mock), None, None, services).await.unwrap();
        assert_eq!(device.set_speed_profile(0, "Liquid"), Status::PumpRequired);
        assert_eq!(device.set_speed_profile(0, "Quiet"), Status::Ok);
        assert_eq!(device.set_speed_profile(0, "Missing"), Status::Failure);
        assert_eq!(device.set_speed_profile(40, "Quiet"), Status::Failure);
        device.stop().await;
    }

    #[tokio::test]
    async fn user_profiles_rotate_and_delete() {
        let (device, _, _) = katar().await;
        assert_eq!(device.new_user_profile("gaming"), Status::Ok);
        assert_eq!(device.new_user_profile("gaming"), Status::Failure);
        assert_eq!(device.rotate_user_profile().await, Status::Ok);
        assert_eq!(device.active_profile_name(), "gaming");
        assert_eq!(device.delete_user_profile("gaming"), Status::ProfileActive);
        assert_eq!(device.switch_user_profile("default").await, Status::Ok);
        assert_eq!(device.delete_user_profile("gaming"), Status::Ok);
        assert_eq!(device.profile_names(), vec!["default".to_string()]);
        device.stop().await;
    }

    #[tokio::test]
    async fn dpi_buttons_step_stages() {
        let (device, _, _) = katar().await;
        let desc = device.descriptor();
        let up = desc
            .buttons
            .iter()
            .find(|b| b.role == crate::device::ButtonRole::DpiUp)
            .unwrap()
            .mask;
        let before = device.active_profile().dpi_stage;
        device.on_input(InputEvent::Buttons(up));
        device.on_input(InputEvent::Buttons(0));
        assert_eq!(device.active_profile().dpi_stage, before + 1);
        device.on_input(InputEvent::Battery(55));
        assert_eq!(device.stats().unwrap().battery, Some(55));
        device.stop().await;
    }
}
