//! Owns the output devices and decides how much to render each tick.

use std::collections::BTreeMap;
use std::time::Duration;

use super::capture::{CaptureHandle, CaptureSink, RingCapture};
use super::device::{Device, DeviceState};
use super::silent_mode::SilentModeTicker;
use super::sink::{DataNeeded, DummySink, Sink, SinkFactory, SinkFormat};
use crate::audio::{AudioBuffer, BufferState};
use crate::error::{MixError, Result};
use crate::graph::MixGraph;
use crate::ids::DeviceId;
use crate::settings::{DeviceSettings, EngineSettings};

pub struct OutputManager {
    settings: EngineSettings,
    factory: Box<dyn SinkFactory>,
    devices: BTreeMap<DeviceId, Device>,
    main: Option<DeviceId>,
    next_device: u32,
    tick: u64,
    silent: Option<SilentModeTicker>,
    silent_ticks: u64,
    captures: BTreeMap<DeviceId, CaptureHandle>,
    silence: AudioBuffer,
}

impl std::fmt::Debug for OutputManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutputManager")
            .field("devices", &self.devices)
            .field("main", &self.main)
            .field("tick", &self.tick)
            .field("silent_mode", &self.silent.is_some())
            .finish()
    }
}

impl OutputManager {
    pub fn new(settings: EngineSettings, factory: Box<dyn SinkFactory>) -> Self {
        Self {
            settings,
            factory,
            devices: BTreeMap::new(),
            main: None,
            next_device: 1,
            tick: 0,
            silent: None,
            silent_ticks: 0,
            captures: BTreeMap::new(),
            silence: AudioBuffer::default(),
        }
    }

    pub fn main_device(&self) -> Option<DeviceId> {
        self.main
    }

    pub fn device(&self, id: DeviceId) -> Option<&Device> {
        self.devices.get(&id)
    }

    pub fn devices(&self) -> impl Iterator<Item = &Device> {
        self.devices.values()
    }

    pub fn is_silent_mode(&self) -> bool {
        self.silent.is_some()
    }

    pub fn silent_ticks(&self) -> u64 {
        self.silent_ticks
    }

    pub fn tick(&self) -> u64 {
        self.tick
    }

    fn format(&self, settings: &DeviceSettings) -> SinkFormat {
        SinkFormat {
            config: settings.channels,
            sample_rate: self.settings.sample_rate,
            frame_length: self.settings.frame_length,
        }
    }

    pub fn init_main_device(&mut self, settings: DeviceSettings, graph: &mut MixGraph) -> Result<DeviceId> {
        if self.main.is_some() {
            return Err(MixError::MainDeviceAlreadyInitialized);
        }
        let id = self.add_output_device(settings, graph)?;
        self.main = Some(id);
        graph.set_main_device(Some(id))?;
        Ok(id)
    }

    pub fn add_output_device(&mut self, settings: DeviceSettings, graph: &mut MixGraph) -> Result<DeviceId> {
        settings.validate()?;
        self.check_distinct_listeners(&settings, None)?;

        let id = DeviceId(self.next_device);
        let (sink, state) = self.open_sink(&settings);
        let mut device = Device::new(id, settings, state, sink);
        if let Some(frames) = device.settings().capture_frames {
            let (capture, handle) = RingCapture::new(frames, device.settings().channels.channels());
            device.set_capture(Some(Box::new(capture)));
            self.captures.insert(id, handle);
        }
        graph.attach_device(
            id,
            device.settings().channels,
            device.settings().listeners.clone(),
            device.pan_cache().clone(),
        )?;
        self.next_device += 1;
        log::info!("{} ({}): added, {:?}", id, device.name(), device.state());
        self.devices.insert(id, device);
        Ok(id)
    }

    /// Attach a capture target to a device, replacing any existing one.
    pub fn set_capture(&mut self, id: DeviceId, capture: Option<Box<dyn CaptureSink>>) -> Result<()> {
        self.devices
            .get_mut(&id)
            .ok_or(MixError::UnknownDevice(id))?
            .set_capture(capture);
        self.captures.remove(&id);
        Ok(())
    }

    /// Reader for the ring capture configured through `capture_frames`.
    pub fn capture_handle(&self, id: DeviceId) -> Option<&CaptureHandle> {
        self.captures.get(&id)
    }

    pub fn remove_output_device(&mut self, id: DeviceId, graph: &mut MixGraph) -> Result<()> {
        if self.main == Some(id) {
            return Err(MixError::MainDeviceRemoval);
        }
        let mut device = self.devices.remove(&id).ok_or(MixError::UnknownDevice(id))?;
        device.terminate();
        self.captures.remove(&id);
        graph.detach_device(id)?;
        log::info!("{} ({}): removed", id, device.name());
        Ok(())
    }

    /// Hot-swap a device's sink and settings, keeping its id.
    pub fn replace_device(&mut self, id: DeviceId, settings: DeviceSettings, graph: &mut MixGraph) -> Result<()> {
        settings.validate()?;
        self.check_distinct_listeners(&settings, Some(id))?;
        let old_config = self
            .devices
            .get(&id)
            .ok_or(MixError::UnknownDevice(id))?
            .settings()
            .channels;

        let (sink, state) = self.open_sink(&settings);
        let config = settings.channels;
        let listeners = settings.listeners.clone();
        let Some(device) = self.devices.get_mut(&id) else {
            return Err(MixError::UnknownDevice(id));
        };
        device.replace_sink(settings, sink, state);

        if old_config != config {
            graph.detach_device(id)?;
            graph.attach_device(id, config, listeners, device.pan_cache().clone())?;
            if self.main == Some(id) {
                graph.set_main_device(Some(id))?;
            }
        } else {
            graph.set_device_listeners(id, listeners)?;
        }
        log::info!("{} ({}): replaced, {:?}", id, device.name(), device.state());
        Ok(())
    }

    pub fn set_device_volume(&mut self, id: DeviceId, volume_db: f32) -> Result<()> {
        if !volume_db.is_finite() {
            return Err(MixError::InvalidSettings(format!("volume of {} is not finite", id)));
        }
        self.devices
            .get_mut(&id)
            .ok_or(MixError::UnknownDevice(id))?
            .set_volume_db(volume_db);
        Ok(())
    }

    fn check_distinct_listeners(&self, settings: &DeviceSettings, except: Option<DeviceId>) -> Result<()> {
        let clash = self.devices.values().any(|d| {
            Some(d.id()) != except
                && d.shareset() == settings.shareset
                && d.overlaps(&settings.listeners)
        });
        if clash {
            return Err(MixError::NoDistinctListener(settings.shareset));
        }
        Ok(())
    }

    fn open_sink(&mut self, settings: &DeviceSettings) -> (Box<dyn Sink>, DeviceState) {
        if settings.forced_dummy {
            return (Box::new(DummySink::new()), DeviceState::ForcedDummy);
        }
        let format = self.format(settings);
        match self.factory.create_sink(settings, format) {
            Ok(sink) => (sink, DeviceState::Active),
            Err(err) => {
                log::warn!("{}: sink unavailable, using a dummy: {}", settings.name, err);
                (Box::new(DummySink::new()), DeviceState::ToActivate)
            }
        }
    }

    /// Advance the device tick and retry activation where due.
    ///
    /// Devices waiting for a sink retry only on ticks aligned to the
    /// activation phase, unless `reinit_now` is set.
    pub fn manage_devices_state(&mut self, reinit_now: bool) {
        self.tick += 1;
        let phase = self.settings.activation_phase_ticks.max(1);
        if !reinit_now && self.tick % phase != 0 {
            return;
        }
        let retries = self.settings.activation_retries.max(1);
        let ids: Vec<DeviceId> = self
            .devices
            .values()
            .filter(|d| d.state() == DeviceState::ToActivate)
            .map(Device::id)
            .collect();
        for id in ids {
            let Some(settings) = self.devices.get(&id).map(|d| d.settings().clone()) else {
                continue;
            };
            let format = self.format(&settings);
            let mut opened = None;
            for attempt in 1..=retries {
                match self.factory.create_sink(&settings, format) {
                    Ok(sink) => {
                        opened = Some(sink);
                        break;
                    }
                    Err(err) => log::warn!(
                        "{} ({}): activation attempt {}/{} failed: {}",
                        id,
                        settings.name,
                        attempt,
                        retries,
                        err
                    ),
                }
            }
            if let (Some(sink), Some(device)) = (opened, self.devices.get_mut(&id)) {
                device.activate(sink);
            }
        }
    }

    fn primary(&self) -> Option<DeviceId> {
        if let Some(main) = self.main.filter(|id| self.devices.get(id).is_some_and(|d| !d.is_dummy())) {
            return Some(main);
        }
        self.devices.values().find(|d| !d.is_dummy()).map(Device::id)
    }

    /// Frame blocks to render this tick.
    ///
    /// Failing sinks are replaced by dummies before anything else is asked of
    /// them. With only dummies left the manager enters silent mode and asks
    /// for one block per tick.
    pub fn is_data_needed(&mut self) -> u32 {
        for device in self.devices.values_mut() {
            match device.poll() {
                DataNeeded::Fail => device.fall_back_to_dummy("sink failed"),
                DataNeeded::Frames(blocks) => device.pending_blocks = blocks,
            }
        }

        let Some(primary) = self.primary() else {
            self.enter_silent_mode();
            self.silent_ticks += 1;
            return 1;
        };
        let blocks = self
            .devices
            .get(&primary)
            .map_or(0, |d| d.pending_blocks);
        if self.silent.take().is_some() {
            log::info!("leaving silent mode, {} drives the frame rate", primary);
            for device in self.devices.values_mut().filter(|d| !d.is_dummy()) {
                device.pending_blocks = blocks;
                device.idle_ticks = 0;
            }
        }

        let limit = self.settings.starve_tick_limit.max(1);
        for device in self.devices.values_mut() {
            if device.id() == primary || device.is_dummy() {
                continue;
            }
            if blocks > 0 && device.pending_blocks == 0 {
                device.idle_ticks += 1;
                if device.idle_ticks >= limit {
                    device.fall_back_to_dummy("starved");
                }
            } else {
                device.idle_ticks = 0;
            }
        }
        blocks
    }

    fn enter_silent_mode(&mut self) {
        if self.silent.is_some() {
            return;
        }
        match SilentModeTicker::start(self.settings.silent_mode_interval()) {
            Ok(ticker) => {
                log::info!("all devices are dummies, entering silent mode");
                self.silent = Some(ticker);
            }
            Err(err) => log::error!("cannot start the silent mode ticker: {}", err),
        }
    }

    /// Block until the silent-mode ticker fires; returns false outside
    /// silent mode or on timeout.
    pub fn wait_silent_tick(&self, timeout: Duration) -> bool {
        self.silent.as_ref().is_some_and(|ticker| ticker.wait(timeout))
    }

    /// Send the rendered block of every device mix bus to its sink; devices
    /// whose mix bus produced nothing get silence.
    pub fn output_frame(&mut self, graph: &MixGraph) {
        let frame_length = self.settings.frame_length;
        for device in self.devices.values_mut() {
            if let Some(buffer) = graph.device_output(device.id()) {
                device.output(buffer);
                continue;
            }
            let config = device.settings().channels;
            if self.silence.config() != config || self.silence.max_frames() != frame_length {
                if let Err(err) = self.silence.reconfigure(config, frame_length) {
                    log::error!("{}: cannot allocate silence: {}", device.id(), err);
                    continue;
                }
            }
            self.silence.set_valid_frames(frame_length);
            self.silence.set_state(BufferState::DataReady);
            device.output(&self.silence);
        }
    }

    pub fn on_frame_end(&mut self) {
        for device in self.devices.values_mut() {
            device.end_frame();
        }
    }

    /// Ask every real sink to reset; failures fall back to a dummy.
    pub fn reset_devices(&mut self) {
        for device in self.devices.values_mut() {
            if let Err(err) = device.reset_sink() {
                device.fall_back_to_dummy(&err.to_string());
            }
        }
    }

    pub fn term(&mut self) {
        self.silent = None;
        for device in self.devices.values_mut() {
            device.terminate();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::ChannelConfig;
    use crate::ids::{ListenerId, SharesetId};
    use crate::output::sink::BufferSinkFactory;
    use crate::plugin::BuiltinPlugins;
    use crate::spatial::DefaultPanner;
    use std::sync::Arc;

    fn setup(blocks: u32) -> (OutputManager, MixGraph, BufferSinkFactory) {
        let settings = EngineSettings {
            frame_length: 32,
            activation_phase_ticks: 4,
            starve_tick_limit: 3,
            silent_mode_wake_ms: 1,
            ..EngineSettings::default()
        };
        let graph = MixGraph::new(settings.clone(), Arc::new(BuiltinPlugins), Arc::new(DefaultPanner))
            .expect("graph");
        let factory = BufferSinkFactory::new(blocks);
        let manager = OutputManager::new(settings, Box::new(factory.clone()));
        (manager, graph, factory)
    }

    fn device(name: &str, listeners: Vec<ListenerId>) -> DeviceSettings {
        DeviceSettings {
            name: name.into(),
            channels: ChannelConfig::mono(),
            listeners,
            ..DeviceSettings::default()
        }
    }

    #[test]
    fn main_device_is_initialized_once() {
        let (mut manager, mut graph, _) = setup(1);
        let main = manager
            .init_main_device(device("main", Vec::new()), &mut graph)
            .expect("main");
        assert_eq!(manager.main_device(), Some(main));
        assert_eq!(graph.main_device(), Some(main));
        assert!(matches!(
            manager.init_main_device(device("other", Vec::new()), &mut graph),
            Err(MixError::MainDeviceAlreadyInitialized)
        ));
        assert!(matches!(
            manager.remove_output_device(main, &mut graph),
            Err(MixError::MainDeviceRemoval)
        ));
    }

    #[test]
    fn devices_on_one_shareset_need_distinct_listeners() {
        let (mut manager, mut graph, _) = setup(1);
        manager
            .init_main_device(device("main", vec![ListenerId(1)]), &mut graph)
            .expect("main");
        assert!(matches!(
            manager.add_output_device(device("pad", vec![ListenerId(1)]), &mut graph),
            Err(MixError::NoDistinctListener(SharesetId(0)))
        ));
        let pad = manager
            .add_output_device(device("pad", vec![ListenerId(2)]), &mut graph)
            .expect("distinct listeners");
        let mut other = device("other", vec![ListenerId(1)]);
        other.shareset = SharesetId(7);
        manager.add_output_device(other, &mut graph).expect("other shareset");

        manager.remove_output_device(pad, &mut graph).expect("remove");
        assert!(manager.device(pad).is_none());
        assert!(graph.device_bus(pad).is_none());
    }

    #[test]
    fn unavailable_sinks_start_as_dummies_and_activate_on_phase() {
        let (mut manager, mut graph, factory) = setup(2);
        factory.set_unavailable(true);
        let main = manager
            .init_main_device(device("main", Vec::new()), &mut graph)
            .expect("main");
        let dev = manager.device(main).expect("device");
        assert_eq!(dev.state(), DeviceState::ToActivate);
        assert!(dev.is_dummy());

        factory.set_unavailable(false);
        for _ in 0..3 {
            manager.manage_devices_state(false);
        }
        assert!(manager.device(main).is_some_and(Device::is_dummy));
        manager.manage_devices_state(false);
        let dev = manager.device(main).expect("device");
        assert_eq!(dev.state(), DeviceState::Active);
        assert_eq!(manager.is_data_needed(), 2);
    }

    #[test]
    fn exhausted_retries_keep_the_device_waiting() {
        let (mut manager, mut graph, factory) = setup(1);
        factory.set_unavailable(true);
        let main = manager
            .init_main_device(device("main", Vec::new()), &mut graph)
            .expect("main");

        for _ in 0..8 {
            manager.manage_devices_state(false);
        }
        let dev = manager.device(main).expect("device");
        assert_eq!(dev.state(), DeviceState::ToActivate);
        assert!(dev.is_dummy());

        factory.set_unavailable(false);
        manager.manage_devices_state(true);
        assert_eq!(manager.device(main).map(Device::state), Some(DeviceState::Active));
    }

    #[test]
    fn failing_primary_falls_back_within_the_tick() {
        let (mut manager, mut graph, factory) = setup(1);
        let main = manager
            .init_main_device(device("main", Vec::new()), &mut graph)
            .expect("main");
        let handle = factory.handle("main").expect("sink");
        assert_eq!(manager.is_data_needed(), 1);
        assert!(!manager.is_silent_mode());

        handle.fail();
        assert_eq!(manager.is_data_needed(), 1);
        assert!(manager.is_silent_mode());
        graph.run_frame();
        manager.output_frame(&graph);
        manager.on_frame_end();
        graph.end_frame();
        assert_eq!(handle.calls_after_failure(), 0);
        assert_eq!(manager.device(main).map(Device::failures), Some(1));
        assert!(manager.wait_silent_tick(Duration::from_secs(1)));
    }

    #[test]
    fn forced_dummies_never_open_sinks() {
        let (mut manager, mut graph, factory) = setup(1);
        let mut settings = device("main", Vec::new());
        settings.forced_dummy = true;
        let main = manager.init_main_device(settings, &mut graph).expect("main");
        manager.manage_devices_state(true);
        assert_eq!(factory.attempts(), 0);
        assert_eq!(manager.device(main).map(Device::state), Some(DeviceState::ForcedDummy));
        assert_eq!(manager.is_data_needed(), 1);
        assert!(manager.is_silent_mode());
    }

    #[test]
    fn starving_secondary_devices_are_demoted() {
        let (mut manager, mut graph, factory) = setup(1);
        manager
            .init_main_device(device("main", vec![ListenerId(1)]), &mut graph)
            .expect("main");
        let pad = manager
            .add_output_device(device("pad", vec![ListenerId(2)]), &mut graph)
            .expect("pad");
        factory.handle("pad").expect("sink").set_blocks_per_tick(0);
        for _ in 0..3 {
            assert_eq!(manager.is_data_needed(), 1);
        }
        let pad = manager.device(pad).expect("pad");
        assert!(pad.is_dummy());
        assert_eq!(pad.state(), DeviceState::ToActivate);
    }

    #[test]
    fn configured_capture_is_readable() {
        let (mut manager, mut graph, _) = setup(1);
        let mut settings = device("main", Vec::new());
        settings.capture_frames = Some(64);
        let main = manager.init_main_device(settings, &mut graph).expect("main");
        graph.run_frame();
        manager.is_data_needed();
        manager.output_frame(&graph);
        manager.on_frame_end();
        graph.end_frame();
        let capture = manager.capture_handle(main).expect("capture");
        assert_eq!(capture.len(), 32);
    }

    #[test]
    fn replacing_a_device_terminates_the_old_sink() {
        let (mut manager, mut graph, factory) = setup(1);
        let main = manager
            .init_main_device(device("main", Vec::new()), &mut graph)
            .expect("main");
        let old = factory.handle("main").expect("sink");
        let mut stereo = device("main", Vec::new());
        stereo.channels = ChannelConfig::stereo();
        manager.replace_device(main, stereo, &mut graph).expect("replace");
        assert!(old.is_terminated());
        assert_eq!(factory.created(), 2);
        assert_eq!(
            graph.device_bus(main).map(|bus| bus.config()),
            Some(ChannelConfig::stereo())
        );
        assert_eq!(graph.main_device(), Some(main));
    }
}
