use std::sync::Arc;
use std::time::Duration;

use busmix_lib::audio::ChannelConfig;
use busmix_lib::ids::{ListenerId, SharesetId};
use busmix_lib::output::{BufferSinkFactory, DeviceState, RingCapture};
use busmix_lib::plugin::BuiltinPlugins;
use busmix_lib::settings::{DeviceSettings, EngineSettings};
use busmix_lib::source::{ConstantSource, SourceFrameParams};
use busmix_lib::{MixEngine, MixError};

fn engine(factory: &BufferSinkFactory) -> MixEngine {
    let settings = EngineSettings {
        frame_length: 32,
        activation_phase_ticks: 2,
        silent_mode_wake_ms: 1,
        ..EngineSettings::default()
    };
    MixEngine::new(settings, Box::new(factory.clone()), Arc::new(BuiltinPlugins)).expect("engine")
}

fn device(name: &str, listeners: &[u64]) -> DeviceSettings {
    DeviceSettings {
        name: name.into(),
        channels: ChannelConfig::mono(),
        listeners: listeners.iter().copied().map(ListenerId).collect(),
        ..DeviceSettings::default()
    }
}

fn voice_for(engine: &mut MixEngine, listener: u64, value: f32) {
    engine
        .add_voice(
            Box::new(ConstantSource::new(ChannelConfig::mono(), value)),
            SourceFrameParams {
                listener: ListenerId(listener),
                ..SourceFrameParams::default()
            },
        )
        .expect("voice");
}

#[test]
fn voices_reach_only_the_devices_hearing_their_listener() {
    let factory = BufferSinkFactory::new(1);
    let mut engine = engine(&factory);
    engine.init_main_device(device("tv", &[1])).expect("main");
    engine.add_output_device(device("pad", &[2])).expect("pad");
    voice_for(&mut engine, 1, 0.5);
    voice_for(&mut engine, 2, 0.25);
    engine.render_tick();
    engine.render_tick();

    let tv = factory.handle("tv").expect("tv").samples();
    let pad = factory.handle("pad").expect("pad").samples();
    assert!((tv[tv.len() - 1] - 0.5).abs() < 1e-5);
    assert!((pad[pad.len() - 1] - 0.25).abs() < 1e-5);
}

#[test]
fn shared_listeners_on_one_shareset_are_rejected() {
    let factory = BufferSinkFactory::new(1);
    let mut engine = engine(&factory);
    let main = engine.init_main_device(device("tv", &[])).expect("main");
    assert!(matches!(
        engine.add_output_device(device("pad", &[3])),
        Err(MixError::NoDistinctListener(SharesetId(0)))
    ));
    assert!(matches!(
        engine.remove_output_device(main),
        Err(MixError::MainDeviceRemoval)
    ));
    assert!(matches!(
        engine.init_main_device(device("again", &[])),
        Err(MixError::MainDeviceAlreadyInitialized)
    ));
    assert_eq!(engine.outputs().devices().count(), 1);
    engine.graph().validate_topology().expect("topology");
}

#[test]
fn failing_sink_is_replaced_in_the_same_tick() {
    let factory = BufferSinkFactory::new(1);
    let mut engine = engine(&factory);
    engine.init_main_device(device("tv", &[1])).expect("main");
    let pad = engine.add_output_device(device("pad", &[2])).expect("pad");
    voice_for(&mut engine, 2, 0.5);
    engine.render_tick();

    let broken = factory.handle("pad").expect("pad sink");
    broken.fail();
    factory.set_unavailable(true);
    let report = engine.render_tick();
    assert_eq!(report.blocks, 1);
    let pad_report = report
        .devices
        .iter()
        .find(|d| d.id == pad)
        .expect("pad report");
    assert_eq!(pad_report.state, DeviceState::ToActivate);
    assert_eq!(pad_report.failures, 1);
    assert_eq!(broken.calls_after_failure(), 0);

    // Retries happen on aligned ticks only and keep failing while unavailable.
    engine.render_tick();
    engine.render_tick();
    assert_eq!(broken.calls_after_failure(), 0);
    assert!(engine.outputs().device(pad).is_some_and(|d| d.is_dummy()));

    factory.set_unavailable(false);
    engine.request_device_reinit();
    engine.render_tick();
    let fresh = factory.handle("pad").expect("new pad sink");
    assert_eq!(
        engine.outputs().device(pad).map(|d| d.state()),
        Some(DeviceState::Active)
    );
    engine.render_tick();
    assert!(fresh.consumed() >= 1);
    assert_eq!(broken.calls_after_failure(), 0);
}

#[test]
fn all_dummy_devices_run_in_silent_mode() {
    let factory = BufferSinkFactory::new(4);
    let mut engine = engine(&factory);
    let mut main = device("tv", &[]);
    main.forced_dummy = true;
    engine.init_main_device(main).expect("main");
    voice_for(&mut engine, 0, 1.0);

    let report = engine.render_tick();
    assert!(report.silent_mode);
    assert_eq!(report.blocks, 1);
    assert_eq!(factory.attempts(), 0);
    assert!(engine.wait_silent_tick(Duration::from_secs(1)));

    let pad = engine.add_output_device({
        let mut pad = device("pad", &[]);
        pad.shareset = SharesetId(1);
        pad
    });
    pad.expect("pad");
    let report = engine.render_tick();
    assert!(!report.silent_mode);
    assert_eq!(report.blocks, 4);
    engine.term();
}

#[test]
fn captured_audio_carries_the_master_volume() {
    let factory = BufferSinkFactory::new(1);
    let mut engine = engine(&factory);
    let main = engine.init_main_device(device("tv", &[])).expect("main");
    let (capture, handle) = RingCapture::new(256, 1);
    engine.set_capture(main, Some(Box::new(capture))).expect("capture");
    engine.set_device_volume(main, -6.0).expect("volume");
    voice_for(&mut engine, 0, 1.0);
    engine.render_tick();
    engine.render_tick();

    let captured = handle.drain();
    assert_eq!(captured.len(), 64);
    let sunk = factory.handle("tv").expect("sink").samples();
    assert_eq!(captured.len(), sunk.len());
    for (c, s) in captured.iter().zip(&sunk) {
        assert!((c - s).abs() < 1e-5);
    }
    assert!((captured[63] - busmix_lib::dsp::db_to_linear(-6.0)).abs() < 1e-4);

    handle.close();
    engine.render_tick();
    assert!(engine.outputs().device(main).is_some_and(|d| !d.has_capture()));
    assert_eq!(factory.handle("tv").expect("sink").consumed(), 3);
}
