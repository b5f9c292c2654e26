use clap::ArgMatches;
use log::{info, warn};
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;

use busmix_lib::ids::VoiceId;
use busmix_lib::output::{BufferSinkFactory, DeviceState};
use busmix_lib::plugin::BuiltinPlugins;
use busmix_lib::{MixEngine, TickReport};

use crate::cli;
use crate::error::CliError;
use crate::logging::{self, LogBuffer};
use crate::scene::{Scene, SceneAction};

/// Final state of one device after a render.
#[derive(Debug, Serialize)]
struct DeviceSummary {
    name: String,
    state: DeviceState,
    sink: String,
    blocks_sent: u64,
    failures: u32,
    samples: usize,
    peak: f32,
    captured: Option<usize>,
}

#[derive(Debug, Serialize)]
struct RenderSummary {
    ticks: u64,
    frames: u64,
    silent_ticks: u64,
    max_voices: usize,
    last: Option<TickReport>,
    devices: Vec<DeviceSummary>,
}

pub fn run(args: &ArgMatches, log_buffer: &LogBuffer) -> Result<i32, CliError> {
    match args.subcommand() {
        Some(("render", render_args)) => render(render_args, log_buffer),
        Some(("create", create_args)) => cli::create::run(create_args),
        _ => Ok(2),
    }
}

fn render(args: &ArgMatches, log_buffer: &LogBuffer) -> Result<i32, CliError> {
    let Some(path) = args.get_one::<String>("SCENE") else {
        return Ok(2);
    };
    let scene = Scene::load(Path::new(path))?;
    let ticks = args.get_one::<u64>("ticks").copied().unwrap_or(scene.ticks);
    info!("rendering {} for {} tick(s)", path, ticks);

    let summary = render_scene(&scene, ticks)?;

    match args.get_one::<String>("report").map(String::as_str) {
        Some("json") => println!("{}", serde_json::to_string_pretty(&summary)?),
        _ => print_text(&summary),
    }

    if args.get_flag("show-log") {
        println!("--- log ---");
        for line in logging::snapshot(log_buffer) {
            println!("{}", line);
        }
    }
    Ok(0)
}

fn render_scene(scene: &Scene, ticks: u64) -> Result<RenderSummary, CliError> {
    let factory = BufferSinkFactory::new(scene.blocks_per_tick);
    let mut engine = MixEngine::new(
        scene.engine.clone(),
        Box::new(factory.clone()),
        Arc::new(BuiltinPlugins),
    )?;
    let sample_rate = engine.settings().sample_rate;

    engine.init_main_device(scene.main_device.clone())?;
    for device in &scene.devices {
        engine.add_output_device(device.clone())?;
    }
    for bus in &scene.buses {
        engine.register_bus(bus.clone())?;
    }

    let mut voices: Vec<Option<VoiceId>> = vec![None; scene.voices.len()];
    let mut max_voices = 0;
    let mut silent_ticks = 0;
    let mut last = None;
    for tick in 0..ticks {
        for (index, voice) in scene.voices.iter().enumerate() {
            if voice.start_tick == tick {
                let id = engine.add_voice(voice.build_source(sample_rate), voice.params.clone())?;
                voices[index] = Some(id);
            }
        }
        for event in scene.events.iter().filter(|e| e.tick == tick) {
            apply_event(&mut engine, &factory, &voices, tick, &event.action)?;
        }

        let report = engine.render_tick();
        max_voices = max_voices.max(report.graph.voices);
        if report.silent_mode {
            silent_ticks += 1;
        }
        last = Some(report);
    }

    let devices = engine
        .outputs()
        .devices()
        .map(|device| {
            let samples = factory
                .handle(device.name())
                .map(|handle| handle.samples())
                .unwrap_or_default();
            DeviceSummary {
                name: device.name().to_string(),
                state: device.state(),
                sink: device.sink_name().to_string(),
                blocks_sent: device.blocks_sent(),
                failures: device.failures(),
                samples: samples.len(),
                peak: samples.iter().fold(0.0_f32, |peak, s| peak.max(s.abs())),
                captured: engine.capture_handle(device.id()).map(|handle| handle.len()),
            }
        })
        .collect();
    let summary = RenderSummary {
        ticks,
        frames: engine.frames_rendered(),
        silent_ticks,
        max_voices,
        last,
        devices,
    };
    engine.term();
    Ok(summary)
}

fn apply_event(
    engine: &mut MixEngine,
    factory: &BufferSinkFactory,
    voices: &[Option<VoiceId>],
    tick: u64,
    action: &SceneAction,
) -> Result<(), CliError> {
    let event_error = |reason: String| CliError::Event { tick, reason };
    match action {
        SceneAction::StopVoice { voice } => match voices.get(*voice).copied().flatten() {
            // The voice may have finished already.
            Some(id) => {
                if engine.stop_voice(id).is_err() {
                    warn!("{} already left the graph", id);
                }
            }
            None => return Err(event_error(format!("voice {} has not started", voice))),
        },
        SceneAction::SetBusVolume { bus, volume_db } => engine.set_bus_volume(*bus, *volume_db)?,
        SceneAction::SetDeviceVolume { device, volume_db } => {
            let id = engine
                .outputs()
                .devices()
                .find(|d| d.name() == device)
                .map(|d| d.id())
                .ok_or_else(|| event_error(format!("no device named \"{}\"", device)))?;
            engine.set_device_volume(id, *volume_db)?;
        }
        SceneAction::FailDevice { device } => factory
            .handle(device)
            .ok_or_else(|| event_error(format!("no sink for device \"{}\"", device)))?
            .fail(),
    }
    Ok(())
}

fn print_text(summary: &RenderSummary) {
    println!(
        "rendered {} frame(s) in {} tick(s), {} silent",
        summary.frames, summary.ticks, summary.silent_ticks
    );
    println!("max voices: {}", summary.max_voices);
    if let Some(last) = &summary.last {
        println!(
            "final graph: {} voice(s), {} bus(es), {} connection(s), {} collected",
            last.graph.voices, last.graph.buses, last.graph.connections, last.graph.connections_collected
        );
    }
    for device in &summary.devices {
        let state = serde_json::to_value(device.state)
            .ok()
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_default();
        print!(
            "device {} [{}] via {}: {} block(s), {} sample(s), peak {:.3}, {} failure(s)",
            device.name, state, device.sink, device.blocks_sent, device.samples, device.peak, device.failures
        );
        match device.captured {
            Some(captured) => println!(", {} captured", captured),
            None => println!(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn template_scene_renders() {
        let summary = render_scene(&Scene::template(), 8).expect("render");
        assert_eq!(summary.ticks, 8);
        assert_eq!(summary.frames, 8);
        assert_eq!(summary.devices.len(), 2);
        assert!(summary.devices.iter().all(|d| d.samples > 0));
        assert!(summary.max_voices >= 2);
        assert_eq!(summary.devices[0].captured, Some(8 * 1024));
    }

    #[test]
    fn failed_devices_fall_back() {
        let mut scene = Scene::template();
        scene.events = vec![crate::scene::SceneEvent {
            tick: 1,
            action: SceneAction::FailDevice {
                device: "controller".into(),
            },
        }];
        let summary = render_scene(&scene, 3).expect("render");
        let controller = summary
            .devices
            .iter()
            .find(|d| d.name == "controller")
            .expect("controller");
        assert_eq!(controller.failures, 1);
        assert_eq!(controller.sink, "dummy");
    }

    #[test]
    fn unknown_devices_in_events_are_errors() {
        let mut scene = Scene::template();
        scene.events = vec![crate::scene::SceneEvent {
            tick: 0,
            action: SceneAction::SetDeviceVolume {
                device: "missing".into(),
                volume_db: -3.0,
            },
        }];
        assert!(matches!(
            render_scene(&scene, 1),
            Err(CliError::Event { tick: 0, .. })
        ));
    }
}
