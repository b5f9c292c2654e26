use serde_json::json;
use std::alloc::{GlobalAlloc, Layout, System};
use std::cell::Cell;
use std::sync::Arc;

use busmix_lib::audio::ChannelConfig;
use busmix_lib::graph::{BusContext, ConnectionType, MixGraph};
use busmix_lib::ids::{DeviceId, ListenerId};
use busmix_lib::plugin::BuiltinPlugins;
use busmix_lib::settings::{BusOutput, BusSettings, EffectSlotSettings, EngineSettings, HdrSettings};
use busmix_lib::source::{AuxSend, ConstantSource, Ray, SineSource, SourceFrameParams, Spatialization};
use busmix_lib::spatial::{DefaultPanner, SharedPanCache};

/// Counts heap allocations made by the current thread.
struct CountingAllocator;

thread_local! {
    static ALLOCATIONS: Cell<usize> = const { Cell::new(0) };
}

fn count_allocation() {
    let _ = ALLOCATIONS.try_with(|count| count.set(count.get() + 1));
}

unsafe impl GlobalAlloc for CountingAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        count_allocation();
        System.alloc(layout)
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        System.dealloc(ptr, layout)
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        count_allocation();
        System.realloc(ptr, layout, new_size)
    }
}

#[global_allocator]
static ALLOCATOR: CountingAllocator = CountingAllocator;

fn allocations() -> usize {
    ALLOCATIONS.with(Cell::get)
}

const MAIN: DeviceId = DeviceId(1);

fn frame(graph: &mut MixGraph) -> f32 {
    graph.run_frame();
    let peak = graph.device_output(MAIN).map_or(0.0, |buffer| buffer.peak());
    graph.end_frame();
    peak
}

#[test]
fn steady_frames_do_not_allocate() {
    let settings = EngineSettings {
        frame_length: 64,
        ..EngineSettings::default()
    };
    let sample_rate = settings.sample_rate;
    let mut graph =
        MixGraph::new(settings, Arc::new(BuiltinPlugins), Arc::new(DefaultPanner)).expect("graph");
    graph
        .attach_device(MAIN, ChannelConfig::stereo(), Vec::new(), SharedPanCache::default())
        .expect("attach");
    graph.set_main_device(Some(MAIN)).expect("main");

    let mut music = BusSettings::named("music");
    music.metering = true;
    music.effects = vec![EffectSlotSettings::new("gain", json!({"gain": "-3db"}))];
    let music = graph.register_bus(music).expect("bus");
    let mut sfx = BusSettings::named("sfx");
    sfx.output = BusOutput::Parent { bus: music };
    sfx.hdr = Some(HdrSettings::default());
    let sfx = graph.register_bus(sfx).expect("bus");
    let mut reverb = BusSettings::named("reverb");
    reverb.effects = vec![EffectSlotSettings::new("low_pass", json!({"freq_hz": 2000.0}))];
    let reverb = graph.register_bus(reverb).expect("bus");

    graph
        .add_voice(
            Box::new(ConstantSource::new(ChannelConfig::mono(), 0.5)),
            SourceFrameParams {
                spatialization: Spatialization::TwoD { pan: 0.3 },
                envelope_db: 6.0,
                aux_sends: vec![AuxSend {
                    bus: BusContext::global(reverb),
                    listener: ListenerId(0),
                    level: 0.4,
                    kind: ConnectionType::UserDefinedSend,
                    lpf: 20.0,
                    hpf: 0.0,
                }],
                ..SourceFrameParams::routed_to(BusContext::global(sfx))
            },
        )
        .expect("voice");
    graph
        .add_voice(
            Box::new(SineSource::new(ChannelConfig::stereo(), 440.0, 0.25, sample_rate)),
            SourceFrameParams {
                spatialization: Spatialization::ThreeD,
                rays: vec![Ray {
                    azimuth: 0.5,
                    dry: 0.8,
                    spread: 0.5,
                    ..Ray::default()
                }],
                ..SourceFrameParams::default()
            },
        )
        .expect("voice");

    for _ in 0..16 {
        frame(&mut graph);
    }
    graph.validate_topology().expect("topology");

    let before = allocations();
    let mut loudest = 0.0_f32;
    for _ in 0..64 {
        loudest = loudest.max(frame(&mut graph));
    }
    let allocated = allocations() - before;

    assert!(loudest > 0.0);
    assert_eq!(allocated, 0, "{allocated} allocation(s) over 64 steady frames");
}
