//! Hardware sink on the default output stream.

use log::{error, warn};
use rodio::buffer::SamplesBuffer;
use rodio::{OutputStream, OutputStreamBuilder};
use std::thread;
use std::time::Duration;

use super::sink::{DataNeeded, Sink, SinkFactory, SinkFormat};
use crate::audio::AudioBuffer;
use crate::constants::{OUTPUT_STREAM_OPEN_RETRIES, OUTPUT_STREAM_OPEN_RETRY_MS, SINK_QUEUE_BLOCKS};
use crate::dsp::ramp::GainRamp;
use crate::error::SinkError;
use crate::settings::DeviceSettings;

fn open_output_stream_with_retry() -> Result<OutputStream, SinkError> {
    let mut last = String::new();
    for attempt in 1..=OUTPUT_STREAM_OPEN_RETRIES {
        match OutputStreamBuilder::open_default_stream() {
            Ok(stream) => return Ok(stream),
            Err(err) => {
                last = err.to_string();
                if attempt == OUTPUT_STREAM_OPEN_RETRIES {
                    error!(
                        "failed to open default output stream after {} attempts: {}",
                        OUTPUT_STREAM_OPEN_RETRIES, err
                    );
                    break;
                }
                warn!(
                    "open_default_stream attempt {}/{} failed: {}",
                    attempt, OUTPUT_STREAM_OPEN_RETRIES, err
                );
                thread::sleep(Duration::from_millis(OUTPUT_STREAM_OPEN_RETRY_MS));
            }
        }
    }
    Err(SinkError::Unavailable(last))
}

/// Queues rendered blocks on a rodio sink, keeping a few frames ahead.
pub struct RodioSink {
    name: String,
    // Dropping the stream closes the endpoint; it must outlive `sink`.
    _stream: OutputStream,
    sink: rodio::Sink,
    format: SinkFormat,
    scratch: Vec<f32>,
}

impl RodioSink {
    pub fn open(name: impl Into<String>, format: SinkFormat) -> Result<Self, SinkError> {
        let stream = open_output_stream_with_retry()?;
        let sink = rodio::Sink::connect_new(stream.mixer());
        sink.play();
        Ok(Self {
            name: name.into(),
            _stream: stream,
            sink,
            format,
            scratch: Vec::new(),
        })
    }
}

impl Sink for RodioSink {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_data_needed(&mut self) -> DataNeeded {
        let queued = self.sink.len();
        DataNeeded::Frames(SINK_QUEUE_BLOCKS.saturating_sub(queued) as u32)
    }

    fn consume(&mut self, buffer: &AudioBuffer, ramp: GainRamp) {
        let channels = buffer.num_channels();
        let frames = buffer.max_frames();
        self.scratch.resize(frames * channels, 0.0);
        buffer.write_interleaved(&mut self.scratch);
        for (frame, samples) in self.scratch.chunks_mut(channels.max(1)).enumerate() {
            let gain = ramp.at(frame, frames);
            samples.iter_mut().for_each(|s| *s *= gain);
        }
        let data = std::mem::take(&mut self.scratch);
        self.sink.append(SamplesBuffer::new(
            channels as u16,
            self.format.sample_rate,
            data,
        ));
    }

    fn reset(&mut self) -> Result<(), SinkError> {
        self.sink.clear();
        self.sink.play();
        Ok(())
    }

    fn term(&mut self) {
        self.sink.stop();
    }
}

/// Opens a [`RodioSink`] on the default output for every real device.
#[derive(Debug, Default, Clone, Copy)]
pub struct RodioSinkFactory;

impl SinkFactory for RodioSinkFactory {
    fn create_sink(
        &mut self,
        device: &DeviceSettings,
        format: SinkFormat,
    ) -> Result<Box<dyn Sink>, SinkError> {
        Ok(Box::new(RodioSink::open(device.name.clone(), format)?))
    }
}
