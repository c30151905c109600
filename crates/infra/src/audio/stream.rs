//! Live insert: capture, convolve, play back
//!
//! The input callback copies each captured buffer into a pooled `Vec` and
//! forwards it over a bounded crossbeam channel. The output callback owns the
//! engine: it drains the channel into a FIFO, hands the emptied buffers back
//! to the pool, pulls exactly one device buffer worth of samples (silence on
//! underrun) and convolves them in place of playback.

use crate::audio::cpal_backend::{
    to_cpal_config, BackendError, CpalHost, Direction, Result, StreamRequest,
};
use cpal::traits::{DeviceTrait, StreamTrait};
use cpal::Stream;
use crossbeam::channel::{bounded, Receiver, Sender};
use impulse_core::domain::audio::StreamFormat;
use impulse_core::domain::engine::EngineCoordinator;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{error, info, warn};

/// Buffers in flight between the input and output callbacks
const CHANNEL_DEPTH: usize = 8;

/// Preallocated capture buffers, enough to refill a full channel twice
fn buffer_pool(block_samples: usize) -> (Sender<Vec<f32>>, Receiver<Vec<f32>>) {
    let (recycle, pool) = bounded(CHANNEL_DEPTH * 2);
    for _ in 0..CHANNEL_DEPTH * 2 {
        let _ = recycle.try_send(Vec::with_capacity(block_samples));
    }
    (recycle, pool)
}

/// Interleaved sample FIFO between mismatched callback sizes
pub struct SampleFifo {
    buffer: Vec<f32>,
    capacity: usize,
    write_pos: usize,
    read_pos: usize,
}

impl SampleFifo {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buffer: vec![0.0; capacity],
            capacity,
            write_pos: 0,
            read_pos: 0,
        }
    }

    /// Append samples; returns how many fit
    pub fn write(&mut self, samples: &[f32]) -> usize {
        let to_write = samples.len().min(self.available_write());

        for (i, &sample) in samples[..to_write].iter().enumerate() {
            self.buffer[(self.write_pos + i) % self.capacity] = sample;
        }

        self.write_pos = (self.write_pos + to_write) % self.capacity;
        to_write
    }

    /// Fill `out` from the front of the queue; returns how many were read
    pub fn read(&mut self, out: &mut [f32]) -> usize {
        let to_read = out.len().min(self.available_read());

        for (i, slot) in out[..to_read].iter_mut().enumerate() {
            *slot = self.buffer[(self.read_pos + i) % self.capacity];
        }

        self.read_pos = (self.read_pos + to_read) % self.capacity;
        to_read
    }

    pub fn available_write(&self) -> usize {
        self.capacity - self.available_read() - 1
    }

    pub fn available_read(&self) -> usize {
        (self.write_pos + self.capacity - self.read_pos) % self.capacity
    }

    pub fn clear(&mut self) {
        self.buffer.fill(0.0);
        self.write_pos = 0;
        self.read_pos = 0;
    }
}

/// Counters shared with the audio callbacks
#[derive(Debug, Default)]
pub struct InsertStats {
    dropped_buffers: AtomicU64,
    underruns: AtomicU64,
    engine_errors: AtomicU64,
}

impl InsertStats {
    pub fn dropped_buffers(&self) -> u64 {
        self.dropped_buffers.load(Ordering::Relaxed)
    }

    pub fn underruns(&self) -> u64 {
        self.underruns.load(Ordering::Relaxed)
    }

    pub fn engine_errors(&self) -> u64 {
        self.engine_errors.load(Ordering::Relaxed)
    }
}

/// Input-side state moved into the capture callback
struct Capture {
    sender: Sender<Vec<f32>>,
    pool: Receiver<Vec<f32>>,
    recycle: Sender<Vec<f32>>,
    stats: Arc<InsertStats>,
}

impl Capture {
    fn push(&mut self, data: &[f32]) {
        // Allocates only when the playback side has fallen behind the pool
        let mut buffer = self.pool.try_recv().unwrap_or_default();
        buffer.clear();
        buffer.extend_from_slice(data);

        if let Err(e) = self.sender.try_send(buffer) {
            self.stats.dropped_buffers.fetch_add(1, Ordering::Relaxed);
            let _ = self.recycle.try_send(e.into_inner());
        }
    }
}

/// Output-side state moved into the playback callback
struct Playback {
    engine: EngineCoordinator,
    receiver: Receiver<Vec<f32>>,
    recycle: Sender<Vec<f32>>,
    fifo: SampleFifo,
    scratch: Vec<f32>,
    channels: usize,
    stats: Arc<InsertStats>,
}

impl Playback {
    fn render(&mut self, data: &mut [f32]) {
        while let Ok(buffer) = self.receiver.try_recv() {
            if self.fifo.write(&buffer) < buffer.len() {
                self.stats.dropped_buffers.fetch_add(1, Ordering::Relaxed);
            }
            let _ = self.recycle.try_send(buffer);
        }

        if self.scratch.len() < data.len() {
            self.scratch.resize(data.len(), 0.0);
        }
        let input = &mut self.scratch[..data.len()];
        let read = self.fifo.read(input);
        if read < input.len() {
            input[read..].fill(0.0);
            self.stats.underruns.fetch_add(1, Ordering::Relaxed);
        }

        if let Err(e) = self.engine.process_interleaved(input, data, self.channels) {
            if self.stats.engine_errors.fetch_add(1, Ordering::Relaxed) == 0 {
                error!("Convolution failed, playing silence: {}", e);
            }
            data.fill(0.0);
        }
    }
}

/// A running capture-to-playback insert
///
/// Dropping it stops both streams.
pub struct LiveInsert {
    _input: Stream,
    _output: Stream,
    format: StreamFormat,
    stats: Arc<InsertStats>,
}

impl LiveInsert {
    /// Negotiate the output device, configure the engine and start both streams
    pub fn start(
        host: &CpalHost,
        mut engine: EngineCoordinator,
        request: &StreamRequest,
    ) -> Result<Self> {
        let output_device = host.find_device(request.output_device.as_deref(), Direction::Output)?;
        let input_device = host.find_device(request.input_device.as_deref(), Direction::Input)?;

        let format = host.negotiate_format(&output_device, Direction::Output, request)?;
        engine.negotiate(&format)?;

        let cpal_config = to_cpal_config(&format);
        let channels = usize::from(format.channels);
        let block_samples = format.max_block_size * channels;
        let (sender, receiver) = bounded::<Vec<f32>>(CHANNEL_DEPTH);
        let (recycle, pool) = buffer_pool(block_samples);
        let stats = Arc::new(InsertStats::default());

        let mut capture = Capture {
            sender,
            pool,
            recycle: recycle.clone(),
            stats: stats.clone(),
        };
        let input = input_device
            .build_input_stream(
                &cpal_config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| capture.push(data),
                |err| error!("Input stream error: {}", err),
                None,
            )
            .map_err(|e| BackendError::StreamError(format!("Failed to build input stream: {}", e)))?;

        let mut playback = Playback {
            engine,
            receiver,
            recycle,
            fifo: SampleFifo::with_capacity(block_samples * CHANNEL_DEPTH * 2 + 1),
            scratch: vec![0.0; block_samples],
            channels,
            stats: stats.clone(),
        };

        let output = output_device
            .build_output_stream(
                &cpal_config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| playback.render(data),
                |err| error!("Output stream error: {}", err),
                None,
            )
            .map_err(|e| BackendError::StreamError(format!("Failed to build output stream: {}", e)))?;

        input
            .play()
            .map_err(|e| BackendError::StreamError(format!("Failed to start input stream: {}", e)))?;
        output
            .play()
            .map_err(|e| BackendError::StreamError(format!("Failed to start output stream: {}", e)))?;

        info!(
            rate = format.sample_rate.hz(),
            channels,
            block_size = format.max_block_size,
            "Live insert running"
        );

        Ok(Self {
            _input: input,
            _output: output,
            format,
            stats,
        })
    }

    pub fn format(&self) -> &StreamFormat {
        &self.format
    }

    pub fn stats(&self) -> &InsertStats {
        &self.stats
    }
}

impl Drop for LiveInsert {
    fn drop(&mut self) {
        let underruns = self.stats.underruns();
        let dropped = self.stats.dropped_buffers();
        if underruns > 0 || dropped > 0 {
            warn!(underruns, dropped, "Live insert stopped with glitches");
        } else {
            info!("Live insert stopped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use impulse_core::domain::audio::SampleRate;
    use impulse_core::domain::config::ChannelConfig;
    use impulse_core::domain::impulse::ImpulseResponse;
    use impulse_core::domain::plan_cache::PlanCache;

    #[test]
    fn test_fifo() {
        let mut fifo = SampleFifo::with_capacity(16);

        let input = vec![1.0, 2.0, 3.0, 4.0];
        let mut output = vec![0.0; 4];

        assert_eq!(fifo.write(&input), 4);
        assert_eq!(fifo.available_read(), 4);
        assert_eq!(fifo.read(&mut output), 4);
        assert_eq!(output, input);
    }

    #[test]
    fn test_fifo_wraparound() {
        let mut fifo = SampleFifo::with_capacity(8);

        let input1 = vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
        assert_eq!(fifo.write(&input1), 6);

        let mut output1 = vec![0.0; 4];
        assert_eq!(fifo.read(&mut output1), 4);
        assert_eq!(output1, vec![1.0, 2.0, 3.0, 4.0]);

        // Only 5 slots are free
        let input2 = vec![7.0, 8.0, 9.0, 10.0, 11.0, 12.0];
        assert_eq!(fifo.write(&input2), 5);

        let mut output2 = vec![0.0; 10];
        assert_eq!(fifo.read(&mut output2), 7);
        assert_eq!(output2[..7], vec![5.0, 6.0, 7.0, 8.0, 9.0, 10.0, 11.0]);

        fifo.clear();
        assert_eq!(fifo.available_read(), 0);
    }

    fn playback(channels: usize) -> (Playback, Sender<Vec<f32>>) {
        let configs = vec![ChannelConfig::filtered(
            ImpulseResponse::new(vec![0.0, 1.0], 48000),
            0.0,
        )];
        let mut engine = EngineCoordinator::new(configs, PlanCache::in_memory()).unwrap();
        engine
            .negotiate(&StreamFormat::new(SampleRate::Hz48000, channels as u16, 4))
            .unwrap();

        let (sender, receiver) = bounded(CHANNEL_DEPTH);
        let (recycle, _pool) = bounded(CHANNEL_DEPTH * 2);
        let playback = Playback {
            engine,
            receiver,
            recycle,
            fifo: SampleFifo::with_capacity(64),
            scratch: Vec::new(),
            channels,
            stats: Arc::new(InsertStats::default()),
        };
        (playback, sender)
    }

    #[test]
    fn test_playback_convolves_captured_audio() {
        let (mut playback, sender) = playback(2);
        // Left is delayed by one frame, right passes through
        sender.send(vec![1.0, 0.1, 0.5, 0.2, 0.25, 0.3]).unwrap();
        sender.send(vec![0.0, 0.4]).unwrap();

        let mut data = vec![0.0f32; 8];
        playback.render(&mut data);

        let expected = [0.0, 0.1, 1.0, 0.2, 0.5, 0.3, 0.25, 0.4];
        for (a, e) in data.iter().zip(expected) {
            assert!((a - e).abs() < 1e-5, "got {a}, expected {e}");
        }
        assert_eq!(playback.stats.underruns(), 0);
    }

    #[test]
    fn test_playback_underrun_plays_silence() {
        let (mut playback, _sender) = playback(1);
        let mut data = vec![9.0f32; 4];
        playback.render(&mut data);

        assert!(data.iter().all(|&s| s.abs() < 1e-6));
        assert_eq!(playback.stats.underruns(), 1);
    }

    #[test]
    fn test_playback_counts_engine_errors() {
        let (mut playback, _sender) = playback(1);
        // Odd interleaved length for two channels
        playback.channels = 2;
        let mut data = vec![1.0f32; 3];
        playback.render(&mut data);

        assert_eq!(data, vec![0.0; 3]);
        assert_eq!(playback.stats.engine_errors(), 1);
    }

    #[test]
    fn test_capture_buffers_return_to_pool() {
        let (mut playback, _) = playback(1);
        let (sender, receiver) = bounded(CHANNEL_DEPTH);
        let (recycle, pool) = buffer_pool(4);
        playback.receiver = receiver;
        playback.recycle = recycle.clone();
        let mut capture = Capture {
            sender,
            pool: pool.clone(),
            recycle,
            stats: playback.stats.clone(),
        };

        capture.push(&[1.0, 2.0, 3.0, 4.0]);
        capture.push(&[5.0, 6.0]);
        assert_eq!(pool.len(), CHANNEL_DEPTH * 2 - 2);

        let mut data = vec![0.0f32; 6];
        playback.render(&mut data);
        assert_eq!(pool.len(), CHANNEL_DEPTH * 2);
        assert!((data[1] - 1.0).abs() < 1e-5);

        // Recycled buffers keep their allocation
        while let Ok(buffer) = pool.try_recv() {
            assert!(buffer.capacity() >= 4);
        }
    }

    #[test]
    fn test_capture_overflow_recycles_buffer() {
        let (sender, _receiver) = bounded(1);
        let (recycle, pool) = buffer_pool(2);
        let stats = Arc::new(InsertStats::default());
        let mut capture = Capture {
            sender,
            pool: pool.clone(),
            recycle,
            stats: stats.clone(),
        };

        capture.push(&[1.0, 2.0]);
        capture.push(&[3.0, 4.0]);

        assert_eq!(stats.dropped_buffers(), 1);
        // One buffer waits in the channel, the rejected one is back in the pool
        assert_eq!(pool.len(), CHANNEL_DEPTH * 2 - 1);
    }
}
