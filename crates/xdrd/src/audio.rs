//! Audio sinks: WAV capture and the realtime output device.
//!
//! The realtime path is a lock-free ring the pipeline thread pushes into
//! and the host audio callback drains; when the ring runs dry the callback
//! plays silence, and when it overflows the pipeline drops the excess
//! rather than block. The WAV sink writes 16-bit PCM at 32 kHz stereo and
//! finalizes the RIFF header on shutdown.

use std::fs::File;
use std::io::BufWriter;
use std::path::Path;
use std::sync::Arc;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use crossbeam::queue::ArrayQueue;
use tracing::{debug, info, warn};

use fmtuner::error::{Error, Result};
use fmtuner::AUDIO_RATE;

/// Realtime ring capacity in interleaved samples (about one second).
const RING_CAPACITY: usize = AUDIO_RATE as usize * 2;

/// Names of the available output devices.
pub fn list_audio_devices() -> Vec<String> {
    let host = cpal::default_host();
    let mut names = Vec::new();
    if let Ok(devices) = host.output_devices() {
        for device in devices {
            if let Ok(name) = device.name() {
                names.push(name);
            }
        }
    }
    names
}

fn find_output_device(selector: Option<&str>) -> Result<cpal::Device> {
    let host = cpal::default_host();
    match selector {
        None | Some("") => host
            .default_output_device()
            .ok_or_else(|| Error::audio("device", "no default output device")),
        Some(name) => {
            let devices = host
                .output_devices()
                .map_err(|e| Error::audio("device", format!("cannot enumerate: {}", e)))?;
            for device in devices {
                if device
                    .name()
                    .map(|n| n.contains(name))
                    .unwrap_or(false)
                {
                    return Ok(device);
                }
            }
            Err(Error::audio("device", format!("'{}' not found", name)))
        }
    }
}

/// Stereo audio output with optional WAV capture and speaker playback.
pub struct AudioOutput {
    wav: Option<hound::WavWriter<BufWriter<File>>>,
    ring: Option<Arc<ArrayQueue<f32>>>,
    stream: Option<cpal::Stream>,
    volume: f32,
}

impl AudioOutput {
    pub fn new() -> Self {
        Self {
            wav: None,
            ring: None,
            stream: None,
            volume: 1.0,
        }
    }

    /// Open the configured sinks. Either sink failing is fatal for startup.
    pub fn init(
        &mut self,
        enable_speaker: bool,
        wav_path: Option<&Path>,
        device_selector: Option<&str>,
    ) -> Result<()> {
        if let Some(path) = wav_path {
            let spec = hound::WavSpec {
                channels: 2,
                sample_rate: AUDIO_RATE,
                bits_per_sample: 16,
                sample_format: hound::SampleFormat::Int,
            };
            let writer = hound::WavWriter::create(path, spec)
                .map_err(|e| Error::audio("wav", format!("cannot open {}: {}", path.display(), e)))?;
            info!("WAV capture to {}", path.display());
            self.wav = Some(writer);
        }

        if enable_speaker {
            let device = find_output_device(device_selector)?;
            debug!(
                "audio output device: {}",
                device.name().unwrap_or_else(|_| "<unnamed>".into())
            );
            let config = cpal::StreamConfig {
                channels: 2,
                sample_rate: cpal::SampleRate(AUDIO_RATE),
                buffer_size: cpal::BufferSize::Default,
            };
            let ring = Arc::new(ArrayQueue::<f32>::new(RING_CAPACITY));
            let callback_ring = Arc::clone(&ring);
            let stream = device
                .build_output_stream(
                    &config,
                    move |data: &mut [f32], _| {
                        for sample in data.iter_mut() {
                            *sample = callback_ring.pop().unwrap_or(0.0);
                        }
                    },
                    |e| warn!("audio stream error: {}", e),
                    None,
                )
                .map_err(|e| Error::audio("stream", format!("cannot open: {}", e)))?;
            stream
                .play()
                .map_err(|e| Error::audio("stream", format!("cannot start: {}", e)))?;
            self.ring = Some(ring);
            self.stream = Some(stream);
        }
        Ok(())
    }

    /// Output volume, 0..=100.
    pub fn set_volume_percent(&mut self, percent: i32) {
        self.volume = percent.clamp(0, 100) as f32 / 100.0;
    }

    /// Write one block of stereo samples to every active sink.
    pub fn write(&mut self, left: &[f32], right: &[f32]) {
        let n = left.len().min(right.len());
        for i in 0..n {
            let l = (left[i] * self.volume).clamp(-1.0, 1.0);
            let r = (right[i] * self.volume).clamp(-1.0, 1.0);

            if let Some(wav) = self.wav.as_mut() {
                let _ = wav.write_sample((l * 32767.0) as i16);
                let _ = wav.write_sample((r * 32767.0) as i16);
            }
            if let Some(ring) = self.ring.as_ref() {
                // Dropping on overflow beats blocking the pipeline
                let _ = ring.push(l);
                let _ = ring.push(r);
            }
        }
    }

    /// Drop all queued realtime samples (used around retunes and stops).
    pub fn clear_realtime_queue(&self) {
        if let Some(ring) = self.ring.as_ref() {
            while ring.pop().is_some() {}
        }
    }

    /// Finalize the WAV header and stop the stream.
    pub fn shutdown(&mut self) {
        if let Some(wav) = self.wav.take() {
            if let Err(e) = wav.finalize() {
                warn!("WAV finalize failed: {}", e);
            }
        }
        self.stream = None;
        self.ring = None;
    }
}

impl Default for AudioOutput {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for AudioOutput {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wav_sink_writes_playable_file() {
        let dir = std::env::temp_dir();
        let path = dir.join("xdrd_audio_test.wav");
        let _ = std::fs::remove_file(&path);

        let mut out = AudioOutput::new();
        out.init(false, Some(&path), None).unwrap();
        let left: Vec<f32> = (0..3200)
            .map(|i| (2.0 * std::f32::consts::PI * 440.0 * i as f32 / 32_000.0).sin() * 0.5)
            .collect();
        let right = left.clone();
        out.write(&left, &right);
        out.shutdown();

        let reader = hound::WavReader::open(&path).unwrap();
        let spec = reader.spec();
        assert_eq!(spec.channels, 2);
        assert_eq!(spec.sample_rate, 32_000);
        assert_eq!(spec.bits_per_sample, 16);
        assert_eq!(reader.len(), 3200 * 2);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_volume_scales_wav_samples() {
        let dir = std::env::temp_dir();
        let path = dir.join("xdrd_audio_volume_test.wav");
        let _ = std::fs::remove_file(&path);

        let mut out = AudioOutput::new();
        out.init(false, Some(&path), None).unwrap();
        out.set_volume_percent(50);
        out.write(&[1.0f32; 16], &[1.0f32; 16]);
        out.shutdown();

        let mut reader = hound::WavReader::open(&path).unwrap();
        let first: i16 = reader.samples::<i16>().next().unwrap().unwrap();
        assert!((first - 16383).abs() <= 1, "sample {}", first);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_write_without_sinks_is_harmless() {
        let mut out = AudioOutput::new();
        out.write(&[0.1f32; 8], &[0.1f32; 8]);
        out.clear_realtime_queue();
    }
}
