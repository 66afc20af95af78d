//! Blocking block playback on cpal output streams
//!
//! cpal is callback driven: the device pulls samples when it wants them.
//! [`CpalOutputStream::write`] hands a whole block to the callback over a
//! channel and blocks until the callback reports it has been consumed.

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Stream, StreamConfig as CpalStreamConfig};
use crossbeam::channel::{bounded, Receiver, Sender};
use insomnia_core::domain::audio::{
    AudioError, AudioSink, DeviceId, OutputStream, Result, StreamRequest,
};
use std::time::Duration;
use tracing::{debug, error, info};

/// Extra time allowed on top of a block's duration before a write is
/// declared stuck
const DEFAULT_WRITE_MARGIN: Duration = Duration::from_secs(2);

/// Spread interleaved `source_channels` audio across `device_channels`.
///
/// Mono is copied to every device channel; matching layouts pass through.
fn interleave(samples: &[f32], source_channels: usize, device_channels: usize) -> Result<Vec<f32>> {
    if source_channels == device_channels {
        return Ok(samples.to_vec());
    }
    if source_channels != 1 {
        return Err(AudioError::UnsupportedConfiguration(format!(
            "cannot map {} channels onto {}",
            source_channels, device_channels
        )));
    }

    Ok(samples
        .iter()
        .flat_map(|&s| std::iter::repeat(s).take(device_channels))
        .collect())
}

/// Realtime side of a [`CpalOutputStream`]
///
/// Copies queued blocks into device buffers and pads with silence. A block
/// is reported done one callback after its last samples were handed over,
/// once the device has asked for the buffer that follows them.
struct BlockFeeder {
    blocks: Receiver<Vec<f32>>,
    done: Sender<()>,
    pending: Option<(Vec<f32>, usize)>,
    draining: bool,
}

impl BlockFeeder {
    fn new(blocks: Receiver<Vec<f32>>, done: Sender<()>) -> Self {
        Self {
            blocks,
            done,
            pending: None,
            draining: false,
        }
    }

    fn fill(&mut self, data: &mut [f32]) {
        if self.draining {
            self.draining = false;
            let _ = self.done.try_send(());
        }

        let mut written = 0;

        while written < data.len() {
            if self.pending.is_none() {
                match self.blocks.try_recv() {
                    Ok(block) => self.pending = Some((block, 0)),
                    Err(_) => break,
                }
            }

            if let Some((block, pos)) = self.pending.as_mut() {
                let n = (data.len() - written).min(block.len() - *pos);
                data[written..written + n].copy_from_slice(&block[*pos..*pos + n]);
                written += n;
                *pos += n;

                if *pos >= block.len() {
                    self.pending = None;
                    self.draining = true;
                }
            }
        }

        data[written..].fill(0.0);
    }
}

fn find_output_device(host: &cpal::Host, id: Option<&DeviceId>) -> Result<cpal::Device> {
    match id {
        None => host
            .default_output_device()
            .ok_or_else(|| AudioError::DeviceNotFound("No default output device".to_string())),
        Some(id) => {
            #[allow(deprecated)]
            let device = host
                .output_devices()
                .map_err(|e| AudioError::OsError(e.to_string()))?
                .find(|d| d.name().ok().as_deref().map(str::trim) == Some(id.as_str()))
                .ok_or_else(|| AudioError::DeviceNotFound(id.as_str().to_string()));
            device
        }
    }
}

/// One playback stream on a cpal device
pub struct CpalOutputStream {
    stream: Option<Stream>,
    device_name: String,
    source_channels: usize,
    device_channels: usize,
    sample_rate: u32,
    write_margin: Duration,
    block_sender: Sender<Vec<f32>>,
    done_receiver: Receiver<()>,
    error_receiver: Receiver<String>,
}

impl CpalOutputStream {
    /// Open and start a stream for `request`
    pub fn open(request: &StreamRequest, write_margin: Duration) -> Result<Self> {
        let host = cpal::default_host();
        let device = find_output_device(&host, request.device.as_ref())?;

        #[allow(deprecated)]
        let device_name = device
            .name()
            .map(|n| n.trim().to_string())
            .unwrap_or_else(|_| "Unknown Device".to_string());

        let default_config = device
            .default_output_config()
            .map_err(|e| AudioError::InvalidConfiguration(e.to_string()))?;

        let device_channels = default_config.channels().max(request.channels.count());
        let sample_rate = request.sample_rate.hz();

        info!(
            device = %device_name,
            sample_rate,
            channels = device_channels,
            "Opening output stream"
        );

        let cpal_config = CpalStreamConfig {
            channels: device_channels,
            sample_rate,
            buffer_size: cpal::BufferSize::Default,
        };

        let (block_sender, block_receiver) = bounded::<Vec<f32>>(1);
        let (done_sender, done_receiver) = bounded::<()>(1);
        let (error_sender, error_receiver) = bounded::<String>(4);

        let mut feeder = BlockFeeder::new(block_receiver, done_sender);

        let stream = device
            .build_output_stream(
                &cpal_config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| feeder.fill(data),
                move |err| {
                    error!("Output stream error: {}", err);
                    let _ = error_sender.try_send(err.to_string());
                },
                None,
            )
            .map_err(|e| AudioError::StreamError(format!("Failed to build stream: {}", e)))?;

        stream
            .play()
            .map_err(|e| AudioError::StreamError(format!("Failed to start stream: {}", e)))?;

        Ok(Self {
            stream: Some(stream),
            device_name,
            source_channels: request.channels.count() as usize,
            device_channels: device_channels as usize,
            sample_rate,
            write_margin,
            block_sender,
            done_receiver,
            error_receiver,
        })
    }

    pub fn device_name(&self) -> &str {
        &self.device_name
    }
}

impl OutputStream for CpalOutputStream {
    fn write(&mut self, samples: &[f32]) -> Result<()> {
        if self.stream.is_none() {
            return Err(AudioError::StreamError("Stream already closed".to_string()));
        }
        if samples.is_empty() {
            return Ok(());
        }

        let block = interleave(samples, self.source_channels, self.device_channels)?;
        let frames = samples.len() / self.source_channels.max(1);
        let deadline =
            Duration::from_secs_f64(frames as f64 / self.sample_rate as f64) + self.write_margin;

        self.block_sender
            .send(block)
            .map_err(|_| AudioError::StreamError("Output callback is gone".to_string()))?;

        crossbeam::select! {
            recv(self.done_receiver) -> done => done
                .map_err(|_| AudioError::StreamError("Output callback is gone".to_string())),
            recv(self.error_receiver) -> err => Err(AudioError::StreamError(
                err.unwrap_or_else(|_| "unknown stream error".to_string()),
            )),
            default(deadline) => Err(AudioError::StreamError(format!(
                "Playback on {} did not finish within {:?}",
                self.device_name, deadline
            ))),
        }
    }

    fn close(&mut self) -> Result<()> {
        if let Some(stream) = self.stream.take() {
            let paused = stream
                .pause()
                .map_err(|e| AudioError::StreamError(format!("Failed to stop stream: {}", e)));
            drop(stream);
            debug!(device = %self.device_name, "Released output stream");
            paused?;
        }
        Ok(())
    }
}

impl Drop for CpalOutputStream {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            debug!(error = %e, "Error while releasing output stream");
        }
    }
}

/// Opens cpal playback streams, one per playback
pub struct CpalSink {
    write_margin: Duration,
}

impl Default for CpalSink {
    fn default() -> Self {
        Self {
            write_margin: DEFAULT_WRITE_MARGIN,
        }
    }
}

impl CpalSink {
    pub fn new(write_margin: Duration) -> Self {
        Self { write_margin }
    }
}

impl AudioSink for CpalSink {
    fn open(&self, request: &StreamRequest) -> Result<Box<dyn OutputStream>> {
        let stream = CpalOutputStream::open(request, self.write_margin)?;
        Ok(Box::new(stream))
    }
}
