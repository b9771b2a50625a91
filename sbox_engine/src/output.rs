//! Live playback on the default output device.
use crate::commands::EngineCommand;
use crate::engine::Engine;
use crate::transport::TransportHandle;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use crossbeam_channel::Sender;

/// Keeps the stream alive; dropping it stops audio.
pub struct LiveOutput {
    _stream: cpal::Stream,
    pub commands: Sender<EngineCommand>,
    pub transport: TransportHandle,
    pub sample_rate: u32,
}

impl LiveOutput {
    /// Initializes `engine` at the device rate and moves it onto the audio
    /// thread. Control it afterwards through `commands`.
    pub fn start(mut engine: Engine) -> Result<Self, anyhow::Error> {
        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .ok_or(anyhow::anyhow!("No output device available"))?;
        let config = device.default_output_config()?;

        let sample_rate = config.sample_rate();
        let channels = config.channels() as usize;
        let sample_format = config.sample_format();
        let stream_config: cpal::StreamConfig = config.into();
        log::info!("[Output] Using config: {:?}", stream_config);

        let max_frames = engine.config().max_block_size;
        if !engine.initialize(sample_rate as f64, max_frames) {
            anyhow::bail!("Engine rejected sample rate {}", sample_rate);
        }
        let commands = engine.command_sender();
        let transport = engine.transport_handle();

        let mut left = vec![0.0f32; max_frames];
        let mut right = vec![0.0f32; max_frames];

        let err_fn = |err: cpal::StreamError| {
            let s = err.to_string();
            // Under/overruns are routine, keep the log quiet
            if !s.contains("underrun") && !s.contains("overrun") {
                log::error!("[Output] Stream error: {}", s);
            }
        };

        let stream = match sample_format {
            cpal::SampleFormat::F32 => device.build_output_stream(
                &stream_config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    for frame_block in data.chunks_mut(max_frames * channels) {
                        let frames = frame_block.len() / channels;
                        engine.process(&mut left[..frames], &mut right[..frames]);

                        for (i, frame) in frame_block.chunks_mut(channels).enumerate() {
                            match frame {
                                [mono] => *mono = (left[i] + right[i]) * 0.5,
                                [l, r, rest @ ..] => {
                                    *l = left[i];
                                    *r = right[i];
                                    rest.fill(0.0);
                                }
                                [] => {}
                            }
                        }
                    }
                },
                err_fn,
                None,
            )?,
            _ => return Err(anyhow::anyhow!("Unsupported sample format")),
        };

        stream.play()?;

        Ok(Self {
            _stream: stream,
            commands,
            transport,
            sample_rate,
        })
    }
}
