//! Offline bounce of a project to WAV files.
//! Renders through the same engine path as playback, just without a device.

use crate::engine::Engine;
use hound::{SampleFormat, WavSpec, WavWriter};
use sbox_shared::NUM_VOICES;
use std::path::{Path, PathBuf};

/// Sample format written to the WAV file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportBitDepth {
    Int16,
    Int24,
    Float32,
}

impl ExportBitDepth {
    pub fn bits(self) -> u16 {
        match self {
            ExportBitDepth::Int16 => 16,
            ExportBitDepth::Int24 => 24,
            ExportBitDepth::Float32 => 32,
        }
    }

    fn sample_format(self) -> SampleFormat {
        match self {
            ExportBitDepth::Float32 => SampleFormat::Float,
            _ => SampleFormat::Int,
        }
    }
}

/// Export configuration. `sample_rate` must match the engine the audio is
/// rendered with.
#[derive(Debug, Clone)]
pub struct ExportConfig {
    pub sample_rate: u32,
    pub block_size: usize,
    pub bit_depth: ExportBitDepth,
    pub normalize: bool,
    pub dither: bool,
    pub tail_seconds: f64, // Rendered after the last loop so releases ring out
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            sample_rate: 48000,
            block_size: 512,
            bit_depth: ExportBitDepth::Int24,
            normalize: false,
            dither: true,
            tail_seconds: 1.0,
        }
    }
}

/// Plays `loops` passes of the project loop from the top and returns
/// interleaved stereo. The engine must already be initialized at
/// `config.sample_rate`; it is left stopped at beat 0.
pub fn render_project(
    engine: &mut Engine,
    loops: u32,
    config: &ExportConfig,
) -> Result<Vec<f32>, anyhow::Error> {
    if !engine.is_initialized() {
        anyhow::bail!("Engine must be initialized before rendering");
    }
    let sample_rate = engine.sample_rate();
    if sample_rate != config.sample_rate as f64 {
        anyhow::bail!(
            "Engine runs at {} Hz but the export is set to {} Hz",
            sample_rate,
            config.sample_rate
        );
    }
    let tempo = engine.project().tempo;
    if !(tempo > 0.0) {
        anyhow::bail!("Cannot render at tempo {}", tempo);
    }

    let beats = engine.loop_end_beats() * loops as f64;
    let body_frames = (beats * 60.0 / tempo * sample_rate).round() as usize;
    let tail_frames = (config.tail_seconds.max(0.0) * sample_rate).round() as usize;
    let block = config.block_size.max(1);

    let mut out = Vec::with_capacity((body_frames + tail_frames) * 2);
    let mut left = vec![0.0f32; block];
    let mut right = vec![0.0f32; block];

    engine.stop();
    engine.play();
    render_frames(engine, body_frames, &mut left, &mut right, &mut out);
    // Stop releases held notes; the tail captures their decay.
    engine.stop();
    render_frames(engine, tail_frames, &mut left, &mut right, &mut out);

    log::info!(
        "[Export] Rendered {} loops ({:.2} beats, {} frames + {} tail)",
        loops,
        beats,
        body_frames,
        tail_frames
    );
    Ok(out)
}

fn render_frames(
    engine: &mut Engine,
    frames: usize,
    left: &mut [f32],
    right: &mut [f32],
    out: &mut Vec<f32>,
) {
    let mut remaining = frames;
    while remaining > 0 {
        let n = remaining.min(left.len());
        engine.process(&mut left[..n], &mut right[..n]);
        for (&l, &r) in left[..n].iter().zip(&right[..n]) {
            out.push(l);
            out.push(r);
        }
        remaining -= n;
    }
}

/// Renders each bound voice on its own by soloing it in turn. Mute and solo
/// flags are restored afterwards.
pub fn render_stems(
    engine: &mut Engine,
    loops: u32,
    config: &ExportConfig,
) -> Result<Vec<(String, Vec<f32>)>, anyhow::Error> {
    let saved: Vec<(bool, bool)> = engine
        .project()
        .voices
        .iter()
        .map(|v| (v.mute, v.solo))
        .collect();
    let mut stems = Vec::new();

    for voice in 0..NUM_VOICES {
        if engine.synth(voice).is_none() {
            continue;
        }
        for (i, v) in engine.project_mut().voices.iter_mut().enumerate() {
            v.solo = i == voice;
            v.mute = false;
        }
        let result = render_project(engine, loops, config);
        let name = engine.project().voices[voice].name.clone();
        match result {
            Ok(data) => stems.push((name, data)),
            Err(e) => {
                restore_flags(engine, &saved);
                return Err(e);
            }
        }
    }

    restore_flags(engine, &saved);
    Ok(stems)
}

fn restore_flags(engine: &mut Engine, saved: &[(bool, bool)]) {
    for (v, &(mute, solo)) in engine.project_mut().voices.iter_mut().zip(saved) {
        v.mute = mute;
        v.solo = solo;
    }
}

/// Converts float frames to integer samples with optional TPDF dither.
/// Each channel draws from its own noise source.
struct Quantizer {
    full_scale: f32,
    lsb: f32,
    dither: Option<[u32; 2]>,
}

impl Quantizer {
    fn new(bits: u16, dither: bool) -> Self {
        let full_scale = (1u32 << (bits - 1)) as f32;
        Self {
            full_scale: full_scale - 1.0,
            lsb: 1.0 / full_scale,
            dither: dither.then_some([0x9E37_79B9, 0x85EB_CA6B]),
        }
    }

    fn quantize(&mut self, channel: usize, sample: f32) -> i32 {
        let noise = match self.dither.as_mut() {
            // Sum of two uniform draws gives a triangular distribution of +/-1 LSB.
            Some(states) => {
                let state = &mut states[channel & 1];
                (uniform(state) + uniform(state) - 1.0) * self.lsb
            }
            None => 0.0,
        };
        ((sample + noise) * self.full_scale)
            .round()
            .clamp(-(self.full_scale + 1.0), self.full_scale) as i32
    }
}

/// xorshift32 mapped into [0, 1).
fn uniform(state: &mut u32) -> f32 {
    let mut x = *state;
    x ^= x << 13;
    x ^= x >> 17;
    x ^= x << 5;
    *state = x;
    (x >> 8) as f32 / (1u32 << 24) as f32
}

/// Peak-normalizing gain for `data`, or unity when normalization is off.
fn output_gain(data: &[f32], normalize: bool) -> f32 {
    if !normalize {
        return 1.0;
    }
    let peak = data.iter().fold(0.0f32, |peak, &s| peak.max(s.abs()));
    if peak > 0.0 { 1.0 / peak } else { 1.0 }
}

/// Writes interleaved stereo from [`render_project`] to a WAV file in the
/// configured sample format.
pub fn write_wav(path: &Path, data: &[f32], config: &ExportConfig) -> Result<(), anyhow::Error> {
    let spec = WavSpec {
        channels: 2,
        sample_rate: config.sample_rate,
        bits_per_sample: config.bit_depth.bits(),
        sample_format: config.bit_depth.sample_format(),
    };
    let mut writer = WavWriter::create(path, spec)?;
    let gain = output_gain(data, config.normalize);

    match config.bit_depth {
        ExportBitDepth::Float32 => {
            for &sample in data {
                writer.write_sample(sample * gain)?;
            }
        }
        depth => {
            let mut quantizer = Quantizer::new(depth.bits(), config.dither);
            for frame in data.chunks(2) {
                for (channel, &sample) in frame.iter().enumerate() {
                    let value = quantizer.quantize(channel, sample * gain);
                    if depth == ExportBitDepth::Int16 {
                        writer.write_sample(value as i16)?;
                    } else {
                        writer.write_sample(value)?;
                    }
                }
            }
        }
    }

    writer.finalize()?;
    log::debug!("[Export] Wrote {:?} ({} samples)", path, data.len());
    Ok(())
}

/// Writes one WAV per stem into `output_dir`, named after the voice.
pub fn write_stems(
    output_dir: &Path,
    stems: &[(String, Vec<f32>)],
    config: &ExportConfig,
) -> Result<Vec<PathBuf>, anyhow::Error> {
    std::fs::create_dir_all(output_dir)?;
    let mut paths = Vec::new();

    for (i, (name, data)) in stems.iter().enumerate() {
        let safe_name = name.replace(['/', '\\', ':', '*', '?', '"', '<', '>', '|'], "_");
        let filename = if safe_name.is_empty() {
            format!("voice_{:02}.wav", i + 1)
        } else {
            format!("{}_{:02}.wav", safe_name, i + 1)
        };
        let path = output_dir.join(filename);
        write_wav(&path, data, config)?;
        paths.push(path);
    }

    Ok(paths)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::synth::SineSynth;

    fn engine_with_note() -> Engine {
        let mut engine = Engine::default();
        engine.set_synth(0, Box::new(SineSynth::new(8000.0)));
        engine.initialize(8000.0, 256);
        engine.project_mut().loop_bars = 1;
        engine.edit_pattern(0, |p| p.add_note(0.0, 1.0, 69, 127));
        engine
    }

    #[test]
    fn test_render_length_and_reset() {
        let mut engine = engine_with_note();
        let config = ExportConfig {
            sample_rate: 8000,
            tail_seconds: 0.5,
            ..ExportConfig::default()
        };
        let data = render_project(&mut engine, 2, &config).unwrap();

        // Two 4-beat loops at 120 BPM is 4 s, plus the tail.
        assert_eq!(data.len(), (4 * 8000 + 4000) * 2);
        assert!(data.iter().any(|&s| s.abs() > 1e-3));
        assert!(!engine.is_playing());
        assert_eq!(engine.playhead_beats(), 0.0);
    }

    #[test]
    fn test_render_requires_initialize() {
        let mut engine = Engine::default();
        assert!(render_project(&mut engine, 1, &ExportConfig::default()).is_err());
    }

    #[test]
    fn test_stems_restore_flags() {
        let mut engine = engine_with_note();
        engine.set_synth(2, Box::new(SineSynth::new(8000.0)));
        engine.project_mut().voices[2].mute = true;
        let config = ExportConfig {
            sample_rate: 8000,
            tail_seconds: 0.0,
            ..ExportConfig::default()
        };

        let stems = render_stems(&mut engine, 1, &config).unwrap();
        assert_eq!(stems.len(), 2);
        assert!(stems[0].1.iter().any(|&s| s != 0.0));
        assert!(stems[1].1.iter().all(|&s| s == 0.0));
        assert!(engine.project().voices[2].mute);
        assert!(!engine.project().voices[0].solo);
    }

    #[test]
    fn test_render_rejects_mismatched_rate() {
        let mut engine = engine_with_note();
        let err = render_project(&mut engine, 1, &ExportConfig::default()).unwrap_err();
        assert!(err.to_string().contains("48000"));
        assert!(!engine.is_playing());
    }

    #[test]
    fn test_dither_stays_within_one_lsb() {
        let mut quantizer = Quantizer::new(16, true);
        let values: Vec<i32> = (0..1000).map(|i| quantizer.quantize(i % 2, 0.0)).collect();
        assert!(values.iter().all(|v| v.abs() <= 1));
        assert!(values.iter().any(|&v| v != 0));

        let mut plain = Quantizer::new(24, false);
        assert_eq!(plain.quantize(0, 1.0), (1 << 23) - 1);
        assert_eq!(plain.quantize(1, -1.0), -(1 << 23) + 1);
    }

    #[test]
    fn test_write_wav_formats() {
        let dir = tempfile::tempdir().unwrap();
        let data = vec![0.5f32, -0.5, 0.25, -0.25];

        let depths = [
            (ExportBitDepth::Int16, 16),
            (ExportBitDepth::Int24, 24),
            (ExportBitDepth::Float32, 32),
        ];
        for (depth, bits) in depths {
            let path = dir.path().join(format!("out_{bits}.wav"));
            let config = ExportConfig {
                sample_rate: 44100,
                bit_depth: depth,
                dither: false,
                ..ExportConfig::default()
            };
            write_wav(&path, &data, &config).unwrap();

            let reader = hound::WavReader::open(&path).unwrap();
            assert_eq!(reader.spec().bits_per_sample, bits);
            assert_eq!(reader.spec().channels, 2);
            assert_eq!(reader.len(), 4);
        }
    }

    #[test]
    fn test_normalize_hits_full_scale() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("norm.wav");
        let config = ExportConfig {
            bit_depth: ExportBitDepth::Int16,
            normalize: true,
            dither: false,
            ..ExportConfig::default()
        };
        write_wav(&path, &[0.25, -0.125], &config).unwrap();

        let mut reader = hound::WavReader::open(&path).unwrap();
        let samples: Vec<i16> = reader.samples::<i16>().map(|s| s.unwrap()).collect();
        assert_eq!(samples, vec![32767, -16384]);
    }

    #[test]
    fn test_write_stems_names_files() {
        let dir = tempfile::tempdir().unwrap();
        let stems = vec![
            ("Bass/Sub".to_string(), vec![0.0f32; 4]),
            (String::new(), vec![0.0f32; 4]),
        ];
        let paths = write_stems(dir.path(), &stems, &ExportConfig::default()).unwrap();
        assert!(paths[0].ends_with("Bass_Sub_01.wav"));
        assert!(paths[1].ends_with("voice_02.wav"));
    }
}
