use crate::transport::TimeInfo;
use serde::{Deserialize, Serialize};

/// One synthesizer instance driven by a voice.
pub trait VoiceSynth: Send {
    /// Render into both channels, overwriting them. Slice lengths match.
    fn render_block(&mut self, left: &mut [f32], right: &mut [f32]);

    fn play_note(&mut self, channel: u8, pitch: u8, velocity: u8, detune: i32, voice_id: i32);

    fn release_note(&mut self, channel: u8, pitch: u8, velocity: u8);

    fn all_notes_off(&mut self);

    /// Opaque patch state. The engine stores it without looking inside.
    fn save_raw_patch(&mut self) -> Vec<u8>;

    fn load_raw_patch(&mut self, data: &[u8]);

    fn patch_name(&self) -> String;

    fn set_time_info(&mut self, _info: &TimeInfo) {}

    /// An unready synth is skipped for the block.
    fn is_ready(&self) -> bool {
        true
    }

    fn set_sample_rate(&mut self, _sample_rate: f32) {}
}

/// Patch for [`SineSynth`], stored as JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SinePatch {
    pub name: String,
    pub gain: f32,
    pub attack_seconds: f32,
    pub release_seconds: f32,
}

impl Default for SinePatch {
    fn default() -> Self {
        Self {
            name: "Sine".to_string(),
            gain: 0.2,
            attack_seconds: 0.005,
            release_seconds: 0.08,
        }
    }
}

#[derive(Clone, Copy)]
struct SineVoice {
    pitch: u8,
    phase: f32,
    frequency: f32,
    amplitude: f32,
    level: f32,
    releasing: bool,
}

/// Small polyphonic sine synth with a linear attack/release envelope.
pub struct SineSynth {
    patch: SinePatch,
    sample_rate: f32,
    voices: Vec<SineVoice>,
    max_polyphony: usize,
}

impl SineSynth {
    pub fn new(sample_rate: f32) -> Self {
        Self::with_patch(sample_rate, SinePatch::default())
    }

    pub fn with_patch(sample_rate: f32, patch: SinePatch) -> Self {
        let max_polyphony = 16;
        Self {
            patch,
            sample_rate,
            voices: Vec::with_capacity(max_polyphony),
            max_polyphony,
        }
    }

    pub fn patch(&self) -> &SinePatch {
        &self.patch
    }

    pub fn active_voices(&self) -> usize {
        self.voices.len()
    }

    fn attack_step(&self) -> f32 {
        1.0 / (self.patch.attack_seconds * self.sample_rate).max(1.0)
    }

    fn release_step(&self) -> f32 {
        1.0 / (self.patch.release_seconds * self.sample_rate).max(1.0)
    }
}

fn pitch_to_hz(pitch: u8) -> f32 {
    440.0 * 2.0f32.powf((pitch as f32 - 69.0) / 12.0)
}

impl VoiceSynth for SineSynth {
    fn render_block(&mut self, left: &mut [f32], right: &mut [f32]) {
        let attack = self.attack_step();
        let release = self.release_step();
        let gain = self.patch.gain;
        let sample_rate = self.sample_rate.max(1.0);

        for (l, r) in left.iter_mut().zip(right.iter_mut()) {
            let mut s = 0.0;
            for voice in &mut self.voices {
                if voice.releasing {
                    voice.level = (voice.level - release).max(0.0);
                } else {
                    voice.level = (voice.level + attack).min(1.0);
                }
                let wave = (voice.phase * std::f32::consts::TAU).sin();
                s += wave * voice.level * voice.amplitude;
                voice.phase = (voice.phase + voice.frequency / sample_rate) % 1.0;
            }
            *l = s * gain;
            *r = s * gain;
        }

        self.voices.retain(|v| !(v.releasing && v.level <= 0.0));
    }

    fn play_note(&mut self, _channel: u8, pitch: u8, velocity: u8, _detune: i32, _voice_id: i32) {
        if self.voices.len() >= self.max_polyphony {
            // Steal the oldest.
            self.voices.remove(0);
        }
        self.voices.push(SineVoice {
            pitch,
            phase: 0.0,
            frequency: pitch_to_hz(pitch),
            amplitude: velocity as f32 / 127.0,
            level: 0.0,
            releasing: false,
        });
    }

    fn release_note(&mut self, _channel: u8, pitch: u8, _velocity: u8) {
        if let Some(voice) = self.voices.iter_mut().find(|v| v.pitch == pitch && !v.releasing) {
            voice.releasing = true;
        }
    }

    fn all_notes_off(&mut self) {
        self.voices.clear();
    }

    fn save_raw_patch(&mut self) -> Vec<u8> {
        serde_json::to_vec(&self.patch).unwrap_or_default()
    }

    fn load_raw_patch(&mut self, data: &[u8]) {
        match serde_json::from_slice::<SinePatch>(data) {
            Ok(patch) => self.patch = patch,
            Err(e) => {
                log::warn!("[SineSynth] Ignoring unreadable patch ({} bytes): {}", data.len(), e)
            }
        }
    }

    fn patch_name(&self) -> String {
        self.patch.name.clone()
    }

    fn set_sample_rate(&mut self, sample_rate: f32) {
        self.sample_rate = sample_rate;
    }
}
