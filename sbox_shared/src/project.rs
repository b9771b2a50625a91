use crate::pattern::Pattern;
use crate::{BEATS_PER_BAR, FX_PARAMS_PER_SLOT, NUM_GLOBAL_FX, NUM_VOICES};
use serde::Serialize;

pub const DEFAULT_TEMPO: f64 = 120.0;
pub const DEFAULT_LOOP_BARS: i32 = 4;
pub const DEFAULT_MASTER_VOLUME: f32 = 0.8;
pub const DEFAULT_PROJECT_NAME: &str = "Untitled";

/// Timestamp layout used for `created` / `modified`.
pub const DATE_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

pub fn timestamp_now() -> String {
    chrono::Local::now().format(DATE_FORMAT).to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Voice {
    pub name: String,
    /// Opaque synth state, owned here but never interpreted.
    #[serde(skip)]
    pub patch_data: Vec<u8>,
    pub pattern: Pattern,
    pub volume: f32,
    pub pan: f32,
    pub send_a: f32,
    pub send_b: f32,
    pub mute: bool,
    pub solo: bool,
}

impl Default for Voice {
    fn default() -> Self {
        Self {
            name: String::new(),
            patch_data: Vec::new(),
            pattern: Pattern::default(),
            volume: 1.0,
            pan: 0.0,
            send_a: 0.0,
            send_b: 0.0,
            mute: false,
            solo: false,
        }
    }
}

impl Voice {
    /// Left/right gains for the linear pan law, volume included.
    pub fn pan_gains(&self) -> (f32, f32) {
        let left = self.volume * (1.0 - self.pan).min(1.0);
        let right = self.volume * (1.0 + self.pan).min(1.0);
        (left, right)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GlobalFxSlot {
    pub fx_type: i32,
    pub enabled: bool,
    pub params: [f32; FX_PARAMS_PER_SLOT],
}

impl Default for GlobalFxSlot {
    fn default() -> Self {
        Self {
            fx_type: 0,
            enabled: true,
            params: [0.0; FX_PARAMS_PER_SLOT],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Project {
    pub tempo: f64,
    pub loop_bars: i32,
    pub swing: f64,
    pub master_volume: f32,
    pub voices: [Voice; NUM_VOICES],
    pub global_fx: [GlobalFxSlot; NUM_GLOBAL_FX],

    pub project_name: String,
    pub author: String,
    pub comment: String,
    pub tags: Vec<String>,
    pub created_date: String,
    pub modified_date: String,
}

impl Default for Project {
    fn default() -> Self {
        let mut project = Self {
            tempo: DEFAULT_TEMPO,
            loop_bars: DEFAULT_LOOP_BARS,
            swing: 0.0,
            master_volume: DEFAULT_MASTER_VOLUME,
            voices: Default::default(),
            global_fx: Default::default(),
            project_name: DEFAULT_PROJECT_NAME.to_string(),
            author: String::new(),
            comment: String::new(),
            tags: Vec::new(),
            created_date: String::new(),
            modified_date: String::new(),
        };
        project.reset();
        project
    }
}

impl Project {
    pub fn new() -> Self {
        Self::default()
    }

    /// Back to a fresh four-voice project stamped with the current time.
    pub fn reset(&mut self) {
        self.tempo = DEFAULT_TEMPO;
        self.loop_bars = DEFAULT_LOOP_BARS;
        self.swing = 0.0;
        self.master_volume = DEFAULT_MASTER_VOLUME;

        for (i, voice) in self.voices.iter_mut().enumerate() {
            *voice = Voice {
                name: format!("Voice {}", i + 1),
                pattern: Pattern::with_bars(self.loop_bars),
                ..Voice::default()
            };
        }
        for slot in &mut self.global_fx {
            *slot = GlobalFxSlot::default();
        }

        self.project_name = DEFAULT_PROJECT_NAME.to_string();
        self.author.clear();
        self.comment.clear();
        self.tags.clear();

        let now = timestamp_now();
        self.created_date = now.clone();
        self.modified_date = now;
    }

    pub fn voice(&self, index: usize) -> Option<&Voice> {
        self.voices.get(index)
    }

    pub fn voice_mut(&mut self, index: usize) -> Option<&mut Voice> {
        self.voices.get_mut(index)
    }

    pub fn pattern(&self, voice: usize) -> Option<&Pattern> {
        self.voices.get(voice).map(|v| &v.pattern)
    }

    pub fn pattern_mut(&mut self, voice: usize) -> Option<&mut Pattern> {
        self.voices.get_mut(voice).map(|v| &mut v.pattern)
    }

    pub fn project_length_in_beats(&self) -> f64 {
        self.loop_bars.max(1) as f64 * BEATS_PER_BAR
    }

    /// Bar count of the longest voice pattern (at least 1).
    pub fn max_pattern_bars(&self) -> i32 {
        self.voices
            .iter()
            .map(|v| v.pattern.bars)
            .max()
            .unwrap_or(DEFAULT_LOOP_BARS)
            .max(1)
    }

    pub fn any_solo(&self) -> bool {
        self.voices.iter().any(|v| v.solo)
    }

    /// Voices that sound under the mute/solo rules: when anything is soloed
    /// only soloed voices play, otherwise every unmuted voice does.
    pub fn audible_voices(&self) -> [bool; NUM_VOICES] {
        let any_solo = self.any_solo();
        std::array::from_fn(|i| {
            let voice = &self.voices[i];
            if any_solo { voice.solo } else { !voice.mute }
        })
    }

    pub fn touch_modified(&mut self) {
        self.modified_date = timestamp_now();
    }

    pub fn set_comment(&mut self, comment: impl Into<String>) {
        self.comment = comment.into();
    }

    pub fn add_tag(&mut self, tag: impl Into<String>) {
        let tag = tag.into();
        if !self.tags.contains(&tag) {
            self.tags.push(tag);
        }
    }

    pub fn remove_tag(&mut self, tag: &str) -> bool {
        let before = self.tags.len();
        self.tags.retain(|t| t != tag);
        before != self.tags.len()
    }
}
