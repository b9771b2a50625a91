use sbox_shared::pattern::Pattern;
use sbox_shared::{Project, BEATS_PER_BAR, NUM_VOICES};
use serde::{Deserialize, Serialize};

/// Receives the note events the sequencer produces for one block.
pub trait NoteSink {
    /// Returns `false` when the event could not be queued. Rejected note-ons
    /// are not tracked, so they never need a matching note-off.
    fn note_on(&mut self, voice: usize, pitch: u8, velocity: u8, sample_offset: u32) -> bool;
    fn note_off(&mut self, voice: usize, pitch: u8, sample_offset: u32);
}

/// How the transport decides where the loop wraps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopPolicy {
    /// `loop_bars` of the project.
    #[default]
    ProjectBars,
    /// The longest voice pattern, never shorter than one bar.
    LongestPattern,
}

impl LoopPolicy {
    pub fn loop_end_beats(self, project: &Project) -> f64 {
        match self {
            LoopPolicy::ProjectBars => project.project_length_in_beats(),
            LoopPolicy::LongestPattern => {
                (project.max_pattern_bars() as f64 * BEATS_PER_BAR).max(BEATS_PER_BAR)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ActiveNote {
    pub voice_index: usize,
    pub pitch: u8,
    /// In transport beats; rebased on every loop wrap.
    pub end_beat: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayState {
    Stopped,
    Playing,
}

/// Beat/sample mapping for one block.
#[derive(Clone, Copy)]
struct BlockClock {
    beats_per_sample: f64,
    num_samples: usize,
}

impl BlockClock {
    /// Offset of `beats_into_range` past a range that starts `base` samples
    /// into the block. Truncates, then clamps into the block.
    fn offset(&self, base: u32, beats_into_range: f64) -> u32 {
        let samples = (beats_into_range / self.beats_per_sample).floor();
        let last = self.num_samples.saturating_sub(1) as f64;
        (base as f64 + samples.max(0.0)).min(last) as u32
    }

    fn range(self, start: f64, end: f64, base_offset: u32) -> BeatRange {
        BeatRange {
            start,
            end,
            base_offset,
            clock: self,
        }
    }
}

/// Half-open stretch of transport beats processed in one pass, placed
/// `base_offset` samples into the block.
#[derive(Clone, Copy)]
struct BeatRange {
    start: f64,
    end: f64,
    base_offset: u32,
    clock: BlockClock,
}

impl BeatRange {
    fn offset_after(&self, beats_into_range: f64) -> u32 {
        self.clock.offset(self.base_offset, beats_into_range)
    }

    fn offset_of(&self, beat: f64) -> u32 {
        self.offset_after(beat - self.start)
    }
}

/// `[start, end)` in pattern beats, sitting `lead_beats` into a [`BeatRange`].
#[derive(Clone, Copy)]
struct PatternSlice {
    start: f64,
    end: f64,
    lead_beats: f64,
}

impl PatternSlice {
    fn new(start: f64, end: f64, lead_beats: f64) -> Self {
        Self {
            start,
            end,
            lead_beats,
        }
    }
}

/// Beat-based transport that turns patterns into per-voice note events.
pub struct Sequencer {
    state: PlayState,
    position_beats: f64,
    active_notes: Vec<ActiveNote>,
    max_active_notes: usize,
    loop_policy: LoopPolicy,
}

impl Sequencer {
    pub fn new(max_active_notes: usize, loop_policy: LoopPolicy) -> Self {
        Self {
            state: PlayState::Stopped,
            position_beats: 0.0,
            active_notes: Vec::with_capacity(max_active_notes),
            max_active_notes,
            loop_policy,
        }
    }

    pub fn state(&self) -> PlayState {
        self.state
    }

    pub fn is_playing(&self) -> bool {
        self.state == PlayState::Playing
    }

    pub fn position_beats(&self) -> f64 {
        self.position_beats
    }

    pub fn loop_policy(&self) -> LoopPolicy {
        self.loop_policy
    }

    pub fn set_loop_policy(&mut self, policy: LoopPolicy) {
        self.loop_policy = policy;
    }

    pub fn loop_end_beat(&self, project: &Project) -> f64 {
        self.loop_policy.loop_end_beats(project)
    }

    pub fn active_notes(&self) -> &[ActiveNote] {
        &self.active_notes
    }

    pub fn active_note_count(&self) -> usize {
        self.active_notes.len()
    }

    /// Pitches currently held on `voice`, in trigger order.
    pub fn playing_notes(&self, voice: usize) -> impl Iterator<Item = u8> + '_ {
        self.active_notes
            .iter()
            .filter(move |n| n.voice_index == voice)
            .map(|n| n.pitch)
    }

    /// Held pitches on `voice` as a 128-bit mask.
    pub fn sounding_mask(&self, voice: usize) -> [u64; 2] {
        let mut mask = [0u64; 2];
        for pitch in self.playing_notes(voice) {
            let p = (pitch & 0x7f) as usize;
            mask[p / 64] |= 1u64 << (p % 64);
        }
        mask
    }

    /// Starts from the current position. Already playing is a no-op.
    pub fn play(&mut self) {
        self.state = PlayState::Playing;
    }

    /// Releases everything at offset 0 and rewinds to the top.
    pub fn stop(&mut self, sink: &mut dyn NoteSink) {
        self.release_all(sink);
        self.state = PlayState::Stopped;
        self.position_beats = 0.0;
    }

    pub fn set_playing(&mut self, playing: bool, sink: &mut dyn NoteSink) {
        if playing {
            self.play();
        } else {
            self.stop(sink);
        }
    }

    /// Releases everything and jumps. Negative or NaN positions clamp to 0.
    pub fn set_position_beats(&mut self, beat: f64, sink: &mut dyn NoteSink) {
        self.release_all(sink);
        self.position_beats = if beat > 0.0 { beat } else { 0.0 };
    }

    pub fn rewind(&mut self, sink: &mut dyn NoteSink) {
        self.set_position_beats(0.0, sink);
    }

    pub fn release_all(&mut self, sink: &mut dyn NoteSink) {
        for note in self.active_notes.drain(..) {
            sink.note_off(note.voice_index, note.pitch, 0);
        }
    }

    /// Advances the transport by one block, emitting note events into `sink`.
    pub fn process(
        &mut self,
        project: &Project,
        num_samples: usize,
        sample_rate: f64,
        sink: &mut dyn NoteSink,
    ) {
        if !self.is_playing() || num_samples == 0 || !(sample_rate > 0.0) {
            return;
        }

        let beats_per_sample = (project.tempo / 60.0) / sample_rate;
        if !(beats_per_sample > 0.0) || !beats_per_sample.is_finite() {
            return;
        }
        let clock = BlockClock {
            beats_per_sample,
            num_samples,
        };
        let block_beats = beats_per_sample * num_samples as f64;
        let loop_end = self.loop_end_beat(project);

        // A seek or a shorter loop can leave the cursor past the end.
        if self.position_beats >= loop_end {
            let shift = (self.position_beats / loop_end).floor() * loop_end;
            self.position_beats -= shift;
            self.rebase(shift);
        }

        let audible = project.audible_voices();
        let start = self.position_beats;
        let end = start + block_beats;

        if end < loop_end {
            self.process_range(project, &audible, clock.range(start, end, 0), sink);
            self.position_beats = end;
        } else {
            self.process_range(project, &audible, clock.range(start, loop_end, 0), sink);
            self.rebase(loop_end);

            let remainder = end - loop_end;
            let loop_sample_offset = clock.offset(0, loop_end - start);
            let wrapped = clock.range(0.0, remainder, loop_sample_offset);
            self.process_range(project, &audible, wrapped, sink);
            self.position_beats = remainder;
        }
    }

    fn rebase(&mut self, beats: f64) {
        for note in &mut self.active_notes {
            note.end_beat -= beats;
        }
    }

    fn process_range(
        &mut self,
        project: &Project,
        audible: &[bool; NUM_VOICES],
        range: BeatRange,
        sink: &mut dyn NoteSink,
    ) {
        if !(range.end > range.start) {
            return;
        }

        // Releases go first so a pitch retriggered in this range is not cut.
        self.active_notes.retain(|note| {
            if note.end_beat < range.end {
                let offset = range.offset_of(note.end_beat);
                sink.note_off(note.voice_index, note.pitch, offset);
                false
            } else {
                true
            }
        });

        for (voice_index, voice) in project.voices.iter().enumerate() {
            if audible[voice_index] {
                self.trigger_voice(voice_index, &voice.pattern, range, sink);
            }
        }
    }

    fn trigger_voice(
        &mut self,
        voice_index: usize,
        pattern: &Pattern,
        range: BeatRange,
        sink: &mut dyn NoteSink,
    ) {
        let length = pattern.length_in_beats();
        if !(length > 0.0) {
            return;
        }

        let span = range.end - range.start;
        let wrapped_start = range.start.rem_euclid(length);
        let wrapped_end = wrapped_start + span;

        if wrapped_end <= length {
            let slice = PatternSlice::new(wrapped_start, wrapped_end, 0.0);
            self.trigger_notes(voice_index, pattern, slice, range, sink);
        } else {
            let first = PatternSlice::new(wrapped_start, length, 0.0);
            self.trigger_notes(voice_index, pattern, first, range, sink);
            let second_end = (wrapped_end - length).min(length);
            let second = PatternSlice::new(0.0, second_end, length - wrapped_start);
            self.trigger_notes(voice_index, pattern, second, range, sink);
        }
    }

    /// Triggers the notes starting inside `slice` of the pattern.
    fn trigger_notes(
        &mut self,
        voice_index: usize,
        pattern: &Pattern,
        slice: PatternSlice,
        range: BeatRange,
        sink: &mut dyn NoteSink,
    ) {
        for note in pattern.notes_starting_in_range(slice.start, slice.end) {
            let beats_into_range = slice.lead_beats + (note.start_beat - slice.start);
            let end_beat = range.start + beats_into_range + note.duration;
            let ends_in_range = end_beat < range.end;

            if !ends_in_range && self.active_notes.len() >= self.max_active_notes {
                continue;
            }

            let offset = range.offset_after(beats_into_range);
            if !sink.note_on(voice_index, note.pitch, note.velocity, offset) {
                continue;
            }

            if ends_in_range {
                let off = range.offset_of(end_beat);
                sink.note_off(voice_index, note.pitch, off);
            } else {
                self.active_notes.push(ActiveNote {
                    voice_index,
                    pitch: note.pitch,
                    end_beat,
                });
            }
        }
    }
}
