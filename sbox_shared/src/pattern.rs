use crate::BEATS_PER_BAR;
use serde::Serialize;
use std::cmp::Ordering;

/// Default match window for beat lookups (a hundredth of a beat).
pub const DEFAULT_TOLERANCE: f64 = 0.01;
/// Shortest duration a resize may produce (a 64th note).
pub const MIN_NOTE_DURATION: f64 = 0.0625;
pub const DEFAULT_BARS: i32 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Note {
    pub start_beat: f64,
    pub duration: f64,
    pub pitch: u8,
    pub velocity: u8,
}

impl Default for Note {
    fn default() -> Self {
        Self {
            start_beat: 0.0,
            duration: 1.0,
            pitch: 60,
            velocity: 100,
        }
    }
}

impl Note {
    pub fn new(start_beat: f64, duration: f64, pitch: u8, velocity: u8) -> Self {
        Self {
            start_beat,
            duration,
            pitch,
            velocity,
        }
    }

    pub fn end_beat(&self) -> f64 {
        self.start_beat + self.duration
    }

    /// Playback order: start beat, then pitch.
    pub fn playback_cmp(&self, other: &Note) -> Ordering {
        self.start_beat
            .total_cmp(&other.start_beat)
            .then(self.pitch.cmp(&other.pitch))
    }
}

/// One voice's loop. Notes stay sorted by [`Note::playback_cmp`] after every
/// mutation that can reorder them.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Pattern {
    notes: Vec<Note>,
    pub bars: i32,
    pub swing: f64,
}

impl Default for Pattern {
    fn default() -> Self {
        Self {
            notes: Vec::new(),
            bars: DEFAULT_BARS,
            swing: 0.0,
        }
    }
}

impl Pattern {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_bars(bars: i32) -> Self {
        Self {
            bars,
            ..Self::default()
        }
    }

    /// Builds a pattern from arbitrary notes, sorting them once.
    pub fn from_notes(bars: i32, swing: f64, notes: impl IntoIterator<Item = Note>) -> Self {
        let mut pattern = Self {
            notes: notes.into_iter().collect(),
            bars,
            swing,
        };
        pattern.sort_notes();
        pattern
    }

    pub fn length_in_beats(&self) -> f64 {
        self.bars as f64 * BEATS_PER_BAR
    }

    pub fn set_bars(&mut self, bars: i32) {
        self.bars = bars;
    }

    pub fn set_swing(&mut self, swing: f64) {
        self.swing = swing;
    }

    pub fn notes(&self) -> &[Note] {
        &self.notes
    }

    pub fn note(&self, index: usize) -> Option<&Note> {
        self.notes.get(index)
    }

    pub fn len(&self) -> usize {
        self.notes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.notes.is_empty()
    }

    pub fn add_note(&mut self, start_beat: f64, duration: f64, pitch: u8, velocity: u8) {
        self.notes.push(Note::new(start_beat, duration, pitch, velocity));
        self.sort_notes();
    }

    /// Adds several notes with a single re-sort.
    pub fn add_notes(&mut self, notes: impl IntoIterator<Item = Note>) {
        self.notes.extend(notes);
        self.sort_notes();
    }

    pub fn remove_note(&mut self, index: usize) -> Option<Note> {
        if index < self.notes.len() {
            Some(self.notes.remove(index))
        } else {
            None
        }
    }

    /// Removes every note of `pitch` whose start lies within `tolerance` of
    /// `beat`. Returns how many were removed.
    pub fn remove_notes_at(&mut self, beat: f64, pitch: u8, tolerance: f64) -> usize {
        let before = self.notes.len();
        self.notes
            .retain(|n| !(n.pitch == pitch && (n.start_beat - beat).abs() < tolerance));
        before - self.notes.len()
    }

    pub fn move_note(&mut self, index: usize, new_start_beat: f64, new_pitch: u8) -> bool {
        let Some(note) = self.notes.get_mut(index) else {
            return false;
        };
        note.start_beat = new_start_beat;
        note.pitch = new_pitch;
        self.sort_notes();
        true
    }

    pub fn resize_note(&mut self, index: usize, new_duration: f64) -> bool {
        match self.notes.get_mut(index) {
            Some(note) => {
                note.duration = new_duration.max(MIN_NOTE_DURATION);
                true
            }
            None => false,
        }
    }

    pub fn set_note_velocity(&mut self, index: usize, velocity: u8) -> bool {
        match self.notes.get_mut(index) {
            Some(note) => {
                note.velocity = velocity.clamp(1, 127);
                true
            }
            None => false,
        }
    }

    pub fn clear(&mut self) {
        self.notes.clear();
    }

    /// First note of `pitch` (scan order) whose span, widened by `tolerance`
    /// on both ends, contains `beat`.
    pub fn find_note_at(&self, beat: f64, pitch: u8, tolerance: f64) -> Option<&Note> {
        self.notes.iter().find(|n| {
            n.pitch == pitch && beat >= n.start_beat - tolerance && beat < n.end_beat() + tolerance
        })
    }

    /// Index of the first note of `pitch` starting within `tolerance` of `beat`.
    pub fn find_note_starting_at(&self, beat: f64, pitch: u8, tolerance: f64) -> Option<usize> {
        self.notes
            .iter()
            .position(|n| n.pitch == pitch && (n.start_beat - beat).abs() < tolerance)
    }

    /// Index of the first note of `pitch` sounding at `beat`. The tolerance
    /// only widens the start, so a click just past a note's end never selects
    /// it over the adjacent one.
    pub fn find_note_containing(&self, beat: f64, pitch: u8, tolerance: f64) -> Option<usize> {
        self.notes.iter().position(|n| {
            n.pitch == pitch && beat >= n.start_beat - tolerance && beat < n.end_beat()
        })
    }

    /// Notes overlapping `[start_beat, end_beat)`.
    pub fn notes_in_range(
        &self,
        start_beat: f64,
        end_beat: f64,
    ) -> impl Iterator<Item = &Note> + '_ {
        self.notes
            .iter()
            .filter(move |n| n.start_beat < end_beat && n.end_beat() > start_beat)
    }

    /// Notes with `start_beat <= start < end_beat`. Relies on the sort
    /// invariant, so it neither allocates nor scans the whole pattern.
    pub fn notes_starting_in_range(&self, start_beat: f64, end_beat: f64) -> &[Note] {
        if !(end_beat > start_beat) {
            return &[];
        }
        let lo = self.notes.partition_point(|n| n.start_beat < start_beat);
        let hi = self.notes.partition_point(|n| n.start_beat < end_beat);
        &self.notes[lo..hi.max(lo)]
    }

    pub fn sort_notes(&mut self) {
        self.notes.sort_by(Note::playback_cmp);
    }
}
