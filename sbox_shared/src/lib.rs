//! Data model and persistence for the groovebox: patterns, voices, the
//! project, and the `SBOX` container it is stored in.

pub mod clipboard;
pub mod error;
pub mod file_format;
pub mod pattern;
pub mod project;
pub mod xml;

pub use clipboard::NoteClipboard;
pub use error::ProjectError;
pub use file_format::{PROJECT_FORMAT_VERSION, PROJECT_TAG};
pub use pattern::{Note, Pattern};
pub use project::{GlobalFxSlot, Project, Voice};

/// Synth voices per project, each with its own pattern.
pub const NUM_VOICES: usize = 4;
/// Global effect slots (stored, not processed).
pub const NUM_GLOBAL_FX: usize = 4;
pub const FX_PARAMS_PER_SLOT: usize = 12;
/// Fixed 4/4 meter.
pub const BEATS_PER_BAR: f64 = 4.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoteEventKind {
    NoteOff,
    NoteOn,
}

/// A note-on or note-off destined for one voice, positioned within the
/// current audio block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NoteEvent {
    pub kind: NoteEventKind,
    pub pitch: u8,
    pub velocity: u8,
    pub sample_offset: u32,
}

impl NoteEvent {
    pub fn note_on(pitch: u8, velocity: u8, sample_offset: u32) -> Self {
        Self {
            kind: NoteEventKind::NoteOn,
            pitch,
            velocity,
            sample_offset,
        }
    }

    pub fn note_off(pitch: u8, sample_offset: u32) -> Self {
        Self {
            kind: NoteEventKind::NoteOff,
            pitch,
            velocity: 0,
            sample_offset,
        }
    }

    pub fn is_note_on(&self) -> bool {
        self.kind == NoteEventKind::NoteOn
    }
}
