//! Transport state published from the audio thread.
use sbox_shared::{BEATS_PER_BAR, NUM_VOICES};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// Musical time handed to each synth before it renders a block.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TimeInfo {
    pub is_playing: bool,
    pub tempo: f64,
    pub song_pos_beats: f64,
    pub bar_start_beats: f64,
    pub bar_number: i32,
    pub time_sig_num: u16,
    pub time_sig_denom: u16,
}

impl Default for TimeInfo {
    fn default() -> Self {
        Self {
            is_playing: false,
            tempo: 120.0,
            song_pos_beats: 0.0,
            bar_start_beats: 0.0,
            bar_number: 0,
            time_sig_num: 4,
            time_sig_denom: 4,
        }
    }
}

impl TimeInfo {
    pub fn new(tempo: f64, song_pos_beats: f64, is_playing: bool) -> Self {
        let bar_number = (song_pos_beats / BEATS_PER_BAR).floor().max(0.0);
        Self {
            is_playing,
            tempo,
            song_pos_beats,
            bar_start_beats: bar_number * BEATS_PER_BAR,
            bar_number: bar_number as i32,
            ..Self::default()
        }
    }
}

struct SharedTransport {
    playing: AtomicBool,
    /// f64 bits
    position: AtomicU64,
    /// f64 bits
    tempo: AtomicU64,
    /// One bit per MIDI pitch, two words per voice.
    sounding: [[AtomicU64; 2]; NUM_VOICES],
}

/// Lock-free view of the transport for UI or control threads.
#[derive(Clone)]
pub struct TransportHandle {
    shared: Arc<SharedTransport>,
}

impl Default for TransportHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl TransportHandle {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(SharedTransport {
                playing: AtomicBool::new(false),
                position: AtomicU64::new(0.0f64.to_bits()),
                tempo: AtomicU64::new(120.0f64.to_bits()),
                sounding: std::array::from_fn(|_| [AtomicU64::new(0), AtomicU64::new(0)]),
            }),
        }
    }

    pub fn is_playing(&self) -> bool {
        self.shared.playing.load(Ordering::Relaxed)
    }

    pub fn position_beats(&self) -> f64 {
        f64::from_bits(self.shared.position.load(Ordering::Relaxed))
    }

    pub fn tempo(&self) -> f64 {
        f64::from_bits(self.shared.tempo.load(Ordering::Relaxed))
    }

    pub fn is_note_playing(&self, voice: usize, pitch: u8) -> bool {
        let Some(words) = self.shared.sounding.get(voice) else {
            return false;
        };
        let pitch = (pitch & 0x7f) as usize;
        words[pitch / 64].load(Ordering::Relaxed) & (1u64 << (pitch % 64)) != 0
    }

    /// Pitches sounding on `voice` as of the last processed block.
    pub fn playing_notes(&self, voice: usize) -> Vec<u8> {
        (0..128u8).filter(|&p| self.is_note_playing(voice, p)).collect()
    }

    pub(crate) fn publish(&self, playing: bool, position_beats: f64, tempo: f64) {
        self.shared.playing.store(playing, Ordering::Relaxed);
        self.shared.position.store(position_beats.to_bits(), Ordering::Relaxed);
        self.shared.tempo.store(tempo.to_bits(), Ordering::Relaxed);
    }

    pub(crate) fn publish_sounding(&self, voice: usize, mask: [u64; 2]) {
        if let Some(words) = self.shared.sounding.get(voice) {
            words[0].store(mask[0], Ordering::Relaxed);
            words[1].store(mask[1], Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_time_info_bar_math() {
        let info = TimeInfo::new(100.0, 9.5, true);
        assert_eq!(info.bar_number, 2);
        assert_eq!(info.bar_start_beats, 8.0);
        assert_eq!((info.time_sig_num, info.time_sig_denom), (4, 4));
    }

    #[test]
    fn test_handle_publishes_across_clones() {
        let handle = TransportHandle::new();
        let reader = handle.clone();
        handle.publish(true, 3.25, 140.0);
        handle.publish_sounding(1, [1 << 60, 1 << 8]);

        assert!(reader.is_playing());
        assert_eq!(reader.position_beats(), 3.25);
        assert_eq!(reader.tempo(), 140.0);
        assert_eq!(reader.playing_notes(1), vec![60, 72]);
        assert!(reader.playing_notes(0).is_empty());
        assert!(!reader.is_note_playing(9, 60));
    }
}
