use crate::pattern::{Note, Pattern};

/// Copied notes, kept by whoever drives the editing surface.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NoteClipboard {
    notes: Vec<Note>,
}

impl NoteClipboard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn notes(&self) -> &[Note] {
        &self.notes
    }

    pub fn len(&self) -> usize {
        self.notes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.notes.is_empty()
    }

    pub fn clear(&mut self) {
        self.notes.clear();
    }

    /// Copies every note overlapping `[start_beat, end_beat)`.
    pub fn copy_range(&mut self, pattern: &Pattern, start_beat: f64, end_beat: f64) -> usize {
        self.notes = pattern.notes_in_range(start_beat, end_beat).copied().collect();
        self.notes.len()
    }

    /// Copies the notes at `indices`, skipping any out of range.
    pub fn copy_indices(&mut self, pattern: &Pattern, indices: &[usize]) -> usize {
        self.notes = indices.iter().filter_map(|&i| pattern.note(i)).copied().collect();
        self.notes.len()
    }

    /// Copies the notes overlapping the range, then removes them from the pattern.
    pub fn cut_range(&mut self, pattern: &mut Pattern, start_beat: f64, end_beat: f64) -> usize {
        let count = self.copy_range(pattern, start_beat, end_beat);
        let mut index = pattern.len();
        while index > 0 {
            index -= 1;
            let overlaps = pattern
                .note(index)
                .is_some_and(|n| n.start_beat < end_beat && n.end_beat() > start_beat);
            if overlaps {
                pattern.remove_note(index);
            }
        }
        count
    }

    /// Pastes the clipboard with its earliest note landing on `at_beat`,
    /// keeping relative timing.
    pub fn paste(&self, pattern: &mut Pattern, at_beat: f64) -> usize {
        if self.notes.is_empty() {
            return 0;
        }
        let min_start = self
            .notes
            .iter()
            .map(|n| n.start_beat)
            .fold(f64::INFINITY, f64::min);

        pattern.add_notes(self.notes.iter().map(|n| Note {
            start_beat: at_beat + (n.start_beat - min_start),
            ..*n
        }));
        self.notes.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pattern() -> Pattern {
        let mut p = Pattern::new();
        p.add_note(0.0, 1.0, 60, 100);
        p.add_note(1.0, 0.5, 62, 90);
        p.add_note(2.0, 1.0, 64, 80);
        p
    }

    #[test]
    fn test_copy_and_paste_keeps_relative_timing() {
        let mut source = pattern();
        let mut clipboard = NoteClipboard::new();
        assert_eq!(clipboard.copy_range(&source, 0.5, 2.5), 3);

        let mut target = Pattern::new();
        assert_eq!(clipboard.paste(&mut target, 8.0), 3);
        let starts: Vec<f64> = target.notes().iter().map(|n| n.start_beat).collect();
        assert_eq!(starts, vec![8.0, 9.0, 10.0]);

        assert_eq!(clipboard.paste(&mut source, 0.25), 3);
        assert_eq!(source.len(), 6);
        assert_eq!(source.notes()[1].start_beat, 0.25);
    }

    #[test]
    fn test_copy_indices_skips_out_of_range() {
        let source = pattern();
        let mut clipboard = NoteClipboard::new();
        assert_eq!(clipboard.copy_indices(&source, &[2, 7, 0]), 2);
        assert_eq!(clipboard.notes()[0].pitch, 64);
    }

    #[test]
    fn test_cut_range_removes_from_source() {
        let mut source = pattern();
        let mut clipboard = NoteClipboard::new();
        assert_eq!(clipboard.cut_range(&mut source, 1.0, 2.0), 1);
        assert_eq!(source.len(), 2);
        assert!(source.notes().iter().all(|n| n.pitch != 62));

        clipboard.clear();
        assert!(clipboard.is_empty());
        assert_eq!(clipboard.paste(&mut source, 0.0), 0);
    }
}
