use crate::sequencer::NoteSink;
use crate::synth::VoiceSynth;
use sbox_shared::{NoteEvent, NoteEventKind, NUM_VOICES};

/// Preallocated per-voice event queues and render scratch.
pub struct MixBuffers {
    voice_events: [Vec<NoteEvent>; NUM_VOICES],
    /// Note-ons accepted per voice per block.
    note_on_limit: usize,
    /// Room for every accepted note-on, its note-off in the same block, and
    /// the note-offs of all notes tracked from earlier blocks.
    queue_capacity: usize,
    scratch_l: Vec<f32>,
    scratch_r: Vec<f32>,
}

impl MixBuffers {
    pub fn new(events_per_voice: usize, max_active_notes: usize, max_block_size: usize) -> Self {
        let capacity = 2 * events_per_voice + max_active_notes;
        Self {
            voice_events: std::array::from_fn(|_| Vec::with_capacity(capacity)),
            note_on_limit: events_per_voice,
            queue_capacity: capacity,
            scratch_l: vec![0.0; max_block_size],
            scratch_r: vec![0.0; max_block_size],
        }
    }

    /// Frames one render pass can cover.
    pub fn max_frames(&self) -> usize {
        self.scratch_l.len()
    }

    pub fn clear_events(&mut self) {
        for events in &mut self.voice_events {
            events.clear();
        }
    }

    pub fn events(&self, voice: usize) -> &[NoteEvent] {
        self.voice_events.get(voice).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Orders a voice's events by sample offset. Stable, so equal offsets
    /// keep the order the sequencer emitted them in.
    pub fn sort_events(&mut self, voice: usize) {
        if let Some(events) = self.voice_events.get_mut(voice) {
            insertion_sort_by_offset(events);
        }
    }

    /// Delivers only the note-offs of `voice`, for voices that are not rendered.
    pub fn release_only(&self, voice: usize, synth: &mut dyn VoiceSynth) {
        for event in self.events(voice) {
            if event.kind == NoteEventKind::NoteOff {
                synth.release_note(0, event.pitch, event.velocity);
            }
        }
    }

    /// Renders `frames` samples of `voice` into the scratch buffers, applying
    /// its events at their offsets, and returns the rendered slices.
    pub fn render_voice(
        &mut self,
        voice: usize,
        synth: &mut dyn VoiceSynth,
        frames: usize,
    ) -> (&[f32], &[f32]) {
        let frames = frames.min(self.scratch_l.len());
        let left = &mut self.scratch_l[..frames];
        let right = &mut self.scratch_r[..frames];
        left.fill(0.0);
        right.fill(0.0);

        let mut rendered = 0;
        if let Some(events) = self.voice_events.get(voice) {
            for event in events {
                let at = (event.sample_offset as usize).min(frames);
                if at > rendered {
                    synth.render_block(&mut left[rendered..at], &mut right[rendered..at]);
                    rendered = at;
                }
                match event.kind {
                    NoteEventKind::NoteOn => synth.play_note(0, event.pitch, event.velocity, 0, -1),
                    NoteEventKind::NoteOff => synth.release_note(0, event.pitch, event.velocity),
                }
            }
        }
        if rendered < frames {
            synth.render_block(&mut left[rendered..], &mut right[rendered..]);
        }

        (&self.scratch_l[..frames], &self.scratch_r[..frames])
    }
}

impl NoteSink for MixBuffers {
    fn note_on(&mut self, voice: usize, pitch: u8, velocity: u8, sample_offset: u32) -> bool {
        let (limit, capacity) = (self.note_on_limit, self.queue_capacity);
        let Some(events) = self.voice_events.get_mut(voice) else {
            return false;
        };
        let queued_ons = events.iter().filter(|e| e.is_note_on()).count();
        // Keep one slot free for the matching note-off.
        if queued_ons >= limit || events.len() + 2 > capacity {
            return false;
        }
        events.push(NoteEvent::note_on(pitch, velocity, sample_offset));
        true
    }

    fn note_off(&mut self, voice: usize, pitch: u8, sample_offset: u32) {
        let capacity = self.queue_capacity;
        if let Some(events) = self.voice_events.get_mut(voice) {
            if events.len() < capacity {
                events.push(NoteEvent::note_off(pitch, sample_offset));
            }
        }
    }
}

fn insertion_sort_by_offset(events: &mut [NoteEvent]) {
    for i in 1..events.len() {
        let mut j = i;
        while j > 0 && events[j - 1].sample_offset > events[j].sample_offset {
            events.swap(j - 1, j);
            j -= 1;
        }
    }
}

/// Adds one voice into the stereo bus with precomputed pan gains.
pub fn mix_voice(
    out_l: &mut [f32],
    out_r: &mut [f32],
    voice_l: &[f32],
    voice_r: &[f32],
    gain_l: f32,
    gain_r: f32,
) {
    for (out, &s) in out_l.iter_mut().zip(voice_l) {
        *out += s * gain_l;
    }
    for (out, &s) in out_r.iter_mut().zip(voice_r) {
        *out += s * gain_r;
    }
}

pub fn apply_gain(out_l: &mut [f32], out_r: &mut [f32], gain: f32) {
    for s in out_l.iter_mut().chain(out_r.iter_mut()) {
        *s *= gain;
    }
}
