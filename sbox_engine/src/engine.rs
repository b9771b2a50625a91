use crate::commands::EngineCommand;
use crate::config::EngineConfig;
use crate::listener::{EngineListener, ListenerId, ListenerSet};
use crate::mixer::{apply_gain, mix_voice, MixBuffers};
use crate::sequencer::{NoteSink, Sequencer};
use crate::synth::VoiceSynth;
use crate::transport::{TimeInfo, TransportHandle};
use crossbeam_channel::{Receiver, Sender};
use sbox_shared::pattern::Pattern;
use sbox_shared::{Project, ProjectError, NUM_VOICES};
use std::path::Path;

type SynthSlots = [Option<Box<dyn VoiceSynth>>; NUM_VOICES];

/// Sends sequencer output straight to the synths. Used off the audio path,
/// where there is no block to queue events into.
struct DirectSink<'a> {
    synths: &'a mut SynthSlots,
}

impl NoteSink for DirectSink<'_> {
    fn note_on(&mut self, voice: usize, pitch: u8, velocity: u8, _sample_offset: u32) -> bool {
        match self.synths.get_mut(voice).and_then(|s| s.as_deref_mut()) {
            Some(synth) => {
                synth.play_note(0, pitch, velocity, 0, -1);
                true
            }
            None => false,
        }
    }

    fn note_off(&mut self, voice: usize, pitch: u8, _sample_offset: u32) {
        if let Some(synth) = self.synths.get_mut(voice).and_then(|s| s.as_deref_mut()) {
            synth.release_note(0, pitch, 0);
        }
    }
}

/// Owns the project, the transport and one synth per voice, and renders the
/// stereo mix block by block.
pub struct Engine {
    config: EngineConfig,
    project: Project,
    sequencer: Sequencer,
    synths: SynthSlots,
    buffers: MixBuffers,
    listeners: ListenerSet,
    command_tx: Sender<EngineCommand>,
    command_rx: Receiver<EngineCommand>,
    transport: TransportHandle,
    active_voice: usize,
    sample_rate: f64,
    block_size: usize,
    initialized: bool,
}

impl Default for Engine {
    fn default() -> Self {
        Self::new(EngineConfig::default())
    }
}

impl Engine {
    pub fn new(config: EngineConfig) -> Self {
        let config = config.sanitized();
        let (command_tx, command_rx) = crossbeam_channel::bounded(config.command_queue_capacity);
        Self {
            sequencer: Sequencer::new(config.max_active_notes, config.loop_policy),
            buffers: MixBuffers::new(
                config.events_per_voice,
                config.max_active_notes,
                config.max_block_size,
            ),
            project: Project::new(),
            synths: Default::default(),
            listeners: ListenerSet::new(),
            command_tx,
            command_rx,
            transport: TransportHandle::new(),
            active_voice: 0,
            sample_rate: 44100.0,
            block_size: config.max_block_size,
            initialized: false,
            config,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn sample_rate(&self) -> f64 {
        self.sample_rate
    }

    /// Prepares for playback with a fresh project. Calling it again while
    /// initialized changes nothing. Returns `false` for an unusable rate.
    pub fn initialize(&mut self, sample_rate: f64, block_size: usize) -> bool {
        if self.initialized {
            return true;
        }
        if !(sample_rate > 0.0) || !sample_rate.is_finite() {
            log::warn!("[Engine] Refusing to initialize at sample rate {}", sample_rate);
            return false;
        }

        self.sample_rate = sample_rate;
        self.block_size = block_size.max(1);
        if self.block_size > self.buffers.max_frames() {
            // Host blocks beyond the render buffer are split in `process`.
            log::debug!(
                "[Engine] Block size {} exceeds render buffer {}, rendering in chunks",
                self.block_size,
                self.buffers.max_frames()
            );
        }

        self.project.reset();
        for (voice, slot) in self.project.voices.iter_mut().zip(self.synths.iter_mut()) {
            if let Some(synth) = slot.as_deref_mut() {
                synth.set_sample_rate(sample_rate as f32);
                let name = synth.patch_name();
                voice.name = if name.is_empty() { "Init".to_string() } else { name };
            }
        }

        self.initialized = true;
        self.publish_transport();
        log::info!("[Engine] Initialized at {} Hz, block size {}", sample_rate, self.block_size);
        true
    }

    /// Releases everything and unbinds the synths. Safe to call repeatedly.
    pub fn shutdown(&mut self) {
        if !self.initialized {
            return;
        }
        self.listeners.clear();
        self.sequencer.stop(&mut DirectSink {
            synths: &mut self.synths,
        });
        for slot in &mut self.synths {
            if let Some(mut synth) = slot.take() {
                synth.all_notes_off();
            }
        }
        self.initialized = false;
        self.publish_transport();
        log::info!("[Engine] Shut down");
    }

    /// Renders one block. Before `initialize` (or after `shutdown`) the
    /// output is silence.
    pub fn process(&mut self, out_l: &mut [f32], out_r: &mut [f32]) {
        if !self.initialized {
            out_l.fill(0.0);
            out_r.fill(0.0);
            return;
        }

        let frames = out_l.len().min(out_r.len());
        out_l[frames..].fill(0.0);
        out_r[frames..].fill(0.0);

        self.buffers.clear_events();
        self.drain_commands();

        let chunk = self.buffers.max_frames();
        let mut start = 0;
        while start < frames {
            let end = (start + chunk).min(frames);
            if start > 0 {
                self.buffers.clear_events();
            }
            self.process_chunk(&mut out_l[start..end], &mut out_r[start..end]);
            start = end;
        }

        self.publish_transport();
        if self.sequencer.is_playing() {
            self.listeners.playhead_moved(self.sequencer.position_beats());
        }
    }

    fn process_chunk(&mut self, out_l: &mut [f32], out_r: &mut [f32]) {
        let frames = out_l.len();
        let info = TimeInfo::new(
            self.project.tempo,
            self.sequencer.position_beats(),
            self.sequencer.is_playing(),
        );
        for synth in self.synths.iter_mut().flatten() {
            synth.set_time_info(&info);
        }

        self.sequencer.process(&self.project, frames, self.sample_rate, &mut self.buffers);

        out_l.fill(0.0);
        out_r.fill(0.0);
        let audible = self.project.audible_voices();

        for voice in 0..NUM_VOICES {
            self.buffers.sort_events(voice);
            let Some(synth) = self.synths[voice].as_deref_mut() else {
                continue;
            };
            // Note-offs still go out so nothing hangs once the synth is back.
            if !synth.is_ready() || !audible[voice] {
                self.buffers.release_only(voice, synth);
                continue;
            }

            let (gain_l, gain_r) = self.project.voices[voice].pan_gains();
            let (voice_l, voice_r) = self.buffers.render_voice(voice, synth, frames);
            mix_voice(out_l, out_r, voice_l, voice_r, gain_l, gain_r);
        }

        apply_gain(out_l, out_r, self.project.master_volume);
    }

    fn drain_commands(&mut self) {
        while let Ok(command) = self.command_rx.try_recv() {
            self.apply_command(command);
        }
    }

    fn apply_command(&mut self, command: EngineCommand) {
        match command {
            EngineCommand::Play => self.sequencer.play(),
            EngineCommand::Stop => self.sequencer.stop(&mut self.buffers),
            EngineCommand::Seek(beat) => self.sequencer.set_position_beats(beat, &mut self.buffers),
            EngineCommand::SetTempo(tempo) => {
                if tempo > 0.0 && tempo.is_finite() {
                    self.project.tempo = tempo;
                }
            }
            EngineCommand::SetMasterVolume(volume) => self.project.master_volume = volume.max(0.0),
            EngineCommand::SetVoiceVolume { voice, volume } => {
                if let Some(v) = self.project.voice_mut(voice) {
                    v.volume = volume.max(0.0);
                }
            }
            EngineCommand::SetVoicePan { voice, pan } => {
                if let Some(v) = self.project.voice_mut(voice) {
                    v.pan = pan.clamp(-1.0, 1.0);
                }
            }
            EngineCommand::SetMute { voice, muted } => {
                if let Some(v) = self.project.voice_mut(voice) {
                    v.mute = muted;
                }
            }
            EngineCommand::SetSolo { voice, solo } => {
                if let Some(v) = self.project.voice_mut(voice) {
                    v.solo = solo;
                }
            }
            EngineCommand::SetActiveVoice(voice) => self.set_active_voice(voice),
        }
    }

    fn publish_transport(&self) {
        self.transport.publish(
            self.sequencer.is_playing(),
            self.sequencer.position_beats(),
            self.project.tempo,
        );
        for voice in 0..NUM_VOICES {
            self.transport.publish_sounding(voice, self.sequencer.sounding_mask(voice));
        }
    }

    // --- Synths ---

    /// Binds `synth` to `voice` and returns the previous one, silenced.
    pub fn set_synth(
        &mut self,
        voice: usize,
        mut synth: Box<dyn VoiceSynth>,
    ) -> Option<Box<dyn VoiceSynth>> {
        let Some(slot) = self.synths.get_mut(voice) else {
            log::warn!("[Engine] Ignoring synth for voice {} (only {} voices)", voice, NUM_VOICES);
            return None;
        };
        synth.set_sample_rate(self.sample_rate as f32);
        log::debug!("[Engine] Bound synth '{}' to voice {}", synth.patch_name(), voice);
        let mut previous = slot.replace(synth);
        if let Some(old) = previous.as_deref_mut() {
            old.all_notes_off();
        }
        previous
    }

    pub fn take_synth(&mut self, voice: usize) -> Option<Box<dyn VoiceSynth>> {
        let mut synth = self.synths.get_mut(voice)?.take()?;
        synth.all_notes_off();
        Some(synth)
    }

    pub fn synth(&self, voice: usize) -> Option<&dyn VoiceSynth> {
        self.synths.get(voice)?.as_deref()
    }

    pub fn synth_mut(&mut self, voice: usize) -> Option<&mut (dyn VoiceSynth + 'static)> {
        self.synths.get_mut(voice)?.as_deref_mut()
    }

    /// Pulls patch bytes and names from every bound synth into the project.
    pub fn capture_all_voices(&mut self) {
        let slots = self.project.voices.iter_mut().zip(self.synths.iter_mut());
        for (index, (voice, slot)) in slots.enumerate() {
            if let Some(synth) = slot.as_deref_mut() {
                voice.patch_data = synth.save_raw_patch();
                let name = synth.patch_name();
                voice.name = if name.is_empty() { "Voice".to_string() } else { name };
                let bytes = voice.patch_data.len();
                log::debug!("[Engine] Captured voice {} ({} patch bytes)", index, bytes);
            }
        }
    }

    /// Pushes stored patches back into the bound synths.
    pub fn restore_all_voices(&mut self) {
        let slots = self.project.voices.iter().zip(self.synths.iter_mut());
        for (index, (voice, slot)) in slots.enumerate() {
            if let Some(synth) = slot.as_deref_mut() {
                if !voice.patch_data.is_empty() {
                    synth.load_raw_patch(&voice.patch_data);
                    let bytes = voice.patch_data.len();
                    log::debug!("[Engine] Restored voice {} ({} patch bytes)", index, bytes);
                }
            }
        }
    }

    // --- Project ---

    pub fn project(&self) -> &Project {
        &self.project
    }

    pub fn project_mut(&mut self) -> &mut Project {
        &mut self.project
    }

    pub fn pattern(&self, voice: usize) -> Option<&Pattern> {
        self.project.pattern(voice)
    }

    /// Runs `edit` on a voice's pattern and notifies listeners.
    pub fn edit_pattern<R>(
        &mut self,
        voice: usize,
        edit: impl FnOnce(&mut Pattern) -> R,
    ) -> Option<R> {
        let result = edit(self.project.pattern_mut(voice)?);
        self.listeners.pattern_changed(voice);
        Some(result)
    }

    pub fn save_project(&mut self, path: impl AsRef<Path>) -> Result<(), ProjectError> {
        self.capture_all_voices();
        self.project.save_to_file(path)
    }

    pub fn load_project(&mut self, path: impl AsRef<Path>) -> Result<(), ProjectError> {
        let path = path.as_ref();
        let bytes = std::fs::read(path)?;
        self.load_state(&bytes)?;
        log::info!("[Engine] Loaded project {:?}", path);
        Ok(())
    }

    /// Host state blob: the full project container with current patches.
    pub fn save_state(&mut self) -> Result<Vec<u8>, ProjectError> {
        self.capture_all_voices();
        self.project.touch_modified();
        self.project.to_bytes()
    }

    /// Replaces the project from a state blob. Held notes are released and
    /// the playhead stays where it is. A bad blob changes nothing.
    pub fn load_state(&mut self, data: &[u8]) -> Result<(), ProjectError> {
        let project = Project::from_bytes(data).inspect_err(|e| {
            log::warn!("[Engine] Rejected project state: {}", e);
        })?;

        let position = self.sequencer.position_beats();
        self.sequencer.set_position_beats(
            position,
            &mut DirectSink {
                synths: &mut self.synths,
            },
        );
        self.project = project;
        self.restore_all_voices();
        self.publish_transport();
        for voice in 0..NUM_VOICES {
            self.listeners.pattern_changed(voice);
        }
        log::info!("[Engine] Project state loaded: '{}'", self.project.project_name);
        Ok(())
    }

    // --- Transport ---

    pub fn play(&mut self) {
        self.sequencer.play();
        self.publish_transport();
    }

    /// Stops, releasing held notes on the synths immediately.
    pub fn stop(&mut self) {
        self.sequencer.stop(&mut DirectSink {
            synths: &mut self.synths,
        });
        self.publish_transport();
    }

    pub fn set_playing(&mut self, playing: bool) {
        if playing {
            self.play();
        } else {
            self.stop();
        }
    }

    pub fn set_position_beats(&mut self, beat: f64) {
        self.sequencer.set_position_beats(
            beat,
            &mut DirectSink {
                synths: &mut self.synths,
            },
        );
        self.publish_transport();
    }

    pub fn is_playing(&self) -> bool {
        self.sequencer.is_playing()
    }

    pub fn playhead_beats(&self) -> f64 {
        self.sequencer.position_beats()
    }

    pub fn loop_end_beats(&self) -> f64 {
        self.sequencer.loop_end_beat(&self.project)
    }

    pub fn playing_notes(&self, voice: usize) -> Vec<u8> {
        self.sequencer.playing_notes(voice).collect()
    }

    pub fn transport_handle(&self) -> TransportHandle {
        self.transport.clone()
    }

    pub fn command_sender(&self) -> Sender<EngineCommand> {
        self.command_tx.clone()
    }

    // --- Selection and listeners ---

    pub fn active_voice(&self) -> usize {
        self.active_voice
    }

    pub fn set_active_voice(&mut self, voice: usize) {
        if voice >= NUM_VOICES {
            return;
        }
        self.active_voice = voice;
        self.listeners.voice_changed(voice);
    }

    pub fn add_listener(&mut self, listener: Box<dyn EngineListener>) -> ListenerId {
        self.listeners.add(listener)
    }

    pub fn remove_listener(&mut self, id: ListenerId) -> bool {
        self.listeners.remove(id)
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::synth::SineSynth;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex};

    #[derive(Debug, Clone, PartialEq)]
    enum Call {
        On(u8),
        Off(u8),
        AllOff,
        Load(Vec<u8>),
    }

    /// Outputs a constant 1.0 while any note is held and logs every call.
    struct MockSynth {
        name: String,
        patch: Vec<u8>,
        held: Vec<u8>,
        calls: Arc<Mutex<Vec<Call>>>,
        ready: Arc<AtomicBool>,
    }

    impl MockSynth {
        fn new(name: &str, calls: Arc<Mutex<Vec<Call>>>) -> Self {
            Self {
                name: name.to_string(),
                patch: name.as_bytes().to_vec(),
                held: Vec::new(),
                calls,
                ready: Arc::new(AtomicBool::new(true)),
            }
        }
    }

    impl VoiceSynth for MockSynth {
        fn render_block(&mut self, left: &mut [f32], right: &mut [f32]) {
            let level = if self.held.is_empty() { 0.0 } else { 1.0 };
            left.fill(level);
            right.fill(level);
        }
        fn play_note(&mut self, _channel: u8, pitch: u8, _velocity: u8, _detune: i32, _id: i32) {
            self.held.push(pitch);
            self.calls.lock().unwrap().push(Call::On(pitch));
        }
        fn release_note(&mut self, _channel: u8, pitch: u8, _velocity: u8) {
            self.held.retain(|&p| p != pitch);
            self.calls.lock().unwrap().push(Call::Off(pitch));
        }
        fn all_notes_off(&mut self) {
            self.held.clear();
            self.calls.lock().unwrap().push(Call::AllOff);
        }
        fn save_raw_patch(&mut self) -> Vec<u8> {
            self.patch.clone()
        }
        fn load_raw_patch(&mut self, data: &[u8]) {
            self.patch = data.to_vec();
            self.calls.lock().unwrap().push(Call::Load(data.to_vec()));
        }
        fn patch_name(&self) -> String {
            self.name.clone()
        }
        fn is_ready(&self) -> bool {
            self.ready.load(Ordering::Relaxed)
        }
    }

    fn calls() -> Arc<Mutex<Vec<Call>>> {
        Arc::new(Mutex::new(Vec::new()))
    }

    fn small_config() -> EngineConfig {
        EngineConfig {
            max_block_size: 512,
            ..EngineConfig::default()
        }
    }

    /// Engine at 1 kHz, 120 BPM: one sample is 0.002 beats.
    fn engine_with_mock(log: &Arc<Mutex<Vec<Call>>>) -> Engine {
        let mut engine = Engine::new(small_config());
        engine.set_synth(0, Box::new(MockSynth::new("Lead", log.clone())));
        assert!(engine.initialize(1000.0, 100));
        engine
    }

    #[test]
    fn test_uninitialized_process_is_silent() {
        let mut engine = Engine::default();
        let mut l = vec![1.0f32; 64];
        let mut r = vec![1.0f32; 64];
        engine.process(&mut l, &mut r);
        assert!(l.iter().chain(r.iter()).all(|&s| s == 0.0));
    }

    #[test]
    fn test_initialize_is_idempotent_and_names_voices() {
        let log = calls();
        let mut engine = Engine::default();
        engine.set_synth(1, Box::new(MockSynth::new("", log.clone())));
        engine.set_synth(2, Box::new(MockSynth::new("Pad", log.clone())));
        assert!(!engine.initialize(0.0, 64));
        assert!(engine.initialize(48000.0, 64));

        assert_eq!(engine.project().voices[0].name, "Voice 1");
        assert_eq!(engine.project().voices[1].name, "Init");
        assert_eq!(engine.project().voices[2].name, "Pad");

        engine.project_mut().tempo = 99.0;
        assert!(engine.initialize(44100.0, 128));
        assert_eq!(engine.project().tempo, 99.0);
        assert_eq!(engine.sample_rate(), 48000.0);
    }

    #[test]
    fn test_note_plays_and_mixes_with_pan_and_master() {
        let log = calls();
        let mut engine = engine_with_mock(&log);
        engine.edit_pattern(0, |p| p.add_note(0.05, 1.0, 60, 100));
        {
            let project = engine.project_mut();
            project.voices[0].pan = 0.5;
            project.voices[0].volume = 0.5;
            project.master_volume = 0.5;
        }
        engine.play();

        let mut l = vec![0.0f32; 100];
        let mut r = vec![0.0f32; 100];
        engine.process(&mut l, &mut r);

        // Note starts 0.05 beats (25 samples) in.
        assert!(l[..24].iter().all(|&s| s == 0.0));
        assert!((l[30] - 0.125).abs() < 1e-6);
        assert!((r[30] - 0.25).abs() < 1e-6);
        assert_eq!(engine.playing_notes(0), vec![60]);
        assert_eq!(engine.transport_handle().playing_notes(0), vec![60]);
        assert!(engine.transport_handle().is_playing());
    }

    #[test]
    fn test_stop_releases_held_notes_on_synth() {
        let log = calls();
        let mut engine = engine_with_mock(&log);
        engine.edit_pattern(0, |p| p.add_note(0.0, 3.0, 62, 100));
        engine.play();
        let mut l = vec![0.0f32; 100];
        let mut r = vec![0.0f32; 100];
        engine.process(&mut l, &mut r);

        engine.stop();
        assert!(!engine.is_playing());
        assert_eq!(engine.playhead_beats(), 0.0);
        assert!(engine.playing_notes(0).is_empty());
        assert_eq!(*log.lock().unwrap(), vec![Call::On(62), Call::Off(62)]);
    }

    #[test]
    fn test_commands_are_applied_at_block_start() {
        let log = calls();
        let mut engine = engine_with_mock(&log);
        engine.edit_pattern(0, |p| p.add_note(0.0, 0.5, 60, 100));
        let tx = engine.command_sender();

        tx.send(EngineCommand::SetTempo(60.0)).unwrap();
        tx.send(EngineCommand::SetVoicePan { voice: 0, pan: 4.0 }).unwrap();
        tx.send(EngineCommand::SetMute { voice: 9, muted: true }).unwrap();
        tx.send(EngineCommand::SetActiveVoice(3)).unwrap();
        tx.send(EngineCommand::Play).unwrap();

        let mut l = vec![0.0f32; 100];
        let mut r = vec![0.0f32; 100];
        engine.process(&mut l, &mut r);

        assert_eq!(engine.project().tempo, 60.0);
        assert_eq!(engine.project().voices[0].pan, 1.0);
        assert_eq!(engine.active_voice(), 3);
        assert!(engine.is_playing());
        // 60 BPM at 1 kHz: 100 samples is 0.1 beats.
        assert!((engine.playhead_beats() - 0.1).abs() < 1e-9);
        assert_eq!(log.lock().unwrap()[0], Call::On(60));

        tx.send(EngineCommand::Stop).unwrap();
        engine.process(&mut l, &mut r);
        assert!(!engine.is_playing());
        assert_eq!(log.lock().unwrap().last(), Some(&Call::Off(60)));
        assert!(l.iter().all(|&s| s == 0.0));
    }

    #[test]
    fn test_muted_voice_still_receives_note_offs() {
        let log = calls();
        let mut engine = engine_with_mock(&log);
        engine.edit_pattern(0, |p| p.add_note(0.0, 0.3, 60, 100));
        engine.play();

        let mut l = vec![0.0f32; 100];
        let mut r = vec![0.0f32; 100];
        engine.process(&mut l, &mut r);
        engine.project_mut().voices[0].mute = true;
        engine.process(&mut l, &mut r);

        assert!(l.iter().all(|&s| s == 0.0));
        assert_eq!(*log.lock().unwrap(), vec![Call::On(60), Call::Off(60)]);
    }

    #[test]
    fn test_unready_synth_is_skipped() {
        let log = calls();
        let mut engine = Engine::new(small_config());
        let synth = MockSynth::new("Lead", log.clone());
        synth.ready.store(false, Ordering::Relaxed);
        engine.set_synth(0, Box::new(synth));
        engine.initialize(1000.0, 100);
        engine.edit_pattern(0, |p| p.add_note(0.0, 1.0, 60, 100));
        engine.play();

        let mut l = vec![0.0f32; 100];
        let mut r = vec![0.0f32; 100];
        engine.process(&mut l, &mut r);
        assert!(log.lock().unwrap().is_empty());
    }

    #[test]
    fn test_unready_synth_still_gets_note_offs() {
        let log = calls();
        let mut engine = Engine::new(small_config());
        let synth = MockSynth::new("Lead", log.clone());
        let ready = synth.ready.clone();
        engine.set_synth(0, Box::new(synth));
        engine.initialize(1000.0, 100);
        // Ends at sample 150, in the second block.
        engine.edit_pattern(0, |p| p.add_note(0.0, 0.3, 60, 100));
        engine.play();

        let mut l = vec![0.0f32; 100];
        let mut r = vec![0.0f32; 100];
        engine.process(&mut l, &mut r);
        ready.store(false, Ordering::Relaxed);
        engine.process(&mut l, &mut r);
        ready.store(true, Ordering::Relaxed);
        engine.process(&mut l, &mut r);

        assert_eq!(*log.lock().unwrap(), vec![Call::On(60), Call::Off(60)]);
        assert!(l.iter().all(|&s| s == 0.0));
    }

    #[test]
    fn test_long_host_block_is_chunked() {
        let log = calls();
        let mut engine = engine_with_mock(&log);
        // 0.05 beats is sample 25; 1.2 beats is sample 600, inside the second 512-frame chunk.
        engine.edit_pattern(0, |p| {
            p.add_note(0.05, 0.1, 60, 100);
            p.add_note(1.2, 0.1, 64, 100);
        });
        engine.play();

        let mut l = vec![0.0f32; 1500];
        let mut r = vec![0.0f32; 1500];
        engine.process(&mut l, &mut r);

        assert_eq!(l[30], 1.0 * 0.8);
        assert_eq!(l[620], 1.0 * 0.8);
        assert_eq!(l[100], 0.0);
        assert_eq!(
            *log.lock().unwrap(),
            vec![Call::On(60), Call::Off(60), Call::On(64), Call::Off(64)]
        );
        assert!((engine.playhead_beats() - 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_capture_and_restore_voices() {
        let log = calls();
        let mut engine = engine_with_mock(&log);
        engine.set_synth(1, Box::new(MockSynth::new("", log.clone())));
        engine.capture_all_voices();

        assert_eq!(engine.project().voices[0].patch_data, b"Lead".to_vec());
        assert_eq!(engine.project().voices[0].name, "Lead");
        assert_eq!(engine.project().voices[1].name, "Voice");
        assert_eq!(engine.project().voices[2].name, "Voice 3");

        log.lock().unwrap().clear();
        engine.project_mut().voices[0].patch_data = vec![1, 2, 3];
        engine.restore_all_voices();
        // Voice 1 has an empty patch, so only voice 0 loads.
        assert_eq!(*log.lock().unwrap(), vec![Call::Load(vec![1, 2, 3])]);
    }

    #[test]
    fn test_state_blob_round_trip_keeps_playhead() {
        let log = calls();
        let mut engine = engine_with_mock(&log);
        engine.edit_pattern(0, |p| p.add_note(0.0, 3.0, 60, 100));
        engine.project_mut().tempo = 128.0;
        let blob = engine.save_state().unwrap();

        engine.play();
        let mut l = vec![0.0f32; 100];
        let mut r = vec![0.0f32; 100];
        engine.process(&mut l, &mut r);
        let position = engine.playhead_beats();
        engine.project_mut().tempo = 70.0;
        log.lock().unwrap().clear();

        engine.load_state(&blob).unwrap();
        assert_eq!(engine.project().tempo, 128.0);
        assert_eq!(engine.playhead_beats(), position);
        assert!(engine.playing_notes(0).is_empty());
        assert_eq!(
            *log.lock().unwrap(),
            vec![Call::Off(60), Call::Load(b"Lead".to_vec())]
        );

        assert!(engine.load_state(b"garbage").is_err());
        assert_eq!(engine.project().tempo, 128.0);
    }

    #[test]
    fn test_project_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.sbox");
        let log = calls();
        let mut engine = engine_with_mock(&log);
        engine.edit_pattern(0, |p| p.add_note(1.0, 0.5, 72, 90));
        engine.save_project(&path).unwrap();

        let mut other = Engine::new(small_config());
        other.set_synth(0, Box::new(MockSynth::new("Other", log.clone())));
        other.initialize(1000.0, 100);
        other.load_project(&path).unwrap();
        assert_eq!(other.project().voices[0].pattern.notes()[0].pitch, 72);
        assert_eq!(other.project().voices[0].name, "Lead");
        assert_eq!(other.synth(0).map(|s| s.patch_name()), Some("Other".to_string()));
    }

    #[derive(Default)]
    struct Events {
        voices: Vec<usize>,
        patterns: Vec<usize>,
        playheads: usize,
    }

    struct Recorder(Arc<Mutex<Events>>);

    impl EngineListener for Recorder {
        fn voice_changed(&mut self, voice: usize) {
            self.0.lock().unwrap().voices.push(voice);
        }
        fn playhead_moved(&mut self, _beat: f64) {
            self.0.lock().unwrap().playheads += 1;
        }
        fn pattern_changed(&mut self, voice: usize) {
            self.0.lock().unwrap().patterns.push(voice);
        }
    }

    #[test]
    fn test_listeners_and_shutdown() {
        let log = calls();
        let events = Arc::new(Mutex::new(Events::default()));
        let mut engine = engine_with_mock(&log);
        let id = engine.add_listener(Box::new(Recorder(events.clone())));

        engine.set_active_voice(2);
        engine.set_active_voice(7);
        assert_eq!(engine.active_voice(), 2);
        engine.edit_pattern(1, |p| p.add_note(0.0, 1.0, 60, 100));
        assert!(engine.edit_pattern(4, |p| p.clear()).is_none());

        let mut l = vec![0.0f32; 16];
        let mut r = vec![0.0f32; 16];
        engine.process(&mut l, &mut r);
        engine.play();
        engine.process(&mut l, &mut r);
        engine.process(&mut l, &mut r);

        {
            let events = events.lock().unwrap();
            assert_eq!(events.voices, vec![2]);
            assert_eq!(events.patterns, vec![1]);
            assert_eq!(events.playheads, 2);
        }

        engine.shutdown();
        engine.shutdown();
        assert_eq!(engine.listener_count(), 0);
        assert!(!engine.remove_listener(id));
        assert!(engine.synth(0).is_none());
        assert_eq!(log.lock().unwrap().last(), Some(&Call::AllOff));

        engine.process(&mut l, &mut r);
        assert!(l.iter().all(|&s| s == 0.0));
    }

    #[test]
    fn test_sine_synth_renders_through_engine() {
        let mut engine = Engine::default();
        engine.set_synth(0, Box::new(SineSynth::new(44100.0)));
        engine.initialize(44100.0, 512);
        engine.edit_pattern(0, |p| p.add_note(0.0, 1.0, 69, 127));
        engine.play();

        let mut l = vec![0.0f32; 512];
        let mut r = vec![0.0f32; 512];
        engine.process(&mut l, &mut r);
        assert!(l.iter().any(|&s| s.abs() > 1e-4));
        assert_eq!(l, r);
    }
}
