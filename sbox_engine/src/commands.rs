/// Control-thread requests applied at the start of the next audio block.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum EngineCommand {
    Play,
    Stop,
    /// Jump to a beat, releasing held notes.
    Seek(f64),
    SetTempo(f64),
    SetMasterVolume(f32),
    SetVoiceVolume { voice: usize, volume: f32 },
    /// Clamped to [-1, 1].
    SetVoicePan { voice: usize, pan: f32 },
    SetMute { voice: usize, muted: bool },
    SetSolo { voice: usize, solo: bool },
    SetActiveVoice(usize),
}
