pub mod commands;
pub mod config;
pub mod engine; // Engine lives here
pub mod export;
pub mod listener;
pub mod mixer;
pub mod sequencer;
pub mod synth;
pub mod transport;

#[cfg(feature = "live-output")]
pub mod output;

// Re-exports
pub use commands::EngineCommand;
pub use config::EngineConfig;
pub use engine::Engine;
pub use listener::{EngineListener, ListenerId};
pub use sequencer::{ActiveNote, LoopPolicy, NoteSink, PlayState, Sequencer};
pub use synth::{SinePatch, SineSynth, VoiceSynth};
pub use transport::{TimeInfo, TransportHandle};
