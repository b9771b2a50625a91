//! sbox-render - offline renderer for SBOX projects
//!
//! Binds a sine synth to every voice, plays the project loop a number of
//! times and writes the result to a WAV file.

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use sbox_engine::export::{self, ExportBitDepth, ExportConfig};
use sbox_engine::{Engine, EngineConfig, SineSynth};
use sbox_shared::{Project, NUM_VOICES};
use std::path::PathBuf;

#[derive(Clone, Copy, Debug, ValueEnum)]
enum BitDepth {
    #[value(name = "16")]
    Int16,
    #[value(name = "24")]
    Int24,
    #[value(name = "32f")]
    Float32,
}

impl From<BitDepth> for ExportBitDepth {
    fn from(depth: BitDepth) -> Self {
        match depth {
            BitDepth::Int16 => ExportBitDepth::Int16,
            BitDepth::Int24 => ExportBitDepth::Int24,
            BitDepth::Float32 => ExportBitDepth::Float32,
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "sbox-render")]
#[command(version, about = "Render an SBOX groovebox project to WAV", long_about = None)]
struct Cli {
    /// Project file (.sbox). Renders a built-in demo when omitted.
    #[arg(value_name = "PROJECT")]
    project: Option<PathBuf>,

    /// Output WAV path
    #[arg(short, long, default_value = "out.wav")]
    out: PathBuf,

    /// Number of passes through the loop
    #[arg(short, long, default_value = "2")]
    loops: u32,

    #[arg(long, default_value = "48000")]
    sample_rate: u32,

    #[arg(long, default_value = "512")]
    block_size: usize,

    #[arg(long, value_enum, default_value = "24")]
    bit_depth: BitDepth,

    /// Scale the mix so the loudest sample hits full scale
    #[arg(long)]
    normalize: bool,

    /// Seconds rendered after the last loop
    #[arg(long, default_value = "1.0")]
    tail: f64,

    /// Also write one WAV per voice into this directory
    #[arg(long, value_name = "DIR")]
    stems: Option<PathBuf>,

    /// Engine config (JSON)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Print the project as JSON and exit
    #[arg(long)]
    dump_json: bool,

    /// Save the project (demo included) to this path before rendering
    #[arg(long, value_name = "FILE")]
    save_project: Option<PathBuf>,
}

fn demo_project() -> Project {
    let mut project = Project::new();
    project.project_name = "Demo".to_string();
    project.tempo = 118.0;
    project.loop_bars = 2;

    let bass = &mut project.voices[0];
    bass.pan = -0.2;
    for step in 0..8 {
        bass.pattern.add_note(step as f64, 0.45, if step % 4 == 3 { 43 } else { 36 }, 110);
    }

    let chords = &mut project.voices[1];
    chords.volume = 0.6;
    chords.pan = 0.3;
    for (bar, root) in [(0.0, 60u8), (4.0, 57)] {
        for interval in [0, 4, 7] {
            chords.pattern.add_note(bar, 3.5, root + interval, 80);
        }
    }

    let lead = &mut project.voices[2];
    lead.volume = 0.5;
    lead.pattern.set_bars(1);
    for (i, pitch) in [72u8, 74, 76, 79].into_iter().enumerate() {
        lead.pattern.add_note(i as f64 * 0.75, 0.5, pitch, 95);
    }

    project.voices[3].mute = true;
    project
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::default(),
    };

    let mut engine = Engine::new(config);
    for voice in 0..NUM_VOICES {
        engine.set_synth(voice, Box::new(SineSynth::new(cli.sample_rate as f32)));
    }
    if !engine.initialize(cli.sample_rate as f64, cli.block_size) {
        anyhow::bail!("Invalid sample rate {}", cli.sample_rate);
    }

    match &cli.project {
        Some(path) => engine
            .load_project(path)
            .with_context(|| format!("Failed to load project {}", path.display()))?,
        None => *engine.project_mut() = demo_project(),
    }

    if cli.dump_json {
        println!("{}", serde_json::to_string_pretty(engine.project())?);
        return Ok(());
    }

    if let Some(path) = &cli.save_project {
        engine
            .save_project(path)
            .with_context(|| format!("Failed to save project {}", path.display()))?;
    }

    let export_config = ExportConfig {
        sample_rate: cli.sample_rate,
        block_size: cli.block_size,
        bit_depth: cli.bit_depth.into(),
        normalize: cli.normalize,
        tail_seconds: cli.tail,
        ..ExportConfig::default()
    };

    let data = export::render_project(&mut engine, cli.loops, &export_config)?;
    export::write_wav(&cli.out, &data, &export_config)?;
    println!(
        "[Render] Wrote {} ({:.2} s)",
        cli.out.display(),
        data.len() as f64 / 2.0 / cli.sample_rate as f64
    );

    if let Some(dir) = &cli.stems {
        let stems = export::render_stems(&mut engine, cli.loops, &export_config)?;
        let paths = export::write_stems(dir, &stems, &export_config)?;
        println!("[Render] Wrote {} stems to {}", paths.len(), dir.display());
    }

    engine.shutdown();
    Ok(())
}
