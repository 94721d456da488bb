//! MBSS demo
//!
//! Usage:
//!   mbss                              - BlinkIVA on the two-tone scene
//!   mbss --algo auxiva                - Audio-only baseline
//!   mbss --config sep.json            - Separation settings from JSON
//!   mbss --save-trace trace.json      - Keep the SDR/SIR trace

use std::f64::consts::PI;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{Parser, ValueEnum};
use mbss_core::{Algorithm, SeparationConfig, SeparationStatus, separate};
use mbss_sim::{ConvergenceTrace, FreeFieldScene, SceneConfig, sinusoid};
use ndarray::array;

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Algo {
    /// Time-varying Gaussian AuxIVA (microphones only)
    Auxiva,
    /// Blinky-informed IVA
    Blinkiva,
}

impl From<Algo> for Algorithm {
    fn from(algo: Algo) -> Self {
        match algo {
            Algo::Auxiva => Algorithm::AuxIvaGauss,
            Algo::Blinkiva => Algorithm::BlinkIvaGauss,
        }
    }
}

#[derive(Parser)]
#[command(name = "mbss", about = "Multi-modal blind source separation demo")]
struct Cli {
    /// Separation algorithm
    #[arg(long, value_enum, default_value = "blinkiva")]
    algo: Algo,

    /// Separation settings as JSON (flags below override it)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Outer iterations
    #[arg(long)]
    n_iter: Option<usize>,

    /// NMF sub-iterations per outer iteration
    #[arg(long)]
    n_nmf_sub_iter: Option<usize>,

    /// Sparsity weight on the activations
    #[arg(long)]
    sparse_reg: Option<f64>,

    /// Initialization seed
    #[arg(long)]
    seed: Option<u64>,

    /// STFT frame size (hop is half of it)
    #[arg(long, default_value_t = 16)]
    framesize: usize,

    /// Microphone SNR in dB
    #[arg(long, default_value_t = 60.0)]
    snr: f64,

    /// First difference of the blinky signals
    #[arg(long)]
    pre_emphasis: bool,

    /// Evaluate every N iterations (0 = final output only)
    #[arg(long, default_value_t = 10)]
    trace_interval: usize,

    /// Write the convergence trace as JSON
    #[arg(long)]
    save_trace: Option<PathBuf>,
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    let config = separation_config(&cli)?;
    let scene_config = SceneConfig {
        sample_rate: 8000.0,
        frame_size: cli.framesize,
        hop: cli.framesize / 2,
        snr_db: Some(cli.snr),
        pre_emphasis: cli.pre_emphasis,
        ref_mic: config.ref_mic,
        seed: config.seed,
    };

    let scene = two_tone_scene(scene_config.sample_rate)?;
    let rendered = scene.render(&scene_config).context("Failed to render scene")?;
    let stft = scene_config.stft()?;

    println!(
        "{}: {} sources, {} mics, {} blinkies, {} frames x {} bins",
        config.algorithm.name(),
        scene.n_src(),
        scene.n_mics(),
        scene.n_blinkies(),
        rendered.mixture.dim().0,
        rendered.mixture.dim().1
    );

    let mut trace = ConvergenceTrace::new(&stft, &rendered.references);
    let result = separate(
        rendered.mixture.view(),
        rendered.blinky_power.view(),
        &config,
        None,
        Some(&mut trace),
    )
    .context("Separation failed")?;

    for entry in trace.entries() {
        println!(
            "  iter {:>4}  SDR {}  SIR {}",
            entry.iteration,
            format_db(&entry.sdr),
            format_db(&entry.sir)
        );
    }

    match &result.status {
        SeparationStatus::Completed => {}
        SeparationStatus::Converged { iteration } => println!("Converged at iteration {}", iteration),
        SeparationStatus::Aborted { iteration, failure } => {
            println!("Aborted at iteration {}: {}", iteration, failure)
        }
    }
    if result.degeneracies > 0 {
        println!("{} degenerate covariances were loaded", result.degeneracies);
    }

    let metrics = rendered.evaluate(&stft, result.output.view())?;
    println!(
        "Final after {} iterations: SDR {}  SIR {}  SAR {}",
        result.iterations,
        format_db(&metrics.sdr),
        format_db(&metrics.sir),
        format_db(&metrics.sar)
    );

    if let Some(path) = &cli.save_trace {
        trace
            .save(path)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        println!("Trace written to {}", path.display());
    }

    Ok(())
}

fn separation_config(cli: &Cli) -> Result<SeparationConfig> {
    let mut config = match &cli.config {
        Some(path) => load_config(path)?,
        None => SeparationConfig::new(2),
    };
    config.algorithm = cli.algo.into();
    if let Some(n_iter) = cli.n_iter {
        config.n_iter = n_iter;
    }
    if let Some(n_sub) = cli.n_nmf_sub_iter {
        config.n_nmf_sub_iter = n_sub;
    }
    if let Some(sparse_reg) = cli.sparse_reg {
        config.sparse_reg = sparse_reg;
    }
    if let Some(seed) = cli.seed {
        config.seed = seed;
    }
    config.observer_interval = cli.trace_interval;

    if config.n_src != 2 {
        bail!("The demo scene has 2 sources, config asks for {}", config.n_src);
    }
    config.validate()?;
    Ok(config)
}

fn load_config(path: &Path) -> Result<SeparationConfig> {
    let text = std::fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("Invalid separation config {}", path.display()))
}

/// Two modulated tones, four microphones, two blinkies
fn two_tone_scene(sample_rate: f64) -> Result<FreeFieldScene> {
    let len = sample_rate as usize;
    let s1 = sinusoid(1100.0, sample_rate, len, |t| 0.55 + 0.45 * (2.0 * PI * 3.0 * t).sin());
    let s2 = sinusoid(2900.0, sample_rate, len, |t| 0.55 + 0.45 * (2.0 * PI * 5.0 * t).cos());

    let mixing = array![[1.0, 0.6], [0.7, 1.0], [0.4, 0.9], [0.9, 0.3]];
    let blinky_gains = array![[1.0, 0.1], [0.2, 1.0]];
    Ok(FreeFieldScene::new(vec![s1, s2], mixing, blinky_gains)?)
}

fn format_db(values: &[f64]) -> String {
    let parts: Vec<String> = values.iter().map(|v| format!("{:6.2}", v)).collect();
    format!("[{}] dB", parts.join(", "))
}
