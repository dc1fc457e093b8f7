use std::io::Write as _;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use parley::assistant::{self, Assistant, Mode};
use parley::audio::{self, CpalInput, InputDevice, MicStreamManager, frames_for, samples_to_wav};
use parley::hotword::HotwordMatcher;
use parley::startup;
use parley::voice::{CpalPlayer, PlaybackOutcome, Player};
use parley::{CancellationToken, Config, LoadOptions};

/// Parley - a turn-taking voice assistant
#[derive(Parser)]
#[command(name = "parley", version, about)]
struct Cli {
    /// Config file (defaults to ~/.config/parley/config.toml)
    #[arg(short, long, env = "PARLEY_CONFIG")]
    config: Option<PathBuf>,

    /// Directory for the store, history and recordings
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
#[allow(clippy::enum_variant_names)]
enum Command {
    /// Run the conversation loop (default)
    Run {
        /// Use synthetic silence and silent playback instead of hardware
        #[arg(long)]
        simulate: bool,
    },
    /// Test microphone input
    TestMic {
        /// Duration in seconds
        #[arg(short, long, default_value = "5")]
        duration: u64,
    },
    /// Test speaker output
    TestSpeaker,
    /// Test TTS output
    TestTts {
        /// Text to speak
        #[arg(default_value = "Hello! This is a test of the text to speech system.")]
        text: String,
    },
    /// List input and output devices
    Devices,
    /// Run startup diagnostics and exit
    Check,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // RUST_LOG wins over -v
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(match cli.verbose {
            0 => "info,parley=info",
            1 => "info,parley=debug",
            2 => "debug",
            _ => "trace",
        })
    });

    tracing_subscriber::fmt().with_env_filter(filter).init();

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!("fatal: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    let options = LoadOptions {
        config_path: cli.config,
        data_dir: cli.data_dir,
    };
    let config = Config::load(&options);
    tracing::debug!(source = %config.source_display(), "loaded configuration");

    let command = cli.command.unwrap_or(Command::Run { simulate: false });
    match command {
        Command::Run { simulate } => {
            let mode = if simulate {
                Mode::Simulated
            } else {
                Mode::Hardware
            };
            run_assistant(config, mode).await?;
            Ok(ExitCode::SUCCESS)
        }
        Command::TestMic { duration } => {
            blocking(move || test_mic(&config, duration)).await?;
            Ok(ExitCode::SUCCESS)
        }
        Command::TestSpeaker => {
            blocking(move || test_speaker(&config)).await?;
            Ok(ExitCode::SUCCESS)
        }
        Command::TestTts { text } => {
            blocking(move || test_tts(&config, &text)).await?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Devices => {
            blocking(list_devices).await?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Check => blocking(move || check(&config)).await,
    }
}

/// Run a blocking diagnostic off the async runtime
async fn blocking<T: Send + 'static>(
    work: impl FnOnce() -> anyhow::Result<T> + Send + 'static,
) -> anyhow::Result<T> {
    tokio::task::spawn_blocking(work).await?
}

/// Build and run the assistant until an exit word or Ctrl-C
async fn run_assistant(config: Config, mode: Mode) -> anyhow::Result<()> {
    tracing::info!(mode = ?mode, "starting parley");

    let shutdown = CancellationToken::new();
    let token = shutdown.clone();
    let mut worker = tokio::task::spawn_blocking(move || -> anyhow::Result<()> {
        let assistant = Assistant::build(&config, mode, token)?;
        assistant.run();
        Ok(())
    });

    tokio::select! {
        result = &mut worker => return result?,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("interrupt received, shutting down");
            shutdown.cancel("shutdown");
        }
    }

    worker.await?
}

/// Test microphone input
fn test_mic(config: &Config, duration: u64) -> anyhow::Result<()> {
    println!("Testing microphone for {duration} seconds...");
    println!("Speak into your microphone!\n");

    let mic = MicStreamManager::new(Arc::new(CpalInput::new()), config.mic_settings());
    mic.initialize_device()?;
    if mic.create_stream().is_none() {
        anyhow::bail!("could not open an input stream");
    }
    mic.set_listening(true);

    let sample_rate = mic.sample_rate();
    println!("Sample rate: {sample_rate} Hz");
    println!("---");

    let lease = mic.acquire_capture()?;
    let second = frames_for(Duration::from_secs(1), sample_rate);
    for i in 0..duration {
        let samples = lease.read(second, config.audio.read_timeout + Duration::from_secs(1))?;
        let energy = audio::rms_energy(&samples);
        let peak = audio::peak_amplitude(&samples);

        // Visual meter
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let meter_len = (energy * 100.0).min(50.0) as usize;
        let meter: String = "█".repeat(meter_len) + &" ".repeat(50 - meter_len);

        println!("[{:2}s] RMS: {energy:.4} | Peak: {peak:.4} | [{meter}]", i + 1);
    }
    drop(lease);
    mic.shutdown();

    println!("\n---");
    println!("If you saw movement in the meter, your mic is working!");
    println!("If RMS stayed near 0, check:");
    println!("  1. Is your mic plugged in?");
    println!("  2. Run: parley devices");
    println!("  3. Set PARLEY_INPUT_DEVICE to a listed device name");

    Ok(())
}

/// Play a clip and report how it ended
fn play_clip(config: &Config, path: &std::path::Path) -> anyhow::Result<()> {
    let player = CpalPlayer::new(config.audio.playback_slack, config.watchdog);
    match player.play(path, &CancellationToken::new())? {
        PlaybackOutcome::Completed => Ok(()),
        outcome => anyhow::bail!("playback did not complete: {outcome:?}"),
    }
}

/// Test speaker output with a sine wave
fn test_speaker(config: &Config) -> anyhow::Result<()> {
    println!("Testing speaker output...");
    println!("You should hear a 440Hz tone for 2 seconds\n");

    let sample_rate = 24000_u32;
    let frequency = 440.0_f32;
    let num_samples = frames_for(Duration::from_secs(2), sample_rate);

    #[allow(clippy::cast_precision_loss)]
    let samples: Vec<f32> = (0..num_samples)
        .map(|i| {
            let t = i as f32 / sample_rate as f32;
            (2.0 * std::f32::consts::PI * frequency * t).sin() * 0.3 // 30% volume
        })
        .collect();

    let mut clip = tempfile::Builder::new()
        .prefix("parley-tone-")
        .suffix(".wav")
        .tempfile()?;
    clip.write_all(&samples_to_wav(&samples, sample_rate)?)?;
    clip.flush()?;

    println!("Playing {} samples at {sample_rate} Hz...", samples.len());
    play_clip(config, clip.path())?;

    println!("\n---");
    println!("If you heard the tone, your speakers are working!");
    println!("If you didn't hear anything, check:");
    println!("  1. Run: parley devices");
    println!("  2. Run: pactl info | grep 'Default Sink'");
    println!("  3. Try: pavucontrol (to check output levels)");

    Ok(())
}

/// Test TTS output through the configured provider
fn test_tts(config: &Config, text: &str) -> anyhow::Result<()> {
    println!("Testing TTS with text: \"{text}\"\n");

    let synthesizer = assistant::build_synthesizer(config)?;
    println!("Synthesizing speech...");
    let path = synthesizer.synthesize(text, &config.speech.voice)?;
    println!("Got clip {}", path.display());

    println!("Playing audio...");
    let played = play_clip(config, &path);
    if let Err(e) = std::fs::remove_file(&path) {
        tracing::debug!(error = %e, path = %path.display(), "could not remove test clip");
    }
    played?;

    println!("\n---");
    println!("If you heard the speech, TTS is working!");

    Ok(())
}

/// List input and output devices
fn list_devices() -> anyhow::Result<()> {
    let input = CpalInput::new();
    input.initialize()?;
    let inputs = input.list_devices();
    input.terminate();

    println!("Input devices:");
    if inputs.is_empty() {
        println!("  (none)");
    }
    for name in inputs {
        println!("  {name}");
    }

    println!("Output devices:");
    let outputs = CpalPlayer::list_devices();
    if outputs.is_empty() {
        println!("  (none)");
    }
    for name in outputs {
        println!("  {name}");
    }
    Ok(())
}

/// Run startup diagnostics, including the hardware ones
fn check(config: &Config) -> anyhow::Result<ExitCode> {
    let store = assistant::open_store(config);
    let hotword = HotwordMatcher::new(config.hotword.clone(), Arc::clone(&store));

    let mic = MicStreamManager::new(Arc::new(CpalInput::new()), config.mic_settings());
    if let Err(e) = mic.initialize_device() {
        tracing::debug!(error = %e, "input device unavailable");
    } else {
        let _ = mic.create_stream();
    }
    let mut report = startup::run_checks(
        config,
        Some(startup::check_input(&mic)),
        &hotword,
        store.as_ref(),
    );
    report.checks.push(startup::check_output());
    mic.shutdown();

    print!("{report}");
    Ok(if report.has_failures() {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    })
}
