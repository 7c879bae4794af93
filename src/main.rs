use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::{Duration, Instant};

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use hark::lifecycle::{self, ServiceConfig};
use hark::voice::{
    Activity, AudioFrame, AudioSource, CpalSource, FrameSegmenter, VoiceActivityGate,
    list_input_devices,
};
use hark::{Config, Daemon};

/// Hark - resident wake-word listener for a local assistant
#[derive(Parser)]
#[command(name = "hark", version, about)]
struct Cli {
    /// Settings endpoint polled for listener settings
    #[arg(long, env = "HARK_SETTINGS_URL")]
    settings_url: Option<String>,

    /// Endpoint wake triggers are POSTed to
    #[arg(long, env = "HARK_TRIGGER_URL")]
    trigger_url: Option<String>,

    /// Seconds between settings polls
    #[arg(long, env = "HARK_POLL_INTERVAL_SECS")]
    poll_interval_secs: Option<u64>,

    /// Input device index used until the settings endpoint names one
    #[arg(long, env = "HARK_DEVICE")]
    device: Option<usize>,

    /// Config file (defaults to ~/.config/omni/hark/config.toml)
    #[arg(long, env = "HARK_CONFIG")]
    config: Option<PathBuf>,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Install hark as an auto-start service
    Install,
    /// Uninstall the hark service
    Uninstall,
    /// Show service status
    Status,
    /// Tail the service log file
    Logs {
        /// Number of lines to show
        #[arg(short, long, default_value = "50")]
        lines: usize,
        /// Follow log output
        #[arg(short, long)]
        follow: bool,
    },
    /// Test microphone input and the voice activity gate
    TestMic {
        /// Duration in seconds
        #[arg(short, long, default_value = "5")]
        duration: u64,
        /// Input device index
        #[arg(long)]
        device: Option<usize>,
    },
    /// List input devices
    Devices,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Set up logging based on verbosity
    let filter = match cli.verbose {
        0 => "info,hark=info",
        1 => "info,hark=debug",
        2 => "debug",
        _ => "trace",
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("fatal: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    if let Some(cmd) = cli.command {
        return match cmd {
            Command::Install => cmd_install(
                cli.settings_url.as_deref(),
                cli.trigger_url.as_deref(),
                cli.config.as_deref(),
            ),
            Command::Uninstall => cmd_uninstall(),
            Command::Status => cmd_status(),
            Command::Logs { lines, follow } => cmd_logs(lines, follow),
            Command::TestMic { duration, device } => {
                let config = Config::load(cli.config.as_deref())?;
                test_mic(&config, duration, device.or(cli.device)).await
            }
            Command::Devices => cmd_devices(),
        };
    }

    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(url) = cli.settings_url {
        config.settings_url = url;
    }
    if let Some(url) = cli.trigger_url {
        config.trigger_url = url;
    }
    if let Some(secs) = cli.poll_interval_secs {
        config.poll_interval = Duration::from_secs(secs);
    }
    if let Some(index) = cli.device {
        config.listener.device_index = Some(index);
    }
    config.validate()?;
    tracing::debug!(?config, "loaded configuration");

    Daemon::new(config)?.run().await?;
    Ok(())
}

/// Install hark as an auto-start service
fn cmd_install(
    settings_url: Option<&str>,
    trigger_url: Option<&str>,
    config_path: Option<&Path>,
) -> anyhow::Result<()> {
    let binary = std::env::current_exe()?;
    let mut extra_args = Vec::new();
    if let Some(url) = settings_url {
        extra_args.extend(["--settings-url".to_string(), url.to_string()]);
    }
    if let Some(url) = trigger_url {
        extra_args.extend(["--trigger-url".to_string(), url.to_string()]);
    }
    if let Some(path) = config_path {
        extra_args.extend(["--config".to_string(), path.display().to_string()]);
    }

    lifecycle::install_service(&ServiceConfig {
        binary_path: binary,
        extra_args,
    })?;
    println!("Hark installed as auto-start service");
    Ok(())
}

/// Uninstall the hark service
fn cmd_uninstall() -> anyhow::Result<()> {
    lifecycle::uninstall_service()?;
    println!("Hark service removed");
    Ok(())
}

/// Show service status
fn cmd_status() -> anyhow::Result<()> {
    let status = lifecycle::service_status()?;
    println!("Hark service: {status}");
    Ok(())
}

/// Tail the service log file
fn cmd_logs(lines: usize, follow: bool) -> anyhow::Result<()> {
    let log_path =
        lifecycle::log_path().ok_or_else(|| anyhow::anyhow!("could not determine log path"))?;

    if !log_path.exists() {
        anyhow::bail!("log file not found: {}", log_path.display());
    }

    let mut args = vec![format!("-n{lines}"), log_path.display().to_string()];
    if follow {
        args.insert(0, "-f".to_string());
    }

    let status = std::process::Command::new("tail").args(&args).status()?;

    if !status.success() {
        anyhow::bail!("tail exited with {status}");
    }

    Ok(())
}

/// List input devices with their indices
fn cmd_devices() -> anyhow::Result<()> {
    let devices = list_input_devices()?;
    if devices.is_empty() {
        println!("No input devices found");
    }
    for (index, name) in devices {
        println!("[{index}] {name}");
    }
    Ok(())
}

/// Print per-second RMS and gate decisions
async fn test_mic(config: &Config, duration: u64, device: Option<usize>) -> anyhow::Result<()> {
    println!("Testing microphone for {duration} seconds...");
    println!("Speak into your microphone!\n");

    let source = CpalSource::new(config.audio.sample_rate, config.audio.stall_timeout);
    let mut stream = source.open(device)?;
    let sample_rate = stream.sample_rate();
    let mut gate = VoiceActivityGate::new(config.vad.clone());

    println!("Sample rate: {sample_rate} Hz");
    println!("---");

    let mut second = Vec::with_capacity(sample_rate as usize);
    let mut speech_frames = 0usize;
    let mut frames = 0usize;
    let mut segmenter = FrameSegmenter::new(sample_rate, config.audio.frame_ms)?;
    let deadline = Instant::now() + Duration::from_secs(duration);
    let mut elapsed = 0;

    while Instant::now() < deadline {
        let Some(chunk) = stream.next_chunk().await? else {
            break;
        };
        second.extend_from_slice(&chunk);

        for frame in segmenter.push(&chunk) {
            frames += 1;
            if gate.classify(&frame) == Activity::Speech {
                speech_frames += 1;
            }
        }

        if second.len() >= sample_rate as usize {
            elapsed += 1;
            let energy = AudioFrame::new(std::mem::take(&mut second), sample_rate, 0).rms();

            // Visual meter
            #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
            let meter_len = (energy / 200.0).min(50.0) as usize;
            let meter: String = "█".repeat(meter_len) + &" ".repeat(50 - meter_len);

            println!(
                "[{elapsed:2}s] RMS: {energy:7.1} | speech frames: {speech_frames:2}/{frames:2} | [{meter}]"
            );
            speech_frames = 0;
            frames = 0;
        }
    }

    stream.close();

    println!("\n---");
    println!("If you saw movement in the meter, your mic is working!");
    println!("If speech frames stayed at 0 while talking, check:");
    println!("  1. Is the right device selected? Run: hark devices");
    println!("  2. Run: pactl info | grep 'Default Source'");
    println!("  3. Try: pavucontrol (to check levels)");

    Ok(())
}
