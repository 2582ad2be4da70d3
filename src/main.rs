use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};

use subtitle_coordinator::cache::MemoryCache;
use subtitle_coordinator::config::{self, AppConfig};
use subtitle_coordinator::{
    ContentSignature, MediaIdentity, MediaItem, SessionSnapshot, SessionState, TerminalState,
    TranscriptionCoordinator,
};

/// Turns media files into time-aligned subtitle segments.
#[derive(Parser)]
#[command(name = "subtitle-coordinator")]
struct Cli {
    /// Config file (created with defaults when missing).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Transcribe one media file and print its segments as JSON.
    Transcribe {
        /// Audio or video file.
        file: PathBuf,

        /// Recognition locale, e.g. en-US (defaults to the configured one).
        #[arg(long)]
        locale: Option<String>,

        /// Use server recognition without asking when on-device falls short.
        #[arg(long)]
        allow_server: bool,

        /// Media duration in seconds, used for timeouts and coverage checks.
        #[arg(long)]
        duration: Option<f64>,

        /// Cache key for the transcript (defaults to name, size and mtime).
        #[arg(long)]
        fingerprint: Option<String>,

        /// Neither read nor write the transcript cache.
        #[arg(long)]
        no_cache: bool,

        /// Write segments here instead of stdout.
        #[arg(long)]
        output: Option<PathBuf>,
    },

    /// Print the effective configuration with secrets masked.
    Config,
}

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("subtitle_coordinator=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run(Cli::parse()).await {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let config_path = cli.config.unwrap_or_else(config::default_config_path);
    let mut app_config = config::load_or_create(&config_path)?;
    app_config.apply_env_overrides();

    match cli.command {
        Command::Config => {
            println!("{}", serde_json::to_string_pretty(&app_config.summary())?);
            Ok(())
        }
        Command::Transcribe {
            file,
            locale,
            allow_server,
            duration,
            fingerprint,
            no_cache,
            output,
        } => {
            let fingerprint = match fingerprint {
                Some(f) => f,
                None => default_fingerprint(&file).await?,
            };
            let mut media = MediaItem::new(MediaIdentity::generate(), file, fingerprint);
            if let Some(duration) = duration {
                media = media.with_duration(duration);
            }

            let segments = transcribe(&app_config, media, locale.as_deref(), allow_server, no_cache).await?;
            let json = serde_json::to_string_pretty(&segments)?;
            match output {
                Some(path) => {
                    tokio::fs::write(&path, json).await?;
                    eprintln!("Wrote {} segments to {}", segments.len(), path.display());
                }
                None => println!("{json}"),
            }
            Ok(())
        }
    }
}

async fn default_fingerprint(file: &Path) -> Result<String, Box<dyn std::error::Error>> {
    let signature = ContentSignature::read(file).await?;
    let name = file
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    Ok(format!("{}-{}-{}", name, signature.size_bytes, signature.modified_ms))
}

async fn transcribe(
    app_config: &AppConfig,
    media: MediaItem,
    locale: Option<&str>,
    allow_server: bool,
    no_cache: bool,
) -> Result<Vec<subtitle_coordinator::TranscriptSegment>, Box<dyn std::error::Error>> {
    let coordinator = if no_cache {
        TranscriptionCoordinator::from_config_with_cache(app_config, Arc::new(MemoryCache::new()))
    } else {
        TranscriptionCoordinator::from_config(app_config)
    };

    let id = media.id.clone();
    coordinator.start(media, locale);
    let mut updates = coordinator
        .subscribe(&id)
        .ok_or("transcription session vanished")?;
    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let mut last_line = String::new();

    loop {
        let snapshot = updates.borrow_and_update().clone();
        report_progress(&snapshot, &mut last_line);

        match snapshot.state {
            SessionState::Terminal(TerminalState::Success) => {
                let transcript = snapshot.result.ok_or("finished without a transcript")?;
                return Ok(transcript.segments);
            }
            SessionState::Terminal(TerminalState::Failure) => {
                let message = snapshot
                    .error
                    .map(|e| e.to_string())
                    .unwrap_or_else(|| "transcription failed".to_string());
                return Err(message.into());
            }
            SessionState::AwaitingFallbackConsent => {
                let reason = snapshot.fallback_reason.unwrap_or_default();
                let granted = if allow_server {
                    eprintln!("{reason}. Using server recognition.");
                    true
                } else {
                    eprint!("{reason}. Use server recognition? [y/N] ");
                    let answer = stdin.next_line().await?.unwrap_or_default();
                    matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes")
                };
                if granted {
                    coordinator.confirm_fallback(&id)?;
                } else {
                    coordinator.deny_fallback(&id).await?;
                }
                continue;
            }
            SessionState::Idle => return Err("transcription was cancelled".into()),
            SessionState::Running => {}
        }

        tokio::select! {
            changed = updates.changed() => changed?,
            _ = tokio::signal::ctrl_c() => {
                coordinator.cancel(&id)?;
                return Err("interrupted".into());
            }
        }
    }
}

fn report_progress(snapshot: &SessionSnapshot, last_line: &mut String) {
    let Some(progress) = &snapshot.progress else {
        return;
    };
    let line = match progress.fraction {
        Some(fraction) => format!("{} {:.0}%", progress.stage, fraction * 100.0),
        None => progress.stage.to_string(),
    };
    if line != *last_line {
        eprintln!("{line}");
        *last_line = line;
    }
}
