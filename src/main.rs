use clap::{Parser, Subcommand};
use reimage::config::{self, AppConfig, Preset};
use reimage::imaging::RustBackend;
use reimage::ingest::read_sources;
use reimage::output;
use reimage::scheduler::ProcessEvent;
use reimage::session::{SESSION_HELP, Session, SessionCommand};
use reimage::types::OutputFormat;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::mpsc::Sender;
use std::thread::JoinHandle;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::task::JoinSet;
use tracing_subscriber::EnvFilter;

fn version_string() -> &'static str {
    let on_tag = env!("ON_RELEASE_TAG");
    if on_tag == "true" {
        env!("CARGO_PKG_VERSION")
    } else {
        let hash = env!("GIT_HASH");
        if hash.is_empty() {
            "dev@unknown"
        } else {
            Box::leak(format!("dev@{hash}").into_boxed_str())
        }
    }
}

#[derive(Parser)]
#[command(name = "reimage")]
#[command(about = "Batch image transcoder: resize and re-encode images locally")]
#[command(long_about = "\
Batch image transcoder: resize and re-encode images locally

Images are decoded, scaled down to fit the maximum dimension (never up),
lightly sharpened, and encoded as JPEG, PNG, WebP or AVIF. Files are
processed in batches of up to (CPU cores - 1) at a time.

Accepted inputs: .jpg .jpeg .png .webp .avif, up to 50MB each.
Output names: {name}_w{width}_q{quality}.{format}

Settings are read from reimage.toml (see 'reimage gen-config').
Command-line flags override the file; --save writes them back.")]
#[command(version = version_string())]
struct Cli {
    /// Config file
    #[arg(long, default_value = "reimage.toml", global = true)]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

/// Encode settings that override the config file.
#[derive(clap::Args, Clone, Default)]
struct SettingsArgs {
    /// Preset applied before the other flags: high-quality, balanced, high-compression
    #[arg(long)]
    preset: Option<Preset>,
    /// Output format: jpg, png, webp, avif, original
    #[arg(long)]
    format: Option<OutputFormat>,
    /// Quality 0-100
    #[arg(long, value_parser = clap::value_parser!(u32).range(0..=100))]
    quality: Option<u32>,
    /// Longest output edge in pixels
    #[arg(long)]
    max_dimension: Option<u32>,
    /// Near-lossless WebP encoding
    #[arg(long)]
    near_lossless: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Process image files and directories, then export the results
    Process {
        /// Files or directories (searched recursively)
        #[arg(required = true)]
        paths: Vec<PathBuf>,
        #[command(flatten)]
        settings: SettingsArgs,
        /// Output directory
        #[arg(long, default_value = "reimage-out")]
        out: PathBuf,
        /// Write a single zip archive instead of loose files
        #[arg(long)]
        zip: bool,
        /// Save the resulting settings to the config file
        #[arg(long)]
        save: bool,
    },
    /// Interactive session reading commands from stdin
    Session {
        /// Export directory
        #[arg(long, default_value = "reimage-out")]
        out: PathBuf,
    },
    /// Print a stock reimage.toml with all options documented
    GenConfig,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("reimage=info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Process {
            paths,
            settings,
            out,
            zip,
            save,
        } => {
            let mut app = config::load_config(&cli.config)?;
            apply_overrides(&mut app, &settings)?;
            if save {
                config::save_settings(&cli.config, &app.settings)?;
                println!("Saved settings to {}", cli.config.display());
            }
            run_process(app, &cli.config, &paths, &out, zip).await?;
        }
        Command::Session { out } => {
            let app = config::load_config(&cli.config)?;
            run_session(app, &cli.config, &out).await?;
        }
        Command::GenConfig => {
            print!("{}", config::stock_config_toml());
        }
    }

    Ok(())
}

fn apply_overrides(app: &mut AppConfig, args: &SettingsArgs) -> Result<(), config::ConfigError> {
    let settings = &mut app.settings;
    if let Some(preset) = args.preset {
        settings.apply_preset(preset);
    }
    if let Some(format) = args.format {
        settings.output_format = format;
    }
    if let Some(quality) = args.quality {
        settings.quality = quality;
    }
    if let Some(max) = args.max_dimension {
        settings.max_dimension = max;
    }
    if args.near_lossless {
        settings.near_lossless = true;
    }
    settings.validate()
}

/// Print progress events on a dedicated thread until every sender is gone.
fn spawn_printer() -> (Sender<ProcessEvent>, JoinHandle<()>) {
    let (tx, rx) = std::sync::mpsc::channel();
    let printer = std::thread::spawn(move || {
        let mut position = 0;
        for event in rx {
            if !matches!(event, ProcessEvent::BatchStarted { .. }) {
                position += 1;
            }
            output::print_lines(&output::format_event(&event, position));
        }
    });
    (tx, printer)
}

fn build_session(app: AppConfig, config_path: &Path, events: Sender<ProcessEvent>) -> Session {
    let backend = Arc::new(RustBackend::new(&app.avif));
    Session::new(app, config_path, backend, Some(events))
}

async fn run_process(
    app: AppConfig,
    config_path: &Path,
    paths: &[PathBuf],
    out: &Path,
    zip: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let (tx, printer) = spawn_printer();
    let session = build_session(app, config_path, tx);

    let (sources, read_errors) = read_sources(paths);
    for err in &read_errors {
        println!("Skipped: {}", err);
    }
    let outcome = session.add_files(sources).await;
    for err in &outcome.errors {
        println!("Skipped: {}", err);
    }

    let exported = match outcome.summary {
        Some(summary) => {
            println!("{}", output::format_summary(&summary));
            if summary.completed > 0 {
                Some(if zip {
                    session.export_zip(out)?
                } else {
                    session.export_dir(out)?
                })
            } else {
                None
            }
        }
        None => {
            println!("No files to process");
            None
        }
    };

    session.shutdown().await;
    printer.join().map_err(|_| "output thread panicked")?;

    if let Some(export) = exported {
        println!("Exported {} files → {}", export.files, export.path.display());
    }
    Ok(())
}

async fn run_session(
    app: AppConfig,
    config_path: &Path,
    out: &Path,
) -> Result<(), Box<dyn std::error::Error>> {
    let (tx, printer) = spawn_printer();
    let session = Arc::new(build_session(app, config_path, tx));
    let mut adds = JoinSet::new();

    println!("{}", SESSION_HELP);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let command = match line.parse::<SessionCommand>() {
            Ok(command) => command,
            Err(err) => {
                println!("{}", err);
                continue;
            }
        };
        match command {
            SessionCommand::Add(paths) => {
                let (sources, read_errors) = read_sources(&paths);
                for err in &read_errors {
                    println!("Skipped: {}", err);
                }
                let session = session.clone();
                adds.spawn(async move {
                    let outcome = session.add_files(sources).await;
                    for err in &outcome.errors {
                        println!("Skipped: {}", err);
                    }
                    if let Some(summary) = outcome.summary {
                        println!("{}", output::format_summary(&summary));
                    }
                });
            }
            SessionCommand::Remove(target) => match session.remove(&target) {
                Ok(_) => println!("Removed {}", target),
                Err(err) => println!("{}", err),
            },
            SessionCommand::Set { key, value } => match session.set(&key, &value) {
                Ok(settings) => output::print_lines(&output::format_settings(&settings)),
                Err(err) => println!("{}", err),
            },
            SessionCommand::Preset(preset) => match session.apply_preset(preset) {
                Ok(settings) => output::print_lines(&output::format_settings(&settings)),
                Err(err) => println!("{}", err),
            },
            SessionCommand::Status => {
                output::print_lines(&output::format_status(
                    &session.settings(),
                    &session.snapshot(),
                ));
            }
            SessionCommand::Export { zip } => {
                let result = if zip {
                    session.export_zip(out)
                } else {
                    session.export_dir(out)
                };
                match result {
                    Ok(export) => {
                        println!("Exported {} files → {}", export.files, export.path.display())
                    }
                    Err(err) => println!("{}", err),
                }
            }
            SessionCommand::Save => match session.save_settings() {
                Ok(path) => println!("Saved settings to {}", path.display()),
                Err(err) => println!("{}", err),
            },
            SessionCommand::Clear => println!("Removed {} files", session.clear()),
            SessionCommand::Help => println!("{}", SESSION_HELP),
            SessionCommand::Quit => break,
        }
    }

    while adds.join_next().await.is_some() {}
    let Ok(session) = Arc::try_unwrap(session) else {
        tracing::warn!("session still shared at exit");
        return Ok(());
    };
    session.shutdown().await;
    printer.join().map_err(|_| "output thread panicked")?;
    Ok(())
}
