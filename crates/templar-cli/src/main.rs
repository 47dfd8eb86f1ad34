mod commands;
mod settings;

use clap::{Args, Parser, Subcommand};
use clap_complete::Shell;
use commands::{EXIT_CONFIG_ERROR, EXIT_FAILURE, EXIT_STORE_ERROR};
use settings::{Backend, Settings};
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Mutex;
use templar_core::{install_signal_handler, RunMode, Selection};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(
    name = "templar",
    version,
    about = "Build and maintain VM templates from cloud images"
)]
struct Cli {
    #[command(flatten)]
    global: GlobalOpts,

    /// Output results as structured JSON.
    #[arg(long, default_value_t = false, global = true)]
    json: bool,

    /// Enable verbose (debug) logging output.
    #[arg(short, long, default_value_t = false, global = true)]
    verbose: bool,

    /// Enable trace-level logging (more detailed than --verbose).
    #[arg(long, default_value_t = false, global = true)]
    trace: bool,

    /// Also write debug-level logs to this file.
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

/// Overrides for values that may also come from the config file.
#[derive(Debug, Default, Args)]
pub struct GlobalOpts {
    /// TOML configuration file.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// State directory holding metadata, cached images, and scratch space.
    #[arg(long, global = true)]
    pub state_dir: Option<PathBuf>,

    /// Template catalog (JSON or TOML).
    #[arg(long, global = true)]
    pub catalog: Option<PathBuf>,

    /// Metadata file (defaults to <state-dir>/metadata.json).
    #[arg(long, global = true)]
    pub metadata: Option<PathBuf>,

    /// Image cache directory (defaults to <state-dir>/images).
    #[arg(long, global = true)]
    pub cache_dir: Option<PathBuf>,

    /// Scratch directory for working copies (defaults to <state-dir>/tmp).
    #[arg(long, global = true)]
    pub work_dir: Option<PathBuf>,

    /// Storage for imported disks; auto-selected when omitted.
    #[arg(long, global = true)]
    pub storage: Option<String>,

    /// Lowest VM identifier to allocate.
    #[arg(long, global = true)]
    pub vmid_min: Option<u32>,

    /// Upper bound (exclusive) for allocated VM identifiers.
    #[arg(long, global = true)]
    pub vmid_max: Option<u32>,

    /// Customization timeout in seconds.
    #[arg(long, global = true)]
    pub timeout: Option<u64>,

    /// Virtualization backend.
    #[arg(long, global = true, value_enum)]
    pub backend: Option<Backend>,
}

/// Template filter shared by every command that walks the catalog.
#[derive(Debug, Default, Args)]
struct Filter {
    /// Only process these templates (comma-separated).
    #[arg(long, value_delimiter = ',')]
    only: Vec<String>,
    /// Skip these templates (comma-separated).
    #[arg(long, value_delimiter = ',')]
    except: Vec<String>,
}

impl Filter {
    fn into_selection(self) -> Selection {
        Selection::new(self.only, self.except)
    }
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Build templates that do not exist yet.
    Build {
        #[command(flatten)]
        filter: Filter,
    },
    /// Rebuild existing templates with package upgrades, keeping their identifiers.
    Update {
        #[command(flatten)]
        filter: Filter,
    },
    /// Rebuild existing templates from a freshly downloaded image.
    Rebuild {
        #[command(flatten)]
        filter: Filter,
    },
    /// Compare recorded metadata with the live platform.
    Status {
        #[command(flatten)]
        filter: Filter,
    },
    /// Import prebuilt images listed in a manifest file or URL.
    Import {
        /// Manifest path or http(s) URL.
        manifest: String,
        #[command(flatten)]
        filter: Filter,
        /// Replace templates that already exist.
        #[arg(long, default_value_t = false)]
        force: bool,
    },
    /// Write an import manifest for the images in a directory.
    GenerateManifest {
        /// Directory to scan for disk images.
        dir: PathBuf,
        /// Publish sources as URLs under this base instead of file names.
        #[arg(long)]
        base_url: Option<String>,
        /// Write to this file instead of stdout.
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Generate shell completions.
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

impl Commands {
    fn mutates_platform(&self) -> bool {
        matches!(
            self,
            Self::Build { .. } | Self::Update { .. } | Self::Rebuild { .. } | Self::Import { .. }
        )
    }
}

fn init_logging(default_level: &str, log_file: Option<&PathBuf>) -> Result<(), String> {
    let console = tracing_subscriber::fmt::layer()
        .with_target(false)
        .without_time()
        .with_writer(std::io::stderr)
        .with_filter(
            EnvFilter::try_from_env("TEMPLAR_LOG").unwrap_or_else(|_| EnvFilter::new(default_level)),
        );

    let file = match log_file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|e| format!("cannot open log file {}: {e}", path.display()))?;
            Some(
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_writer(Mutex::new(file))
                    .with_filter(LevelFilter::DEBUG),
            )
        }
        None => None,
    };

    tracing_subscriber::registry().with(console).with(file).init();
    Ok(())
}

fn main() -> ExitCode {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        let msg = info.to_string();
        if msg.contains("Broken pipe")
            || msg.contains("broken pipe")
            || msg.contains("os error 32")
            || msg.contains("failed printing to stdout")
        {
            std::process::exit(0);
        }
        default_hook(info);
    }));

    let cli = Cli::parse();

    let default_level = if cli.trace {
        "trace"
    } else if cli.verbose {
        "debug"
    } else {
        "warn"
    };
    if let Err(msg) = init_logging(default_level, cli.log_file.as_ref()) {
        eprintln!("error: {msg}");
        return ExitCode::from(EXIT_FAILURE);
    }

    install_signal_handler();

    let result = dispatch(cli.command, &cli.global, cli.json);

    match result {
        Ok(code) => ExitCode::from(code),
        Err(msg) => {
            eprintln!("error: {msg}");
            ExitCode::from(exit_code_for(&msg))
        }
    }
}

fn resolve_settings(global: &GlobalOpts, mutates_platform: bool) -> Result<Settings, String> {
    let settings = Settings::resolve(global)?;
    if mutates_platform
        && settings.backend == Backend::Proxmox
        && std::env::var("TEMPLAR_SKIP_PREREQS").as_deref() != Ok("1")
    {
        let missing = templar_runtime::check_proxmox_prereqs();
        if !missing.is_empty() {
            return Err(templar_runtime::format_missing(&missing));
        }
    }
    Ok(settings)
}

fn dispatch(command: Commands, global: &GlobalOpts, json_output: bool) -> Result<u8, String> {
    let mutates = command.mutates_platform();
    let settings = || resolve_settings(global, mutates);
    match command {
        Commands::Build { filter } => commands::build::run(
            &settings()?,
            RunMode::Build,
            &filter.into_selection(),
            json_output,
        ),
        Commands::Update { filter } => commands::build::run(
            &settings()?,
            RunMode::Update,
            &filter.into_selection(),
            json_output,
        ),
        Commands::Rebuild { filter } => commands::build::run(
            &settings()?,
            RunMode::Rebuild,
            &filter.into_selection(),
            json_output,
        ),
        Commands::Status { filter } => {
            commands::status::run(&settings()?, &filter.into_selection(), json_output)
        }
        Commands::Import {
            manifest,
            filter,
            force,
        } => commands::import::run(
            &settings()?,
            &manifest,
            &filter.into_selection(),
            force,
            json_output,
        ),
        Commands::GenerateManifest {
            dir,
            base_url,
            output,
        } => commands::generate_manifest::run(
            &dir,
            base_url.as_deref(),
            output.as_deref(),
            json_output,
        ),
        Commands::Completions { shell } => commands::completions::run::<Cli>(shell),
    }
}

fn exit_code_for(msg: &str) -> u8 {
    const CONFIG_PREFIXES: &[&str] = &[
        "configuration error:",
        "catalog error:",
        "manifest error:",
        "config file error:",
    ];
    if CONFIG_PREFIXES.iter().any(|p| msg.starts_with(p)) {
        EXIT_CONFIG_ERROR
    } else if msg.starts_with("store error:") || msg.starts_with("another run holds the lock") {
        EXIT_STORE_ERROR
    } else {
        EXIT_FAILURE
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn filter_lists_split_on_commas() {
        let cli = Cli::try_parse_from(["templar", "build", "--only", "debian-12,alma-9"]).unwrap();
        match cli.command {
            Commands::Build { filter } => {
                assert_eq!(filter.only, vec!["debian-12", "alma-9"]);
                assert!(filter.except.is_empty());
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn global_options_follow_the_subcommand() {
        let cli = Cli::try_parse_from([
            "templar", "status", "--backend", "mock", "--vmid-min", "8000", "--json",
        ])
        .unwrap();
        assert_eq!(cli.global.backend, Some(Backend::Mock));
        assert_eq!(cli.global.vmid_min, Some(8000));
        assert!(cli.json);
    }

    #[test]
    fn error_prefixes_map_to_exit_codes() {
        assert_eq!(exit_code_for("catalog error: unknown template 'x'"), EXIT_CONFIG_ERROR);
        assert_eq!(exit_code_for("configuration error: bad range"), EXIT_CONFIG_ERROR);
        assert_eq!(exit_code_for("store error: disk full"), EXIT_STORE_ERROR);
        assert_eq!(
            exit_code_for("another run holds the lock at /var/lib/templar/.lock"),
            EXIT_STORE_ERROR
        );
        assert_eq!(exit_code_for("pvesh failed"), EXIT_FAILURE);
    }
}
