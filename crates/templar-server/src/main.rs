use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use templar_server::ImageRoot;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "templar-server", about = "Serve a Templar image directory over HTTP")]
struct Cli {
    /// Port to listen on.
    #[arg(long, default_value_t = 8322)]
    port: u16,

    /// Address to bind.
    #[arg(long, default_value = "0.0.0.0")]
    bind: String,

    /// Directory of images to serve.
    #[arg(long, default_value = ".")]
    dir: PathBuf,

    /// Regenerate imports.json in the directory before serving.
    #[arg(long)]
    write_manifest: bool,

    /// Prefix manifest sources with this URL instead of bare file names.
    #[arg(long, requires = "write_manifest")]
    base_url: Option<String>,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_env("TEMPLAR_LOG")
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    if !cli.dir.is_dir() {
        error!("not a directory: {}", cli.dir.display());
        return ExitCode::FAILURE;
    }

    if cli.write_manifest {
        match templar_server::write_manifest(&cli.dir, cli.base_url.as_deref()) {
            Ok(n) => info!(
                "wrote {} with {n} entries",
                cli.dir.join(templar_server::MANIFEST_FILE).display()
            ),
            Err(e) => {
                error!("manifest generation failed: {e}");
                return ExitCode::FAILURE;
            }
        }
    }

    let addr = format!("{}:{}", cli.bind, cli.port);
    let root = Arc::new(ImageRoot::new(cli.dir));
    match templar_server::run_server(&root, &addr) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}
