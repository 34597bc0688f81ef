//! modshell - Runtime Module Loader CLI
use std::path::{Path, PathBuf};
use std::process;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing::{debug, info};

use modshell::loader::{
    shared, ConfigError, LoadOptions, LoaderBuilder, ModuleLoader, ModuleRef, ShellManifest,
    MANIFEST_FILE,
};
use modshell::logging::{self, LogFormat};

#[derive(Parser, Debug)]
#[command(name = "modshell", version, about = "Load and supervise runtime modules")]
struct Cli {
    /// Manifest describing resolution, dependencies, and the module catalog
    #[arg(long, global = true, default_value = MANIFEST_FILE)]
    manifest: PathBuf,

    #[arg(long, global = true, value_enum, default_value = "compact")]
    log_format: LogFormat,

    /// Default log level when RUST_LOG is unset
    #[arg(long, global = true, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the canonical id of each reference
    Resolve {
        #[arg(required = true)]
        references: Vec<String>,
    },

    /// Load modules from the manifest catalog and print the health report
    Load {
        #[arg(required = true)]
        references: Vec<String>,

        /// Fail instead of substituting a fallback surface
        #[arg(long)]
        required: bool,

        /// Per-attempt timeout in milliseconds
        #[arg(long)]
        timeout_ms: Option<u64>,

        /// Maximum attempts per module
        #[arg(long)]
        retries: Option<u32>,

        /// Re-attempt failed critical modules before reporting
        #[arg(long)]
        recover: bool,
    },

    /// Print the order in which the references would be loaded
    Plan {
        #[arg(required = true)]
        references: Vec<String>,
    },
}

fn load_manifest(path: &Path) -> Result<ShellManifest, ConfigError> {
    match ShellManifest::load(path) {
        // A missing default manifest means "use defaults"
        Err(ConfigError::Io { source, .. })
            if source.kind() == std::io::ErrorKind::NotFound && path == Path::new(MANIFEST_FILE) =>
        {
            debug!(target: "modshell::cli", "No manifest found, using defaults");
            Ok(ShellManifest::default())
        }
        other => other,
    }
}

fn describe(module: &ModuleRef) -> &'static str {
    if module.is_deferred() {
        "deferred"
    } else if module.is_fallback() {
        "fallback"
    } else {
        "loaded"
    }
}

async fn run(cli: Cli) -> Result<(), String> {
    let manifest = load_manifest(&cli.manifest).map_err(|e| e.to_string())?;
    let loader: ModuleLoader =
        LoaderBuilder::from_manifest(&manifest, shared(manifest.catalog_fetcher())).build();

    match cli.command {
        Command::Resolve { references } => {
            for reference in &references {
                println!("{} -> {}", reference, loader.resolve(reference));
            }
        }

        Command::Plan { references } => {
            let refs: Vec<&str> = references.iter().map(String::as_str).collect();
            let plan = loader.plan(&refs);
            for (i, id) in plan.critical.iter().enumerate() {
                println!("critical {}: {}", i + 1, id);
            }
            for (i, batch) in plan.batches.iter().enumerate() {
                let ids: Vec<&str> = batch.iter().map(|id| id.as_str()).collect();
                println!("batch {}: {}", i + 1, ids.join(", "));
            }
        }

        Command::Load {
            references,
            required,
            timeout_ms,
            retries,
            recover,
        } => {
            let mut options = LoadOptions::new();
            if required {
                options = options.required();
            }
            if let Some(ms) = timeout_ms {
                options = options.with_timeout(Duration::from_millis(ms));
            }
            if let Some(n) = retries {
                options = options.with_retries(n);
            }

            let refs: Vec<&str> = references.iter().map(String::as_str).collect();
            info!(target: "modshell::cli", modules = refs.len(), "Loading");
            let modules = loader
                .load_many(&refs, &options)
                .await
                .map_err(|e| e.to_string())?;
            for reference in &refs {
                if let Some(module) = modules.get(*reference) {
                    println!("{} -> {} ({})", reference, module.id(), describe(module));
                }
            }

            if recover {
                for id in loader.recover().await {
                    println!("recovered {}", id);
                }
            }

            let health = serde_json::to_string_pretty(&loader.health()).map_err(|e| e.to_string())?;
            println!("{}", health);
        }
    }

    Ok(())
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let cli = Cli::parse();

    if let Err(e) = logging::init(cli.log_format, &cli.log_level) {
        eprintln!("Warning: could not install logger: {}", e);
    }

    if let Err(e) = run(cli).await {
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}
