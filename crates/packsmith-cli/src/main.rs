mod commands;

use clap::{Args, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use commands::{EXIT_FAILURE, EXIT_LOCK_ERROR, EXIT_MANIFEST_ERROR};
use packsmith_core::{install_signal_handler, ShutdownFlag};
use packsmith_schema::Side;
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Debug, Parser)]
#[command(
    name = "packsmith",
    version,
    about = "Reproducible mod-pack assembler: resolve, fetch, verify, reconcile"
)]
struct Cli {
    /// Remote config file (defaults to $PACKSMITH_REMOTE_CONFIG or
    /// ~/.config/packsmith/remote.json).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Output results as structured JSON.
    #[arg(long, default_value_t = false, global = true)]
    json: bool,

    /// Enable verbose (debug) logging output.
    #[arg(short, long, default_value_t = false, global = true)]
    verbose: bool,

    /// Enable trace-level logging (more detailed than --verbose).
    #[arg(long, default_value_t = false, global = true)]
    trace: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum SideArg {
    Client,
    Server,
}

impl From<SideArg> for Side {
    fn from(side: SideArg) -> Self {
        match side {
            SideArg::Client => Side::Client,
            SideArg::Server => Side::Server,
        }
    }
}

/// Where the pack is assembled and where its lock file lives.
#[derive(Debug, Args)]
struct TargetArgs {
    /// Pack directory (defaults to `pack`, or `pack-<side>` with `--side`,
    /// next to the manifest).
    #[arg(long)]
    target: Option<PathBuf>,
    /// Lock file (defaults to `packsmith.lock`, or `packsmith-<side>.lock`
    /// with `--side`, next to the manifest).
    #[arg(long)]
    lock: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct PipelineArgs {
    /// Maximum entries resolved and downloaded at once.
    #[arg(long, default_value_t = packsmith_core::pipeline::DEFAULT_CONCURRENCY)]
    concurrency: usize,
    /// Attempts per request before giving up on transient failures.
    #[arg(long, default_value_t = packsmith_core::retry::DEFAULT_MAX_ATTEMPTS)]
    max_attempts: u32,
    /// Only keep entries for this side (`both` entries are always kept).
    #[arg(long, value_enum)]
    side: Option<SideArg>,
    /// Download cache directory (defaults to ~/.cache/packsmith).
    #[arg(long, conflicts_with = "no_cache")]
    cache: Option<PathBuf>,
    /// Do not read or fill the download cache.
    #[arg(long, default_value_t = false)]
    no_cache: bool,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Resolve, fetch, verify and assemble the pack, then write the lock file.
    Build {
        /// Path to manifest TOML file.
        #[arg(default_value = "packsmith.toml")]
        manifest: PathBuf,
        #[command(flatten)]
        paths: TargetArgs,
        #[command(flatten)]
        pipeline: PipelineArgs,
        /// Leave the pack untouched unless every entry succeeds.
        #[arg(long, default_value_t = false)]
        all_or_nothing: bool,
    },
    /// Show what `build` would change without writing anything.
    Plan {
        /// Path to manifest TOML file.
        #[arg(default_value = "packsmith.toml")]
        manifest: PathBuf,
        #[command(flatten)]
        paths: TargetArgs,
        #[command(flatten)]
        pipeline: PipelineArgs,
    },
    /// Re-hash installed files against the lock file.
    Verify {
        /// Path to manifest TOML file (only used to locate defaults).
        #[arg(default_value = "packsmith.toml")]
        manifest: PathBuf,
        #[command(flatten)]
        paths: TargetArgs,
        /// Check the pack built for this side.
        #[arg(long, value_enum)]
        side: Option<SideArg>,
    },
    /// List entries whose newest upstream release differs from the lock.
    Outdated {
        /// Path to manifest TOML file.
        #[arg(default_value = "packsmith.toml")]
        manifest: PathBuf,
        /// Lock file (defaults to `packsmith.lock` next to the manifest).
        #[arg(long)]
        lock: Option<PathBuf>,
        #[command(flatten)]
        pipeline: PipelineArgs,
    },
    /// Declare a new GitHub-hosted mod after checking that it resolves.
    Add {
        /// Mod identity.
        id: String,
        /// GitHub repository, `owner/name`.
        #[arg(long)]
        repo: String,
        /// Version selector: `latest`, an exact version, or a range.
        #[arg(long, default_value = "latest")]
        version: String,
        /// Release asset name pattern (a single `*` is allowed).
        #[arg(long)]
        asset: Option<String>,
        #[arg(long, value_enum)]
        side: Option<SideArg>,
        /// Path to manifest TOML file.
        #[arg(long, default_value = "packsmith.toml")]
        manifest: PathBuf,
    },
    /// Pin every manifest entry to its locked version and checksum.
    Pin {
        /// Path to manifest TOML file.
        #[arg(default_value = "packsmith.toml")]
        manifest: PathBuf,
        /// Lock file (defaults to `packsmith.lock` next to the manifest).
        #[arg(long)]
        lock: Option<PathBuf>,
        /// Pin from the lock of the pack built for this side.
        #[arg(long, value_enum)]
        side: Option<SideArg>,
        /// Exit non-zero if the manifest is not already pinned.
        #[arg(long, default_value_t = false)]
        check: bool,
    },
    /// Generate shell completions for bash, zsh, fish, elvish, or powershell.
    Completions {
        /// Shell to generate completions for.
        shell: Shell,
    },
}

impl PipelineArgs {
    fn build_options(&self, commit: packsmith_core::CommitPolicy) -> packsmith_core::BuildOptions {
        let cache_dir = if self.no_cache {
            None
        } else {
            self.cache
                .clone()
                .or_else(packsmith_core::ArtifactCache::default_root)
        };
        packsmith_core::BuildOptions {
            concurrency: self.concurrency.max(1),
            retry: packsmith_core::RetryPolicy::with_max_attempts(self.max_attempts),
            commit,
            cache_dir,
            dry_run: false,
            side: self.side.map_or(Side::Both, Side::from),
        }
    }
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
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_env("PACKSMITH_LOG")
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_target(false)
        .without_time()
        .with_writer(std::io::stderr)
        .init();

    let shutdown = ShutdownFlag::new();
    install_signal_handler(shutdown.clone());

    let json = cli.json;
    let config = cli.config.as_deref();
    let result = match cli.command {
        Commands::Build {
            manifest,
            paths,
            pipeline,
            all_or_nothing,
        } => {
            let commit = if all_or_nothing {
                packsmith_core::CommitPolicy::AllOrNothing
            } else {
                packsmith_core::CommitPolicy::Partial
            };
            commands::build::run(
                &manifest,
                paths.target.as_deref(),
                paths.lock.as_deref(),
                &pipeline.build_options(commit),
                config,
                &shutdown,
                json,
            )
        }
        Commands::Plan {
            manifest,
            paths,
            pipeline,
        } => commands::plan::run(
            &manifest,
            paths.target.as_deref(),
            paths.lock.as_deref(),
            &pipeline.build_options(packsmith_core::CommitPolicy::Partial),
            config,
            json,
        ),
        Commands::Verify {
            manifest,
            paths,
            side,
        } => commands::verify::run(
            &manifest,
            paths.target.as_deref(),
            paths.lock.as_deref(),
            side.map_or(Side::Both, Side::from),
            json,
        ),
        Commands::Outdated {
            manifest,
            lock,
            pipeline,
        } => commands::outdated::run(
            &manifest,
            lock.as_deref(),
            &pipeline.build_options(packsmith_core::CommitPolicy::Partial),
            config,
            json,
        ),
        Commands::Add {
            id,
            repo,
            version,
            asset,
            side,
            manifest,
        } => commands::add::run(
            &manifest,
            &commands::add::NewMod {
                id,
                repo,
                version,
                asset,
                side: side.map_or(Side::Both, Side::from),
            },
            config,
            json,
        ),
        Commands::Pin {
            manifest,
            lock,
            side,
            check,
        } => commands::pin::run(
            &manifest,
            lock.as_deref(),
            side.map_or(Side::Both, Side::from),
            check,
            json,
        ),
        Commands::Completions { shell } => commands::completions::run::<Cli>(shell),
    };

    match result {
        Ok(code) => ExitCode::from(code),
        Err(msg) => {
            eprintln!("error: {msg}");
            let code = if msg.starts_with("manifest error:") {
                EXIT_MANIFEST_ERROR
            } else if msg.starts_with("lock error:") || msg.starts_with("target error:") {
                EXIT_LOCK_ERROR
            } else {
                EXIT_FAILURE
            };
            ExitCode::from(code)
        }
    }
}
