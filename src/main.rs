use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use vmigrate::cancel::{self, CancelToken};
use vmigrate::command_run::HostRunner;
use vmigrate::config::{self, Config};
use vmigrate::mounts::HostMounts;
use vmigrate::progress::{NoProgress, ProgressObserver, SpinnerProgress};
use vmigrate::remote::HttpRemote;
use vmigrate::request::{self, MigrationRequest, TargetKind};
use vmigrate::sandbox::HostSandbox;
use vmigrate::session::{Session, SessionDeps, SessionFailure, SessionOptions};
use vmigrate::tree::MountPlan;
use vmigrate::{disk, source, system_check};

#[derive(Parser)]
#[command(
    name = "vmigrate",
    about = "Migrate a local filesystem, disk or disk image into a remote instance or volume"
)]
struct Cli {
    /// Enable debug output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Path to config file (default: ~/.config/vmigrate/vmigraterc)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Manage configuration
    #[command(subcommand)]
    Config(ConfigCommand),

    /// Run the migration described by a request file
    Migrate {
        /// Request file (TOML)
        request: PathBuf,

        /// Extra transfer tool arguments (overrides rsync_args from the config)
        #[arg(long, allow_hyphen_values = true)]
        rsync_args: Option<String>,

        /// Do not ask for confirmation
        #[arg(short, long)]
        yes: bool,
    },

    /// Show how a source path would be treated
    Inspect {
        /// Source path
        path: PathBuf,

        /// Check the source against this target kind
        #[arg(short, long, value_enum)]
        kind: Option<TargetKind>,

        /// Additional mount, to preview the mount plan (repeatable)
        #[arg(short, long = "mount")]
        mounts: Vec<PathBuf>,
    },
}

#[derive(Subcommand)]
enum ConfigCommand {
    /// Show current configuration
    Get,
    /// Set a configuration value
    Set {
        /// Configuration key
        key: String,
        /// Configuration value
        value: String,
    },
}

fn install_tracing(verbose: bool) {
    use tracing_subscriber::fmt;
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::EnvFilter;

    let format = fmt::format().without_time().with_target(false).compact();

    let fmt_layer = fmt::layer()
        .event_format(format)
        .with_writer(std::io::stderr);
    let default_level = if verbose { "debug" } else { "info" };
    let filter_layer =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt_layer)
        .init();
}

fn confirm() -> Result<()> {
    if unsafe { libc::isatty(libc::STDIN_FILENO) } == 0 {
        bail!("standard input is not a terminal; pass --yes to migrate without confirmation");
    }
    eprint!("proceed with the migration? [y/N] ");
    let mut answer = String::new();
    std::io::stdin().read_line(&mut answer)?;
    if !answer.trim().eq_ignore_ascii_case("y") {
        bail!("aborted");
    }
    Ok(())
}

fn migrate(cfg: &Config, request_path: &Path, rsync_args: Option<&str>, yes: bool) -> Result<()> {
    system_check::check_privileged()?;

    let request = MigrationRequest::load(request_path)?;
    let source = source::resolve(&request.source)?;
    source.check_target(request.kind)?;

    println!("{}", request.summary(Some(source.format_label()))?);
    if !yes {
        confirm()?;
    }

    let transfer = cfg.transfer_options(rsync_args)?;
    let mut programs = vec![(transfer.tool.as_str(), "apt install rsync")];
    if source.kind().needs_conversion() {
        programs.push((disk::CONVERTER, "apt install qemu-utils"));
    }
    system_check::check_dependencies(&programs)?;

    let remote = HttpRemote::new(&cfg.remote_url).context("failed to set up the remote client")?;
    let cancel = CancelToken::new();
    cancel::install_interrupt_listener(cancel.clone(), cfg.cancel_grace())
        .context("failed to install the interrupt handler")?;

    let observer: Box<dyn ProgressObserver> = if unsafe { libc::isatty(libc::STDERR_FILENO) } != 0 {
        let label = if request.kind.is_instance() { "instance" } else { "volume" };
        Box::new(SpinnerProgress::new(label))
    } else {
        Box::new(NoProgress)
    };

    // The session runs on this thread only: the mount namespace it enters
    // belongs to the calling thread.
    let deps = SessionDeps {
        sandbox: &HostSandbox,
        mounts: &HostMounts,
        runner: &HostRunner,
        remote: &remote,
        observer: observer.as_ref(),
        cancel,
    };
    let options = SessionOptions {
        tmpdir: cfg.tmpdir.clone(),
        transfer,
        architecture: request::host_architecture().to_string(),
    };
    let id = Session::new(deps, options).run(&request, &source)?;
    println!("migrated {id}");
    Ok(())
}

fn inspect(path: &Path, kind: Option<TargetKind>, mounts: &[PathBuf]) -> Result<()> {
    let source = source::resolve(path)?;
    println!("path = {}", source.path().display());
    println!("kind = {}", source.format_label());
    if source.kind().needs_conversion() {
        println!("conversion = {} to raw", disk::CONVERTER);
    }
    if let Some(kind) = kind {
        source.check_target(kind)?;
        println!("target = {kind}");
    }
    if source.kind() == source::SourceKind::Directory {
        let mut paths = vec![source.path().to_path_buf()];
        paths.extend(mounts.iter().cloned());
        let plan = MountPlan::new(paths)?;
        println!();
        for entry in plan.entries() {
            println!(
                "{} -> /{}",
                entry.source.display(),
                entry.mount_point.display()
            );
        }
    } else if !mounts.is_empty() {
        bail!("additional mounts only apply to directory sources");
    }
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    install_tracing(cli.verbose);

    let config_path = cli.config.as_deref();
    tracing::debug!("config: {}", config::resolve_path(config_path)?.display());
    let cfg = config::load(config_path)?;

    match cli.command {
        Command::Config(cmd) => match cmd {
            ConfigCommand::Get => {
                cfg.display();
            }
            ConfigCommand::Set { key, value } => {
                let mut cfg = cfg;
                cfg.set(&key, &value)?;
                config::save(&cfg, config_path)?;
            }
        },
        Command::Migrate {
            request,
            rsync_args,
            yes,
        } => {
            if let Err(e) = migrate(&cfg, &request, rsync_args.as_deref(), yes) {
                let cancelled = e
                    .downcast_ref::<SessionFailure>()
                    .is_some_and(|f| f.error.is_cancelled());
                if cancelled {
                    eprintln!("Error: {e}");
                    std::process::exit(cancel::INTERRUPTED_EXIT_CODE);
                }
                return Err(e);
            }
        }
        Command::Inspect { path, kind, mounts } => {
            inspect(&path, kind, &mounts)?;
        }
    }

    Ok(())
}
