//! sandbox-exec
//!
//! Runs one command in a remote sandbox and mirrors its output.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use sandbox_sdk::{FramedTransport, ProcessOptions, Sandbox, SdkConfig, SessionError};

/// Exit status used when the remote process reported no exit code.
const NO_EXIT_CODE: i32 = 1;

/// Exit status after an interrupt, as shells report SIGINT.
const INTERRUPTED: i32 = 130;

/// sandbox-exec - run commands in a remote sandbox.
#[derive(Parser, Debug)]
#[command(name = "sandbox-exec")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Sandbox address (host:port)
    #[arg(short, long, global = true, default_value = "127.0.0.1:49983")]
    pub addr: String,

    /// Path to configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Run a command and stream its output
    Run {
        /// Working directory inside the sandbox
        #[arg(long)]
        cwd: Option<String>,

        /// Environment variable (KEY=VALUE), repeatable
        #[arg(short, long = "env", value_parser = parse_env_var)]
        env: Vec<(String, String)>,

        /// Start timeout in seconds
        #[arg(long)]
        timeout: Option<u64>,

        /// Session id to use instead of a random one
        #[arg(long)]
        id: Option<String>,

        /// Command line to run
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        cmd: Vec<String>,
    },

    /// Kill a process by id
    Kill {
        /// Process id
        id: String,
    },
}

fn parse_env_var(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got {:?}", raw)),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => SdkConfig::load(path)?,
        None => SdkConfig::load_default()?,
    };

    // Initialize tracing
    let filter = if cli.verbose {
        "debug".to_string()
    } else {
        config.log.level.clone()
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    config.apply_env_overrides();
    config.validate()?;

    let transport = FramedTransport::connect_tcp_with(cli.addr.as_str(), config.timeouts.request())
        .await
        .with_context(|| format!("Failed to connect to sandbox at {}", cli.addr))?;
    tracing::debug!("Connected to sandbox at {}", cli.addr);

    let sandbox = Sandbox::connect(transport, config, tokio::runtime::Handle::current());

    let code = match cli.command {
        Commands::Run {
            cwd,
            env,
            timeout,
            id,
            cmd,
        } => {
            let env: BTreeMap<_, _> = env.into_iter().collect();
            let mut options = ProcessOptions::new(cmd.join(" "))
                .envs(env)
                .on_stdout(|line| {
                    println!("{}", line.text());
                    Ok(())
                })
                .on_stderr(|line| {
                    eprintln!("{}", line.text());
                    Ok(())
                });
            if let Some(cwd) = cwd {
                options = options.cwd(cwd);
            }
            if let Some(secs) = timeout {
                options = options.timeout(Duration::from_secs(secs));
            }
            if let Some(id) = id {
                options = options.id(id);
            }
            run(&sandbox, options).await
        }
        Commands::Kill { id } => sandbox.processes().kill(&id).await.map(|_| 0),
    };

    sandbox.close().await;

    match code {
        Ok(code) => std::process::exit(code),
        Err(e) => Err(e.into()),
    }
}

async fn run(
    sandbox: &Sandbox<FramedTransport>,
    options: ProcessOptions,
) -> Result<i32, SessionError> {
    let process = sandbox.processes().start(options).await?;
    tracing::debug!("Started process {}", process.id());

    tokio::select! {
        output = process.wait() => Ok(output?.exit_code().unwrap_or(NO_EXIT_CODE)),
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Interrupted, killing process {}", process.id());
            process.kill().await?;
            Ok(INTERRUPTED)
        }
    }
}
