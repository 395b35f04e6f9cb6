use crate::config::config::EngineConfig;
use crate::config::policy::PolicyResolver;
use crate::config::types::{ExecutionRequest, PolicySelector};
use crate::core::engine::Engine;
use crate::core::types::CancelToken;
use crate::observability::audit::verify_chain;
use crate::observability::events::init_security_logger;
use crate::utils::signal::{cancel_on_shutdown, install_shutdown_handlers};
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Duration;

const EXIT_NOT_SUCCESS: i32 = 1;
const EXIT_REQUEST_FAILED: i32 = 2;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Engine configuration file (JSON); built-in defaults when omitted
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a script in a fresh sandbox and print the result as JSON
    Run {
        /// Runtime preset (python, sh, node, ...)
        #[arg(long)]
        runtime: String,
        /// Named security policy
        #[arg(long, default_value = "default")]
        policy: String,
        /// Wall-clock deadline in milliseconds
        #[arg(long)]
        deadline_ms: Option<u64>,
        /// Script file; read from stdin when omitted
        #[arg(long)]
        file: Option<PathBuf>,
    },
    /// Probe the container runtime and runtime images
    Check {
        /// Only check this runtime's image
        #[arg(long)]
        runtime: Option<String>,
    },
    /// Print every configured policy fully resolved, with its fingerprint
    Policies,
    /// Remove workspaces and containers left behind by dead engines
    Reap,
    /// Verify the audit log hash chain
    VerifyAudit {
        /// Audit log to verify; the configured one when omitted
        #[arg(long)]
        path: Option<PathBuf>,
    },
}

#[derive(Serialize)]
struct ResolvedPolicy {
    fingerprint: String,
    profile: crate::config::policy::PolicyProfile,
}

pub fn run() -> Result<()> {
    env_logger::init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => EngineConfig::load_from_file(path)?,
        None => EngineConfig::default(),
    };

    if let Err(e) = init_security_logger(&security_log_path(&config)) {
        log::warn!("Security events will only go to the log: {}", e);
    }

    match cli.command {
        Commands::Run {
            runtime,
            policy,
            deadline_ms,
            file,
        } => {
            let code = read_code(file.as_deref())?;
            install_shutdown_handlers()?;

            let engine = Engine::with_container_runtime(config)?;
            let mut request = ExecutionRequest::new(code, runtime, PolicySelector::named(policy));
            if let Some(ms) = deadline_ms {
                request = request.with_deadline(Duration::from_millis(ms));
            }

            let cancel = CancelToken::new();
            let watcher = cancel_on_shutdown(cancel.clone());
            let outcome = engine.execute(&request, &cancel);
            // Stops the watcher when no signal arrived
            cancel.cancel();
            let _ = watcher.join();

            // process::exit skips destructors; let queued removals finish first
            let settle = Duration::from_millis(engine.config().provider.control_timeout_ms);
            if !engine.wait_idle(settle) {
                log::warn!("Background cleanup still pending at exit; `codebox reap` will finish it");
            }

            match outcome {
                Ok(result) => {
                    println!("{}", serde_json::to_string_pretty(&result)?);
                    if !result.success() {
                        std::process::exit(EXIT_NOT_SUCCESS);
                    }
                    Ok(())
                }
                Err(e) => {
                    let report = serde_json::json!({
                        "request_id": request.id(),
                        "status_kind": e.status_kind(),
                        "error_kind": e.kind_name(),
                        "error": e.to_string(),
                    });
                    println!("{}", serde_json::to_string_pretty(&report)?);
                    std::process::exit(EXIT_REQUEST_FAILED);
                }
            }
        }
        Commands::Check { runtime } => {
            let engine = Engine::with_container_runtime(config)?;
            engine
                .check(runtime.as_deref())
                .context("isolation runtime is not usable")?;
            eprintln!("{}: ok", engine.provider().binary());
            Ok(())
        }
        Commands::Policies => {
            let resolver = PolicyResolver::new(&config);
            let mut resolved = serde_json::Map::new();
            for name in resolver.policy_names() {
                let profile = resolver
                    .resolve(&PolicySelector::named(name))
                    .with_context(|| format!("policy '{}' does not resolve", name))?;
                let entry = ResolvedPolicy {
                    fingerprint: profile.fingerprint(),
                    profile,
                };
                resolved.insert(name.to_string(), serde_json::to_value(entry)?);
            }
            println!("{}", serde_json::to_string_pretty(&resolved)?);
            Ok(())
        }
        Commands::Reap => {
            // Engine startup already reaps; report what that pass found
            let engine = Engine::with_container_runtime(config)?;
            let report = engine.reap()?;
            eprintln!(
                "Reaped {} workspace(s), {} container(s)",
                report.workspaces, report.containers
            );
            Ok(())
        }
        Commands::VerifyAudit { path } => {
            let path = path.unwrap_or_else(|| config.audit.path.clone());
            let report = verify_chain(&path)
                .with_context(|| format!("cannot read audit log {}", path.display()))?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            if !report.is_intact() {
                std::process::exit(EXIT_NOT_SUCCESS);
            }
            Ok(())
        }
    }
}

fn security_log_path(config: &EngineConfig) -> PathBuf {
    config
        .audit
        .path
        .parent()
        .map(|dir| dir.join("security.jsonl"))
        .unwrap_or_else(|| EngineConfig::runtime_root_dir().join("security.jsonl"))
}

fn read_code(file: Option<&Path>) -> Result<Vec<u8>> {
    match file {
        Some(path) => {
            std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))
        }
        None => {
            let mut code = Vec::new();
            std::io::stdin()
                .read_to_end(&mut code)
                .context("failed to read script from stdin")?;
            Ok(code)
        }
    }
}
