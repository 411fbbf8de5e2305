use anyhow::{anyhow, Result};
use figment::{providers::Format, Figment};
use proctor_types::AgentConfig;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::args::CliArgs;
use crate::subsystems::collector::CollectorTuning;
use crate::subsystems::reaper::ReaperTuning;
use crate::subsystems::scheduler::SchedulerTuning;
use crate::subsystems::session::auth::AuthMode;
use crate::subsystems::session::SessionTuning;

/// Every knob the control plane recognizes, already merged and ready to
/// hand to the subsystems. [`ConfigBuilder`] assembles it from (weakest to
/// strongest) built-in defaults, `proctor.toml`, `PROCTOR_*` env vars, and
/// CLI flags.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Config {
    /// Where the operational http endpoints listen (8000 by default)
    pub port: u32,
    /// Where agents dial in (9000 by default)
    pub agent_port: u32,
    /// Logging verbosity as [tracing filter directives](https://docs.rs/tracing-subscriber/latest/tracing_subscriber/filter/struct.EnvFilter.html#directives);
    /// defaults to plain `info`
    pub log_level: Vec<String>,
    /// Bind address shared by both listeners; `localhost` unless overridden
    pub host: String,
    /// Origins the operational endpoints answer cors preflights for
    pub cors_allowed_origins: Vec<String>,

    /// OTLP trace collector endpoint, tracing is console-only when unset
    pub jaeger: Option<String>,
    /// OTLP metrics collector endpoint, metrics are not exported when unset
    pub prometheus: Option<String>,

    // agent liveness (seconds)
    pub heartbeat_interval: u64,
    pub heartbeat_timeout: u64,
    /// Grace interval after a stream drop in which a reconnecting agent
    /// keeps its runs (seconds)
    pub orphan_window: u64,
    /// How often an orphaned run goes back to the queue before it fails
    pub max_orphan_requeues: u32,

    // run timeouts (seconds)
    pub default_run_timeout: u64,
    pub max_run_timeout: u64,

    // task cadence (seconds)
    pub scheduler_tick: u64,
    pub reaper_tick: u64,

    /// Result-collector worker count; all messages for one run land on one worker
    pub result_workers: usize,
    /// Bound of each per-agent outbound dispatch queue; overflow closes the session
    pub session_outbound_capacity: usize,
    /// Artifact payloads above this many bytes must use a presigned upload
    pub max_artifact_inline_bytes: u64,
    /// Seconds granted to in-flight runs when shutting down or cancelling
    pub graceful_shutdown: u64,

    pub auth_mode: AuthMode,
    /// Shared tokens accepted when auth_mode is token
    pub auth_tokens: Vec<String>,

    // agent listener tls material; plaintext when unset (tests, local dev)
    pub tls_cert: Option<PathBuf>,
    pub tls_key: Option<PathBuf>,
    /// CA bundle for verifying agent client certificates (mtls mode)
    pub tls_client_ca: Option<PathBuf>,
}

/// The built-in defaults, applied last so they only fill what no other
/// source set. Values follow the wire-protocol defaults in the agent docs.
impl Default for Config {
    fn default() -> Self {
        Self {
            port: 8000,
            agent_port: 9000,
            log_level: vec!["info".to_string()],
            host: "localhost".to_string(),
            cors_allowed_origins: Vec::new(),
            jaeger: None,
            prometheus: None,
            heartbeat_interval: 30,
            heartbeat_timeout: 90,
            orphan_window: 120,
            max_orphan_requeues: 1,
            default_run_timeout: 30 * 60,
            max_run_timeout: 2 * 60 * 60,
            scheduler_tick: 5,
            reaper_tick: 10,
            result_workers: 4,
            session_outbound_capacity: 64,
            max_artifact_inline_bytes: 1024 * 1024,
            graceful_shutdown: 60,
            auth_mode: AuthMode::Token,
            auth_tokens: Vec::new(),
            tls_cert: None,
            tls_key: None,
            tls_client_ca: None,
        }
    }
}

impl Config {
    /// The operational parameters handed to every agent at registration
    pub fn agent_config(&self) -> AgentConfig {
        AgentConfig {
            heartbeat_interval_s: self.heartbeat_interval,
            default_timeout_s: self.default_run_timeout,
            max_artifact_bytes: self.max_artifact_inline_bytes,
        }
    }

    pub fn session_tuning(&self) -> SessionTuning {
        SessionTuning {
            outbound_capacity: self.session_outbound_capacity,
            ..SessionTuning::default()
        }
    }

    pub fn scheduler_tuning(&self) -> SchedulerTuning {
        SchedulerTuning {
            tick: Duration::from_secs(self.scheduler_tick),
            default_run_timeout: Duration::from_secs(self.default_run_timeout),
            max_run_timeout: Duration::from_secs(self.max_run_timeout),
            ..SchedulerTuning::default()
        }
    }

    pub fn collector_tuning(&self) -> CollectorTuning {
        CollectorTuning {
            workers: self.result_workers,
            max_inline_bytes: self.max_artifact_inline_bytes,
            ..CollectorTuning::default()
        }
    }

    pub fn reaper_tuning(&self) -> ReaperTuning {
        ReaperTuning {
            tick: Duration::from_secs(self.reaper_tick),
            heartbeat_timeout: Duration::from_secs(self.heartbeat_timeout),
            orphan_window: Duration::from_secs(self.orphan_window),
            max_orphan_requeues: self.max_orphan_requeues,
            cancel_grace: Duration::from_secs(self.graceful_shutdown),
        }
    }

    /// Build the subscriber filter from the configured directives, on top
    /// of whatever RUST_LOG already asks for
    pub fn tracing_env_filter(&self) -> Result<tracing_subscriber::EnvFilter> {
        let mut filter = tracing_subscriber::EnvFilter::from_default_env();
        for directive in &self.log_level {
            let parsed = directive
                .parse()
                .map_err(|err| anyhow!("bad log directive {:?}: {}", directive, err))?;
            filter = filter.add_directive(parsed);
        }

        Ok(filter)
    }
}

/// Assembles [`Config`] from its layered sources
#[derive(Debug)]
pub struct ConfigBuilder {
    pub cli_args: CliArgs,
}

impl ConfigBuilder {
    pub const FILENAME: &'static str = "proctor.toml";
    pub const DIRNAME: &'static str = "proctor";
    pub const HIDDEN_DIRNAME: &'static str = ".proctor";

    pub fn new(cli_args: CliArgs) -> Self {
        Self { cli_args }
    }

    pub fn build(self) -> Result<Config> {
        // dotenv goes first: it can introduce the PROCTOR_* vars the
        // override layer is about to read
        self.load_dotenv()?;

        let overrides = self.collect_overrides()?;
        let file = Self::locate_config_file(&overrides)?;

        // later layers win; `join` at the end only fills untouched fields
        let config: Config = Figment::new()
            .merge(figment::providers::Toml::file(file))
            .merge(figment::providers::Serialized::defaults(overrides))
            .join(figment::providers::Serialized::defaults(Config::default()))
            .extract()?;

        Ok(config)
    }

    fn load_dotenv(&self) -> Result<()> {
        let path = match &self.cli_args.dotenv {
            Some(path) => path.clone(),
            None => std::env::current_dir()?.join(".env"),
        };
        if !path.exists() {
            return Ok(());
        }
        dotenvy::from_path(&path).map_err(|e| anyhow!("dotenv {}: {}", path.display(), e))?;
        Ok(())
    }

    /// Fold `PROCTOR_*` env vars under the flags that were actually passed
    /// on the command line. Flags win; both stay Option-shaped so the
    /// figment layering above can tell set from unset.
    fn collect_overrides(&self) -> Result<CliArgs> {
        let overrides = Figment::new()
            .merge(figment::providers::Env::prefixed(&format!(
                "{}_",
                CliArgs::ENV_VAR_PREFIX
            )))
            .merge(figment::providers::Serialized::defaults(&self.cli_args))
            .extract()?;

        Ok(overrides)
    }

    /// First `proctor.toml` that exists, searching: the `--home` dir as
    /// given (no subdirectory appended), the working directory,
    /// `~/.proctor`, the platform config dir, `$XDG_CONFIG_HOME/proctor`
    /// and `~/.config/proctor` (explicitly, for platforms where the
    /// config dir lives elsewhere), then `/etc/proctor`.
    fn locate_config_file(overrides: &CliArgs) -> Result<PathBuf> {
        let mut candidates: Vec<PathBuf> = Vec::new();

        if let Some(home) = &overrides.home {
            candidates.push(home.join(Self::FILENAME));
        }
        if let Ok(cwd) = std::env::current_dir() {
            candidates.push(cwd.join(Self::FILENAME));
        }
        if let Some(home) = dirs::home_dir() {
            candidates.push(home.join(Self::HIDDEN_DIRNAME).join(Self::FILENAME));
        }
        if let Some(config) = dirs::config_dir() {
            candidates.push(config.join(Self::DIRNAME).join(Self::FILENAME));
        }
        if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
            candidates.push(PathBuf::from(xdg).join(Self::DIRNAME).join(Self::FILENAME));
        }
        if let Some(home) = dirs::home_dir() {
            candidates.push(home.join(".config").join(Self::DIRNAME).join(Self::FILENAME));
        }
        candidates.push(PathBuf::from("/etc").join(Self::DIRNAME).join(Self::FILENAME));

        candidates
            .iter()
            .find(|path| path.exists())
            .cloned()
            .ok_or_else(|| {
                anyhow!(
                    "no {} found; searched {:?}",
                    Self::FILENAME,
                    candidates
                )
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_values_override_defaults() {
        let home = tempfile::tempdir().unwrap();
        std::fs::write(
            home.path().join(ConfigBuilder::FILENAME),
            r#"
                agent_port = 9999
                heartbeat_timeout = 45
                auth_mode = "token"
                auth_tokens = ["abc123"]
            "#,
        )
        .unwrap();

        let config = ConfigBuilder::new(CliArgs {
            home: Some(home.path().to_path_buf()),
            ..Default::default()
        })
        .build()
        .unwrap();

        assert_eq!(config.agent_port, 9999);
        assert_eq!(config.heartbeat_timeout, 45);
        assert_eq!(config.auth_tokens, vec!["abc123".to_string()]);
        // untouched options keep their defaults
        assert_eq!(config.port, 8000);
        assert_eq!(config.max_orphan_requeues, 1);
    }

    #[test]
    fn cli_args_override_the_file() {
        let home = tempfile::tempdir().unwrap();
        std::fs::write(
            home.path().join(ConfigBuilder::FILENAME),
            "agent_port = 9999\n",
        )
        .unwrap();

        let config = ConfigBuilder::new(CliArgs {
            home: Some(home.path().to_path_buf()),
            agent_port: Some(7777),
            ..Default::default()
        })
        .build()
        .unwrap();

        assert_eq!(config.agent_port, 7777);
    }
}
