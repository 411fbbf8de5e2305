use clap::Parser;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use utils::serde::deserialize_vec_string;

/// The command-line surface, doubling as the env-var schema: each flag
/// also arrives as `PROCTOR_{FLAG_NAME}`, flags beat env vars, and both
/// beat proctor.toml. Everything stays Option-shaped so the config
/// layering can tell "unset" apart from "explicitly set".
#[derive(Debug, Parser, Serialize, Deserialize, Default)]
#[command(version, about, long_about = None)]
#[serde(default)]
pub struct CliArgs {
    /// Directory holding proctor.toml; when absent the standard search
    /// chain applies (cwd, ~/.proctor, the platform config dir, /etc)
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub home: Option<PathBuf>,

    /// A dotenv file to preload; defaults to ./.env when one exists
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dotenv: Option<PathBuf>,

    /// The port the operational http endpoints bind to.
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u32>,

    /// The port the agent stream listener binds to.
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_port: Option<u32>,

    /// Comma-separated tracing filter directives
    #[arg(long, value_delimiter = ',')]
    #[serde(skip_serializing_if = "Vec::is_empty")]
    #[serde(deserialize_with = "deserialize_vec_string")]
    pub log_level: Vec<String>,

    /// Bind address for both listeners
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,

    /// Origins the operational endpoints accept cors requests from
    #[arg(long, value_delimiter = ',')]
    #[serde(skip_serializing_if = "Vec::is_empty")]
    #[serde(deserialize_with = "deserialize_vec_string")]
    pub cors_allowed_origins: Vec<String>,

    /// Number of result-collector workers
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result_workers: Option<usize>,

    /// How sessions authenticate: token, mtls or oidc
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_mode: Option<String>,

    /// Shared agent tokens (usually leave this unset and override in env)
    #[arg(long, value_delimiter = ',')]
    #[serde(skip_serializing_if = "Vec::is_empty")]
    #[serde(deserialize_with = "deserialize_vec_string")]
    pub auth_tokens: Vec<String>,
}

impl CliArgs {
    pub const ENV_VAR_PREFIX: &'static str = "PROCTOR";
}
