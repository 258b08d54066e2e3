//! All the clap stuff for parsing/documenting the cli

use camino::Utf8PathBuf;
use clap::builder::{PossibleValuesParser, TypedValueParser};
use clap::{Args, Parser, Subcommand};
use tracing::level_filters::LevelFilter;

#[derive(Parser, Clone, Debug)]
#[clap(version)]
#[clap(bin_name = "rebuildr")]
/// Rebuild package artifacts and attest the ones that reproduce.
///
/// See 'serve' for the service and 'stabilize' for the offline archive
/// canonicalizer.
pub struct Cli {
    /// Subcommands
    #[clap(subcommand)]
    pub command: Commands,

    /// How verbose logging should be (log level)
    #[clap(long, short)]
    #[clap(default_value_t = LevelFilter::WARN)]
    #[clap(value_parser = PossibleValuesParser::new(["off", "error", "warn", "info", "debug", "trace"]).map(|s| s.parse::<LevelFilter>().expect("possible values are valid")))]
    #[clap(help_heading = "GLOBAL OPTIONS", global = true)]
    pub verbose: LevelFilter,
}

#[derive(Subcommand, Clone, Debug)]
/// What to run
pub enum Commands {
    /// Run the rebuild service
    Serve(ServeArgs),
    /// Canonicalize one archive on disk
    #[clap(after_help = stabilize_help())]
    Stabilize(StabilizeArgs),
    /// Print the JSON schema of the strategy oneof
    Schema,
    /// Print the embedded service version
    Version,
}

#[derive(Args, Clone, Debug)]
/// Flags for the service
pub struct ServeArgs {
    /// Address to listen on
    #[clap(long, default_value = "0.0.0.0:8080")]
    pub addr: std::net::SocketAddr,

    /// KMS key version resource name used for attestation signing
    #[clap(long)]
    pub kms_key: String,

    /// KMS service endpoint
    #[clap(long, default_value = "https://cloudkms.googleapis.com/")]
    pub kms_endpoint: url::Url,

    /// Bearer token for the KMS endpoint (dev only; prefer ambient creds)
    #[clap(long, env = "REBUILDR_KMS_TOKEN", hide_env_values = true)]
    pub kms_token: Option<String>,

    /// Local directory for debug assets (dockerfiles, logs, attempt rows)
    #[clap(long)]
    pub debug_storage: Utf8PathBuf,

    /// Build-definition repository URL
    #[clap(long)]
    pub build_def_repo: String,

    /// Ref build definitions are read at
    #[clap(long, default_value = "main")]
    pub build_def_ref: String,

    /// Remote build worker endpoint
    #[clap(long)]
    pub worker_endpoint: url::Url,

    /// Object-store base URL the worker uploads rebuilt artifacts under
    #[clap(long)]
    pub metadata_bucket: Option<url::Url>,

    /// Object-store base URL attestation bundles publish under
    #[clap(long)]
    pub attestation_bucket: Option<url::Url>,

    /// Bucket URL serving the prebuild tools
    #[clap(long, default_value = "https://prebuild.rebuildr.dev/tools")]
    pub prebuild_bucket: String,

    /// Whether prebuild tool fetches are authenticated
    #[clap(long)]
    pub prebuild_auth: bool,

    /// Rate-limited gateway hosts, as host=interval pairs (e.g.
    /// pypi.org=500ms); repeatable
    #[clap(long = "gateway-host")]
    pub gateway_hosts: Vec<String>,
}

#[derive(Args, Clone, Debug)]
/// Flags for the offline stabilizer
pub struct StabilizeArgs {
    /// Archive to read
    #[clap(long)]
    pub infile: Utf8PathBuf,

    /// Where to write the canonicalized archive
    #[clap(long)]
    pub outfile: Utf8PathBuf,

    /// Comma-separated pass names to enable, or "all"
    #[clap(long, default_value = "all")]
    pub enable_passes: String,

    /// Comma-separated pass names to disable, or "none"; disable wins
    #[clap(long, default_value = "none")]
    pub disable_passes: String,

    /// Ecosystem whose conventions govern format detection and extra passes
    #[clap(long)]
    pub ecosystem: Option<String>,
}

fn stabilize_help() -> String {
    format!(
        "REGISTERED PASSES (default order):\n  {}",
        rebuildr::stabilize::all_stabilizer_names().join("\n  ")
    )
}
