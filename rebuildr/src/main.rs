#![deny(missing_docs)]

//! CLI binary interface for rebuildr

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use miette::{Context, IntoDiagnostic};
use rebuildr::api::{self, AppState};
use rebuildr::assets::{AssetKind, AssetStore, BucketStore, FsStore, HttpBucket, MixedStore};
use rebuildr::attempts::FsAttemptStore;
use rebuildr::errors::RebuildError;
use rebuildr::executor::plan::RemoteBuildOptions;
use rebuildr::executor::worker::HttpWorker;
use rebuildr::executor::RemoteBuildExecutor;
use rebuildr::feed::{Feed, MemQueue, Tracker};
use rebuildr::gateway::RateLimiter;
use rebuildr::gitsource::GitCliCloner;
use rebuildr::infer::InferenceService;
use rebuildr::net::{create_client, ClientSettings};
use rebuildr::pipeline::{BuildDefRepo, RebuildPipeline};
use rebuildr::registry::HttpRegistry;
use rebuildr::sign::kms::HttpKmsClient;
use rebuildr::sign::KmsSigner;
use rebuildr::stabilize::{detect_format, stabilize, PassSelection};
use rebuildr::verify::PrebuildConfig;
use tracing::info;

use crate::cli::{Cli, Commands, ServeArgs, StabilizeArgs};

mod cli;

fn main() -> miette::Result<()> {
    let cli = Cli::parse();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(cli.verbose.into())
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .init();

    match &cli.command {
        Commands::Serve(args) => {
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
                .expect("initializing tokio runtime failed");
            runtime.block_on(cmd_serve(args))
        }
        Commands::Stabilize(args) => cmd_stabilize(args),
        Commands::Schema => cmd_schema(),
        Commands::Version => {
            let identity = rebuildr::service_identity();
            println!(
                "{}",
                serde_json::json!({"version": identity.version, "repo": identity.repo})
            );
            Ok(())
        }
    }
}

fn cmd_stabilize(args: &StabilizeArgs) -> miette::Result<()> {
    let ecosystem = args
        .ecosystem
        .as_deref()
        .map(|raw| raw.parse::<rebuildr_schema::Ecosystem>())
        .transpose()
        .into_diagnostic()?;
    let selection = PassSelection::parse(&args.enable_passes, &args.disable_passes);
    let passes = selection.resolve(ecosystem).into_diagnostic()?;

    let input = std::fs::read(&args.infile)
        .into_diagnostic()
        .wrap_err_with(|| format!("failed to read {}", args.infile))?;
    let format = detect_format(args.infile.as_str(), ecosystem);
    let output = stabilize(&input, format, &passes, &[])
        .into_diagnostic()
        .wrap_err_with(|| format!("failed to stabilize {}", args.infile))?;
    std::fs::write(&args.outfile, output)
        .into_diagnostic()
        .wrap_err_with(|| format!("failed to write {}", args.outfile))?;
    eprintln!(
        "{}",
        console::style(format!(
            "stabilized {} -> {} ({} passes)",
            args.infile,
            args.outfile,
            passes.len()
        ))
        .green()
    );
    Ok(())
}

fn cmd_schema() -> miette::Result<()> {
    let schema = schemars::schema_for!(rebuildr_schema::strategy::StrategyOneOf);
    println!(
        "{}",
        serde_json::to_string_pretty(&schema).into_diagnostic()?
    );
    Ok(())
}

fn parse_gateway_hosts(
    raw: &[String],
) -> Result<Vec<(String, Duration)>, RebuildError> {
    raw.iter()
        .map(|pair| {
            let (host, interval) = pair.split_once('=').ok_or_else(|| {
                RebuildError::invalid_argument(format!(
                    "gateway host must be host=interval: {pair}"
                ))
            })?;
            Ok((host.to_owned(), api::parse_duration(interval)?))
        })
        .collect()
}

async fn cmd_serve(args: &ServeArgs) -> miette::Result<()> {
    // Fatal-at-startup validation: a service that can't sign, store debug
    // assets, or find its build definitions must not come up at all.
    let identity = rebuildr::service_identity();
    rebuildr::changelog::validate_pseudo_version(&identity.version).into_diagnostic()?;
    if args.build_def_repo.trim().is_empty() {
        return Err(miette::miette!("build-def-repo must be set"));
    }
    std::fs::create_dir_all(&args.debug_storage)
        .into_diagnostic()
        .wrap_err_with(|| format!("debug storage unavailable at {}", args.debug_storage))?;

    let client = create_client(&ClientSettings::new()).into_diagnostic()?;

    let kms = Arc::new(HttpKmsClient::new(
        client.clone(),
        args.kms_endpoint.clone(),
        args.kms_token.clone(),
    ));
    let signer = Arc::new(
        KmsSigner::connect(kms, &args.kms_key)
            .await
            .into_diagnostic()
            .wrap_err("KMS signer initialization failed")?,
    );

    let debug_store: Arc<dyn AssetStore> = Arc::new(FsStore::new(args.debug_storage.clone()));
    // worker-produced assets land in the metadata bucket; the dockerfile and
    // other debug assets stay local
    let remote_store: Arc<dyn AssetStore> = match &args.metadata_bucket {
        Some(bucket) => {
            let bucket_store: Arc<dyn AssetStore> = Arc::new(BucketStore::new(
                Arc::new(HttpBucket::new(client.clone(), bucket.clone())),
                "",
            ));
            Arc::new(
                MixedStore::new()
                    .route(AssetKind::RebuiltArtifact, bucket_store.clone())
                    .route(AssetKind::BuildInfo, bucket_store.clone())
                    .route(AssetKind::TetragonLog, bucket_store.clone())
                    .route(AssetKind::NetworkLog, bucket_store)
                    .fallback(debug_store.clone()),
            )
        }
        None => debug_store.clone(),
    };
    let attestation_store: Arc<dyn AssetStore> = match &args.attestation_bucket {
        Some(bucket) => Arc::new(BucketStore::new(
            Arc::new(HttpBucket::new(client.clone(), bucket.clone())),
            "",
        )),
        None => debug_store.clone(),
    };

    let registry = Arc::new(HttpRegistry::new(client.clone()));
    let cloner = Arc::new(GitCliCloner);
    let inference = Arc::new(
        InferenceService::new(registry.clone(), cloner.clone(), identity.version.clone())
            .with_log_store(debug_store.clone()),
    );
    let worker = Arc::new(HttpWorker::new(client.clone(), args.worker_endpoint.clone()));
    let executor = Arc::new(RemoteBuildExecutor::new(
        worker,
        remote_store.clone(),
        identity.version.clone(),
    ));

    let build_options = RemoteBuildOptions {
        prebuild_auth: args.prebuild_auth,
        upload_base: args
            .metadata_bucket
            .as_ref()
            .map(|b| b.to_string().trim_end_matches('/').to_owned())
            .unwrap_or_default(),
        ..Default::default()
    };

    let pipeline = Arc::new(RebuildPipeline {
        registry: registry.clone(),
        inference: inference.clone(),
        executor,
        remote_store,
        attestation_store,
        debug_store: debug_store.clone(),
        signer,
        attempts: Arc::new(FsAttemptStore::new(args.debug_storage.join("attempts"))),
        cloner,
        service: identity.clone(),
        prebuild: PrebuildConfig {
            bucket_url: args.prebuild_bucket.clone(),
            auth: args.prebuild_auth,
        },
        build_def_repo: Some(BuildDefRepo {
            repo: args.build_def_repo.clone(),
            git_ref: args.build_def_ref.clone(),
        }),
        build_options,
    });
    pipeline.check_startup().into_diagnostic()?;

    let gateway = (!args.gateway_hosts.is_empty())
        .then(|| parse_gateway_hosts(&args.gateway_hosts))
        .transpose()
        .into_diagnostic()?
        .map(|hosts| Arc::new(RateLimiter::new(hosts)));

    let feed = Arc::new(Feed::new(
        Tracker::all_of(rebuildr_schema::Ecosystem::ALL.iter().copied()),
        Arc::new(MemQueue::new()),
        10,
    ));

    let state = Arc::new(AppState {
        pipeline,
        inference,
        gateway,
        feed: Some(feed),
        service_version: identity.version.clone(),
        runs: Default::default(),
        wait_grace: Duration::from_secs(5 * 60),
        cancel_grace: Duration::from_secs(10 * 60),
    });

    let listener = tokio::net::TcpListener::bind(args.addr)
        .await
        .into_diagnostic()
        .wrap_err_with(|| format!("failed to bind {}", args.addr))?;
    info!(addr = %args.addr, version = %identity.version, "rebuildr serving");
    axum::serve(listener, api::router(state))
        .await
        .into_diagnostic()
}
