//! bucketfs: mount an S3-compatible bucket as a POSIX filesystem.

mod app_config;
mod fs;
mod store;
mod trc;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info, warn};

use objfs::cache::{StatCache, StatCacheConfig, SymlinkCache, SymlinkCacheConfig};
use objfs::fd::FdCacheConfig;
use objfs::fs::{ObjFs, ObjFsConfig};
use objfs::pool::RequestPool;
use objfs::store::RetryPolicy;
use s3_api::sign::{AnonymousSigner, Credentials, SigV4Signer, Signer};
use s3_api::{ReqwestClient, S3Client, S3Config, S3Request};

use app_config::AppConfig;
use fs::fuser::FuseAdapter;
use store::S3Store;

/// Mounts the configured bucket and serves it until SIGINT; mounting is
/// the only action.
#[derive(Debug, Parser)]
#[command(name = "bucketfs", version, about = "Mount an S3 bucket as a filesystem")]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(short, long)]
    config: PathBuf,

    /// Override the configured mount point.
    #[arg(short, long)]
    mount_point: Option<PathBuf>,

    /// Override any config-file field, mount-option style:
    /// `-o part-size=10MiB,pool-width=8` (repeatable).
    #[arg(short = 'o', value_name = "KEY=VALUE")]
    options: Vec<String>,

    /// Allow other users to access the mount (fuse `allow_other`).
    #[arg(long)]
    allow_other: bool,

    /// Default log level `debug` instead of `info` (`RUST_LOG` still wins).
    #[arg(short, long)]
    verbose: bool,
}

/// Signer selected at startup: SigV4 with credentials, anonymous without.
enum MountSigner {
    V4(SigV4Signer),
    Anonymous(AnonymousSigner),
}

impl Signer for MountSigner {
    fn hash_body(&self, body: &[u8]) -> String {
        match self {
            Self::V4(s) => s.hash_body(body),
            Self::Anonymous(s) => s.hash_body(body),
        }
    }

    fn compute_hmac(&self, key: &[u8], data: &[u8]) -> Vec<u8> {
        match self {
            Self::V4(s) => s.compute_hmac(key, data),
            Self::Anonymous(s) => s.compute_hmac(key, data),
        }
    }

    fn sign_request(&self, req: &mut S3Request, now: chrono::DateTime<chrono::Utc>) {
        match self {
            Self::V4(s) => s.sign_request(req, now),
            Self::Anonymous(s) => s.sign_request(req, now),
        }
    }
}

fn build_signer(config: &AppConfig) -> MountSigner {
    match (&config.access_key_id, &config.secret_access_key) {
        (Some(access_key), Some(secret_key)) => MountSigner::V4(SigV4Signer::new(
            Credentials {
                access_key: access_key.clone(),
                secret_key: secret_key.clone(),
                session_token: config.session_token.clone(),
            },
            config.region.clone(),
        )),
        _ => {
            warn!("no credentials configured; requests go out unsigned");
            MountSigner::Anonymous(AnonymousSigner)
        }
    }
}

fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = AppConfig::load(&cli.config)?;
    config.apply_mount_options(&cli.options)?;
    if let Some(mount_point) = cli.mount_point {
        config.mount_point = app_config::ExpandedPathBuf::new(mount_point);
    }
    config.validate()?;

    let runtime = tokio::runtime::Runtime::new()?;

    let signer = build_signer(&config);
    let client = S3Client::new(
        ReqwestClient::new(config.http_timeout()),
        signer,
        S3Config {
            endpoint: config.endpoint.clone(),
            bucket: config.bucket.clone(),
            region: config.region.clone(),
        },
    );

    let retry = RetryPolicy {
        attempts: config.retry_attempts,
        ..RetryPolicy::default()
    };
    let stat_cache = Arc::new(StatCache::new(StatCacheConfig {
        capacity: config.stat_cache_size,
        expire: config.stat_cache_expire(),
        expiry_mode: config.stat_cache_expiry_mode.into(),
        negative_cache: config.negative_cache,
    }));
    let symlinks = SymlinkCache::new(SymlinkCacheConfig {
        expire: config.stat_cache_expire(),
        expiry_mode: config.stat_cache_expiry_mode.into(),
        ..SymlinkCacheConfig::default()
    });
    let objfs = Arc::new(ObjFs::new(
        Arc::new(S3Store::new(client)),
        RequestPool::new(config.pool_width),
        stat_cache,
        symlinks,
        FdCacheConfig {
            staging_dir: config.staging_dir.to_path_buf(),
            part_size: config.part_size.as_u64(),
            multipart_threshold: config.multipart_threshold.as_u64(),
            retry,
        },
        ObjFsConfig {
            uid: nix::unistd::Uid::current().as_raw(),
            gid: nix::unistd::Gid::current().as_raw(),
            retry,
        },
    ));

    let adapter = FuseAdapter::new(Arc::clone(&objfs), runtime.handle().clone());

    let mut options = vec![
        fuser::MountOption::FSName("bucketfs".to_owned()),
        fuser::MountOption::DefaultPermissions,
        fuser::MountOption::NoAtime,
    ];
    if cli.allow_other {
        options.push(fuser::MountOption::AllowOther);
    }

    std::fs::create_dir_all(&config.mount_point)?;
    let session = fuser::spawn_mount2(adapter, &config.mount_point, &options)?;
    info!(bucket = %config.bucket, mount = %config.mount_point, "mounted");

    runtime.block_on(async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "signal handler failed");
        }
    });

    info!("unmounting; flushing dirty files");
    if let Err(e) = runtime.block_on(objfs.shutdown()) {
        warn!(error = %e, "some files could not be uploaded before exit");
    }
    drop(session);
    Ok(())
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    trc::init(cli.verbose);
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "bucketfs failed");
            ExitCode::FAILURE
        }
    }
}
