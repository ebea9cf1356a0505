//! Process configuration, read once at startup and injected into each
//! component.
//!
//! | Variable               | Required | Default                     |
//! |------------------------|----------|-----------------------------|
//! | `REDIS_URL`            | no       | `redis://127.0.0.1:6379/0`  |
//! | `VIOLATION_PATTERN`    | no       | `violation:*`               |
//! | `NOTIFY_ENDPOINT`      | no       | webhook sink disabled       |
//! | `FCM_SERVER_KEY`       | no       | push sink disabled          |
//! | `FCM_TOPIC`            | no       | `authorities`               |
//! | `NOTIFY_MAX_RETRIES`   | no       | `0`                         |
//! | `BACKEND_PUBLIC_URL`   | no       | `http://localhost:8000`     |
//! | `CAMERA_ID`            | no       | `unknown_cam`               |
//! | `CAMERA_NAME`          | no       | `unknown`                   |
//! | `CAMERA_LAT`           | no       | `0.0`                       |
//! | `CAMERA_LON`           | no       | `0.0`                       |
//! | `PLATE_SIDECAR_PATH`   | no       | --                          |
//! | `STORAGE_BACKEND`      | no       | archival disabled           |
//! | `STORAGE_BUCKET`       | for s3   | --                          |
//! | `STORAGE_REGION`       | no       | `us-east-1`                 |
//! | `STORAGE_ENDPOINT`     | no       | --                          |
//! | `STORAGE_PREFIX`       | no       | `evidence`                  |
//! | `SERVICE_ACCOUNT_PATH` | no       | default credential chain    |
//! | `STORAGE_LOCAL_DIR`    | no       | `./archive`                 |
//! | `DATABASE_URL`         | no       | in-memory archive index     |
//! | `UPLOAD_MAX_ATTEMPTS`  | no       | `3`                         |
//! | `STALE_CLAIM_SECS`     | no       | `300`                       |
//! | `WORKER_CONCURRENCY`   | no       | `16`                        |
//! | `SHUTDOWN_GRACE_SECS`  | no       | `10`                        |

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::CoreError;
use crate::record::CameraIdentity;
use crate::violation::DEFAULT_PATTERN;

// ---------------------------------------------------------------------------
// Defaults
// ---------------------------------------------------------------------------

pub const DEFAULT_REDIS_URL: &str = "redis://127.0.0.1:6379/0";
pub const DEFAULT_PUSH_TOPIC: &str = "authorities";
pub const DEFAULT_PUBLIC_URL: &str = "http://localhost:8000";
pub const DEFAULT_STORAGE_REGION: &str = "us-east-1";
pub const DEFAULT_STORAGE_PREFIX: &str = "evidence";
pub const DEFAULT_LOCAL_ARCHIVE_DIR: &str = "./archive";
pub const DEFAULT_UPLOAD_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_STALE_CLAIM_SECS: u64 = 300;
pub const DEFAULT_WORKER_CONCURRENCY: usize = 16;
pub const DEFAULT_SHUTDOWN_GRACE_SECS: u64 = 10;

// ---------------------------------------------------------------------------
// Sections
// ---------------------------------------------------------------------------

/// Pub/sub bus connection.
#[derive(Debug, Clone)]
pub struct BusConfig {
    pub redis_url: String,
    pub pattern: String,
}

/// Push provider credentials; present only when a server key is set.
#[derive(Debug, Clone)]
pub struct PushConfig {
    pub server_key: String,
    pub topic: String,
}

/// Notification fan-out settings.
#[derive(Debug, Clone)]
pub struct NotifyConfig {
    pub webhook_url: Option<String>,
    pub push: Option<PushConfig>,
    /// Base URL used to build evidence links in push bodies.
    pub public_base_url: String,
    /// Extra attempts per delivery after the first one fails. `0` disables
    /// retry.
    pub max_retries: u32,
}

/// Durable evidence store backend.
#[derive(Debug, Clone, PartialEq)]
pub enum StorageConfig {
    S3 {
        bucket: String,
        region: String,
        /// Custom endpoint for S3-compatible services.
        endpoint: Option<String>,
        prefix: String,
        /// JSON credential file for the storage service account.
        credentials_path: Option<PathBuf>,
    },
    Local {
        dir: PathBuf,
    },
}

/// Evidence archival settings; `storage` is `None` when archival is off.
#[derive(Debug, Clone)]
pub struct ArchiveConfig {
    pub storage: Option<StorageConfig>,
    pub database_url: Option<String>,
    pub max_attempts: u32,
    /// Age after which an unfinished `uploading` claim may be taken over.
    pub stale_claim_after: Duration,
}

/// Worker pool sizing and shutdown behaviour.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub concurrency: usize,
    pub shutdown_grace: Duration,
}

/// Complete relay configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub bus: BusConfig,
    pub identity: CameraIdentity,
    pub notify: NotifyConfig,
    pub archive: ArchiveConfig,
    pub worker: WorkerConfig,
    /// Plate sidecar consulted when none sits next to the evidence.
    pub sidecar_fallback: Option<PathBuf>,
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

impl RelayConfig {
    /// Load configuration from the process environment.
    pub fn from_env() -> Result<Self, CoreError> {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary variable lookup.
    ///
    /// Empty values are treated as unset.
    pub fn from_vars<F>(lookup: F) -> Result<Self, CoreError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let bus = BusConfig {
            redis_url: get("REDIS_URL").unwrap_or_else(|| DEFAULT_REDIS_URL.to_string()),
            pattern: get("VIOLATION_PATTERN").unwrap_or_else(|| DEFAULT_PATTERN.to_string()),
        };

        let defaults = CameraIdentity::default();
        let identity = CameraIdentity {
            camera_id: get("CAMERA_ID").unwrap_or(defaults.camera_id),
            camera_name: get("CAMERA_NAME").unwrap_or(defaults.camera_name),
            camera_lat: parse_or("CAMERA_LAT", get("CAMERA_LAT"), defaults.camera_lat)?,
            camera_lon: parse_or("CAMERA_LON", get("CAMERA_LON"), defaults.camera_lon)?,
        };

        let notify = NotifyConfig {
            webhook_url: get("NOTIFY_ENDPOINT"),
            push: get("FCM_SERVER_KEY").map(|server_key| PushConfig {
                server_key,
                topic: get("FCM_TOPIC").unwrap_or_else(|| DEFAULT_PUSH_TOPIC.to_string()),
            }),
            public_base_url: get("BACKEND_PUBLIC_URL")
                .unwrap_or_else(|| DEFAULT_PUBLIC_URL.to_string()),
            max_retries: parse_or("NOTIFY_MAX_RETRIES", get("NOTIFY_MAX_RETRIES"), 0)?,
        };

        let storage = match get("STORAGE_BACKEND").as_deref() {
            None => None,
            Some("s3") => Some(StorageConfig::S3 {
                bucket: get("STORAGE_BUCKET").ok_or(CoreError::MissingConfig("STORAGE_BUCKET"))?,
                region: get("STORAGE_REGION")
                    .unwrap_or_else(|| DEFAULT_STORAGE_REGION.to_string()),
                endpoint: get("STORAGE_ENDPOINT"),
                prefix: get("STORAGE_PREFIX")
                    .unwrap_or_else(|| DEFAULT_STORAGE_PREFIX.to_string()),
                credentials_path: get("SERVICE_ACCOUNT_PATH").map(PathBuf::from),
            }),
            Some("local") => Some(StorageConfig::Local {
                dir: PathBuf::from(
                    get("STORAGE_LOCAL_DIR")
                        .unwrap_or_else(|| DEFAULT_LOCAL_ARCHIVE_DIR.to_string()),
                ),
            }),
            Some(other) => {
                return Err(CoreError::Validation(format!(
                    "Unknown STORAGE_BACKEND '{other}'. Must be one of: s3, local"
                )))
            }
        };

        let archive = ArchiveConfig {
            storage,
            database_url: get("DATABASE_URL"),
            max_attempts: parse_or(
                "UPLOAD_MAX_ATTEMPTS",
                get("UPLOAD_MAX_ATTEMPTS"),
                DEFAULT_UPLOAD_MAX_ATTEMPTS,
            )?,
            stale_claim_after: Duration::from_secs(parse_or(
                "STALE_CLAIM_SECS",
                get("STALE_CLAIM_SECS"),
                DEFAULT_STALE_CLAIM_SECS,
            )?),
        };
        if archive.max_attempts == 0 {
            return Err(CoreError::Validation(
                "UPLOAD_MAX_ATTEMPTS must be at least 1".into(),
            ));
        }

        let worker = WorkerConfig {
            concurrency: parse_or(
                "WORKER_CONCURRENCY",
                get("WORKER_CONCURRENCY"),
                DEFAULT_WORKER_CONCURRENCY,
            )?,
            shutdown_grace: Duration::from_secs(parse_or(
                "SHUTDOWN_GRACE_SECS",
                get("SHUTDOWN_GRACE_SECS"),
                DEFAULT_SHUTDOWN_GRACE_SECS,
            )?),
        };
        if worker.concurrency == 0 {
            return Err(CoreError::Validation(
                "WORKER_CONCURRENCY must be at least 1".into(),
            ));
        }

        Ok(Self {
            bus,
            identity,
            notify,
            archive,
            worker,
            sidecar_fallback: get("PLATE_SIDECAR_PATH").map(PathBuf::from),
        })
    }
}

/// Parse `value` if present, else return `default`.
fn parse_or<T: FromStr>(key: &str, value: Option<String>, default: T) -> Result<T, CoreError> {
    match value {
        None => Ok(default),
        Some(v) => v
            .trim()
            .parse()
            .map_err(|_| CoreError::Validation(format!("{key} has an invalid value '{v}'"))),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
