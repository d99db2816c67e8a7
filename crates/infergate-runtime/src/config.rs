//! Environment-driven configuration.
//!
//! Every option is a named `INFERGATE_*` variable. Parsing is split into
//! [InfergateConfig::from_env] and the pure [InfergateConfig::from_env_map] so it can be
//! tested without touching the process environment. Invalid values fail fast.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use infergate_kernel::RegistryError;

use crate::batch::AdmissionConfig;
use crate::limiter::{BucketScope, RateLimitConfig};
use crate::registry::{InMemoryRegistry, Registry};

pub const ENV_KEYS: [&str; 19] = [
    "INFERGATE_MAX_CONCURRENT_JOBS",
    "INFERGATE_JOB_NAME_PREFIX",
    "INFERGATE_MODEL_ID",
    "INFERGATE_OUTPUT_ROOT_URI",
    "INFERGATE_EXECUTION_ROLE",
    "INFERGATE_POISON_THRESHOLD",
    "INFERGATE_TICK_INTERVAL_SECS",
    "INFERGATE_RATE_LIMIT_RATE",
    "INFERGATE_RATE_LIMIT_PERIOD_SECS",
    "INFERGATE_RATE_LIMIT_MAX_DELAY_SECS",
    "INFERGATE_RATE_LIMIT_SCOPE",
    "INFERGATE_DISPATCH_CHUNK_SIZE",
    "INFERGATE_DISPATCH_WORKERS",
    "INFERGATE_EMBEDDING_DIMENSIONS",
    "INFERGATE_REGISTRY_BACKEND",
    "INFERGATE_SQLITE_DB",
    "INFERGATE_POSTGRES_DSN",
    "INFERGATE_POSTGRES_SCHEMA",
    "INFERGATE_SYNC_LIMIT",
];

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required configuration {0}")]
    Missing(&'static str),
    #[error("invalid {key}='{value}': {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
    #[error("{0}")]
    Unsupported(String),
    #[error("opening registry: {0}")]
    Registry(#[from] RegistryError),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RegistryBackend {
    Memory,
    Sqlite,
    Postgres,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RegistryConfig {
    pub backend: RegistryBackend,
    pub sqlite_db_path: String,
    pub postgres_dsn: Option<String>,
    pub postgres_schema: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BatchConfig {
    pub max_concurrent_jobs: usize,
    pub job_name_prefix: String,
    pub output_root_uri: Option<String>,
    pub execution_role: Option<String>,
    pub poison_threshold: u32,
    pub tick_interval: Duration,
    /// Upper bound of records examined per in-flight status when polling.
    pub sync_limit: usize,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DispatchConfig {
    pub rate_limit: RateLimitConfig,
    pub chunk_size: usize,
    pub workers: usize,
    /// Embedding size requested from the model when an input row does not name one.
    pub embedding_dimensions: u32,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InfergateConfig {
    pub model_id: String,
    pub batch: BatchConfig,
    pub dispatch: DispatchConfig,
    pub registry: RegistryConfig,
}

fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get().saturating_sub(1))
        .unwrap_or(1)
        .max(1)
}

fn text(envs: &HashMap<String, String>, key: &str) -> Option<String> {
    envs.get(key)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn number<T: FromStr>(
    envs: &HashMap<String, String>,
    key: &'static str,
    default: T,
) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match text(envs, key) {
        None => Ok(default),
        Some(raw) => raw.parse::<T>().map_err(|e| ConfigError::Invalid {
            key,
            value: raw.clone(),
            reason: e.to_string(),
        }),
    }
}

/// Upper bound for durations given in seconds (ten years).
const MAX_DURATION_SECS: u64 = 10 * 365 * 24 * 60 * 60;

fn seconds(
    envs: &HashMap<String, String>,
    key: &'static str,
    default: u64,
    allow_zero: bool,
) -> Result<Duration, ConfigError> {
    let secs = if allow_zero {
        number(envs, key, default)?
    } else {
        positive(envs, key, default)?
    };
    if secs > MAX_DURATION_SECS {
        return Err(ConfigError::Invalid {
            key,
            value: secs.to_string(),
            reason: format!("must be at most {MAX_DURATION_SECS} seconds"),
        });
    }
    Ok(Duration::from_secs(secs))
}

fn positive<T: FromStr + PartialEq + Default>(
    envs: &HashMap<String, String>,
    key: &'static str,
    default: T,
) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    let value = number(envs, key, default)?;
    if value == T::default() {
        return Err(ConfigError::Invalid {
            key,
            value: "0".to_string(),
            reason: "must be greater than zero".to_string(),
        });
    }
    Ok(value)
}

impl InfergateConfig {
    pub fn from_env(default_sqlite_db_path: &str) -> Result<Self, ConfigError> {
        let mut envs = HashMap::new();
        for key in ENV_KEYS {
            if let Ok(value) = std::env::var(key) {
                envs.insert(key.to_string(), value);
            }
        }
        Self::from_env_map(default_sqlite_db_path, &envs)
    }

    pub fn from_env_map(
        default_sqlite_db_path: &str,
        envs: &HashMap<String, String>,
    ) -> Result<Self, ConfigError> {
        let batch = BatchConfig {
            max_concurrent_jobs: positive(envs, "INFERGATE_MAX_CONCURRENT_JOBS", 20usize)?,
            job_name_prefix: text(envs, "INFERGATE_JOB_NAME_PREFIX")
                .unwrap_or_else(|| "embedding-batch-job".to_string()),
            output_root_uri: text(envs, "INFERGATE_OUTPUT_ROOT_URI"),
            execution_role: text(envs, "INFERGATE_EXECUTION_ROLE"),
            poison_threshold: positive(envs, "INFERGATE_POISON_THRESHOLD", 5u32)?,
            tick_interval: seconds(envs, "INFERGATE_TICK_INTERVAL_SECS", 60, false)?,
            sync_limit: positive(envs, "INFERGATE_SYNC_LIMIT", 1000usize)?,
        };

        let scope = match text(envs, "INFERGATE_RATE_LIMIT_SCOPE")
            .map(|v| v.to_ascii_lowercase())
            .as_deref()
        {
            None | Some("shared") => BucketScope::Shared,
            Some("per-key") => BucketScope::PerKey,
            Some(other) => {
                return Err(ConfigError::Invalid {
                    key: "INFERGATE_RATE_LIMIT_SCOPE",
                    value: other.to_string(),
                    reason: "expected one of: shared, per-key".to_string(),
                });
            }
        };
        let rate_limit = RateLimitConfig::new(
            positive(envs, "INFERGATE_RATE_LIMIT_RATE", 1900u32)?,
            seconds(envs, "INFERGATE_RATE_LIMIT_PERIOD_SECS", 60, false)?,
            seconds(envs, "INFERGATE_RATE_LIMIT_MAX_DELAY_SECS", 3600, true)?,
        )
        .with_scope(scope);
        let dispatch = DispatchConfig {
            rate_limit,
            chunk_size: positive(envs, "INFERGATE_DISPATCH_CHUNK_SIZE", 2000usize)?,
            workers: positive(envs, "INFERGATE_DISPATCH_WORKERS", default_workers())?,
            embedding_dimensions: positive(envs, "INFERGATE_EMBEDDING_DIMENSIONS", 256u32)?,
        };

        let backend = match text(envs, "INFERGATE_REGISTRY_BACKEND")
            .map(|v| v.to_ascii_lowercase())
            .as_deref()
        {
            None | Some("sqlite") => RegistryBackend::Sqlite,
            Some("memory") => RegistryBackend::Memory,
            Some("postgres") => RegistryBackend::Postgres,
            Some(other) => {
                return Err(ConfigError::Invalid {
                    key: "INFERGATE_REGISTRY_BACKEND",
                    value: other.to_string(),
                    reason: "expected one of: memory, sqlite, postgres".to_string(),
                });
            }
        };
        let registry = RegistryConfig {
            backend,
            sqlite_db_path: text(envs, "INFERGATE_SQLITE_DB")
                .unwrap_or_else(|| default_sqlite_db_path.to_string()),
            postgres_dsn: text(envs, "INFERGATE_POSTGRES_DSN"),
            postgres_schema: text(envs, "INFERGATE_POSTGRES_SCHEMA")
                .unwrap_or_else(|| "public".to_string()),
        };
        if registry.backend == RegistryBackend::Postgres && registry.postgres_dsn.is_none() {
            return Err(ConfigError::Missing("INFERGATE_POSTGRES_DSN"));
        }

        Ok(Self {
            model_id: text(envs, "INFERGATE_MODEL_ID")
                .unwrap_or_else(|| "amazon.titan-embed-text-v2:0".to_string()),
            batch,
            dispatch,
            registry,
        })
    }
}

impl BatchConfig {
    /// Admission settings; fails if the output root or execution role is not configured.
    pub fn admission(&self) -> Result<AdmissionConfig, ConfigError> {
        Ok(AdmissionConfig {
            max_concurrent_jobs: self.max_concurrent_jobs,
            job_name_prefix: self.job_name_prefix.clone(),
            output_root_uri: self
                .output_root_uri
                .clone()
                .ok_or(ConfigError::Missing("INFERGATE_OUTPUT_ROOT_URI"))?,
            execution_role: self
                .execution_role
                .clone()
                .ok_or(ConfigError::Missing("INFERGATE_EXECUTION_ROLE"))?,
            poison_threshold: self.poison_threshold,
        })
    }
}

impl RegistryConfig {
    pub fn open(&self) -> Result<Arc<dyn Registry>, ConfigError> {
        match self.backend {
            RegistryBackend::Memory => Ok(Arc::new(InMemoryRegistry::new())),
            RegistryBackend::Sqlite => self.open_sqlite(),
            RegistryBackend::Postgres => self.open_postgres(),
        }
    }

    fn open_sqlite(&self) -> Result<Arc<dyn Registry>, ConfigError> {
        #[cfg(feature = "sqlite-persistence")]
        {
            let registry = crate::registry::SqliteRegistry::new(&self.sqlite_db_path)?;
            Ok(Arc::new(registry))
        }
        #[cfg(not(feature = "sqlite-persistence"))]
        {
            Err(ConfigError::Unsupported(
                "INFERGATE_REGISTRY_BACKEND=sqlite requires feature 'sqlite-persistence'"
                    .to_string(),
            ))
        }
    }

    fn open_postgres(&self) -> Result<Arc<dyn Registry>, ConfigError> {
        #[cfg(feature = "registry-postgres")]
        {
            let dsn = self
                .postgres_dsn
                .clone()
                .ok_or(ConfigError::Missing("INFERGATE_POSTGRES_DSN"))?;
            let registry = crate::registry::PostgresRegistry::new(dsn)
                .with_schema(self.postgres_schema.clone());
            Ok(Arc::new(registry))
        }
        #[cfg(not(feature = "registry-postgres"))]
        {
            Err(ConfigError::Unsupported(
                "INFERGATE_REGISTRY_BACKEND=postgres requires feature 'registry-postgres'"
                    .to_string(),
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envs(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn defaults_apply_when_nothing_is_set() {
        let cfg = InfergateConfig::from_env_map("infergate.db", &HashMap::new()).unwrap();
        assert_eq!(cfg.batch.max_concurrent_jobs, 20);
        assert_eq!(cfg.batch.job_name_prefix, "embedding-batch-job");
        assert_eq!(cfg.batch.tick_interval, Duration::from_secs(60));
        assert_eq!(cfg.batch.poison_threshold, 5);
        assert_eq!(cfg.dispatch.rate_limit.rate, 1900);
        assert_eq!(cfg.dispatch.rate_limit.period, Duration::from_secs(60));
        assert_eq!(cfg.dispatch.rate_limit.max_delay, Duration::from_secs(3600));
        assert_eq!(cfg.dispatch.rate_limit.scope, BucketScope::Shared);
        assert_eq!(cfg.dispatch.chunk_size, 2000);
        assert!(cfg.dispatch.workers >= 1);
        assert_eq!(cfg.dispatch.embedding_dimensions, 256);
        assert_eq!(cfg.registry.backend, RegistryBackend::Sqlite);
        assert_eq!(cfg.registry.sqlite_db_path, "infergate.db");
        assert_eq!(cfg.model_id, "amazon.titan-embed-text-v2:0");
    }

    #[test]
    fn named_options_override_defaults() {
        let cfg = InfergateConfig::from_env_map(
            "infergate.db",
            &envs(&[
                ("INFERGATE_MAX_CONCURRENT_JOBS", " 7 "),
                ("INFERGATE_JOB_NAME_PREFIX", "emb"),
                ("INFERGATE_RATE_LIMIT_RATE", "50"),
                ("INFERGATE_RATE_LIMIT_MAX_DELAY_SECS", "0"),
                ("INFERGATE_RATE_LIMIT_SCOPE", "per-key"),
                ("INFERGATE_REGISTRY_BACKEND", "memory"),
            ]),
        )
        .unwrap();
        assert_eq!(cfg.batch.max_concurrent_jobs, 7);
        assert_eq!(cfg.batch.job_name_prefix, "emb");
        assert_eq!(cfg.dispatch.rate_limit.rate, 50);
        assert_eq!(cfg.dispatch.rate_limit.max_delay, Duration::ZERO);
        assert_eq!(cfg.dispatch.rate_limit.scope, BucketScope::PerKey);
        assert_eq!(cfg.registry.backend, RegistryBackend::Memory);
    }

    #[test]
    fn invalid_values_fail_fast() {
        for (key, value) in [
            ("INFERGATE_MAX_CONCURRENT_JOBS", "0"),
            ("INFERGATE_MAX_CONCURRENT_JOBS", "many"),
            ("INFERGATE_RATE_LIMIT_RATE", "0"),
            ("INFERGATE_RATE_LIMIT_PERIOD_SECS", "0"),
            ("INFERGATE_DISPATCH_CHUNK_SIZE", "0"),
            ("INFERGATE_DISPATCH_WORKERS", "0"),
            ("INFERGATE_EMBEDDING_DIMENSIONS", "0"),
            ("INFERGATE_RATE_LIMIT_PERIOD_SECS", "18446744073709551615"),
            ("INFERGATE_RATE_LIMIT_MAX_DELAY_SECS", "315360001"),
            ("INFERGATE_TICK_INTERVAL_SECS", "999999999999"),
            ("INFERGATE_RATE_LIMIT_SCOPE", "global"),
            ("INFERGATE_REGISTRY_BACKEND", "dynamo"),
        ] {
            let err = InfergateConfig::from_env_map("x.db", &envs(&[(key, value)])).unwrap_err();
            assert!(
                matches!(err, ConfigError::Invalid { key: k, .. } if k == key),
                "{key}={value} gave {err}"
            );
        }
    }

    #[test]
    fn postgres_backend_requires_dsn() {
        let err = InfergateConfig::from_env_map(
            "x.db",
            &envs(&[("INFERGATE_REGISTRY_BACKEND", "postgres")]),
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Missing("INFERGATE_POSTGRES_DSN")));
    }

    #[test]
    fn admission_requires_output_root_and_role() {
        let cfg = InfergateConfig::from_env_map("x.db", &HashMap::new()).unwrap();
        assert!(matches!(
            cfg.batch.admission(),
            Err(ConfigError::Missing("INFERGATE_OUTPUT_ROOT_URI"))
        ));

        let cfg = InfergateConfig::from_env_map(
            "x.db",
            &envs(&[
                ("INFERGATE_OUTPUT_ROOT_URI", "s3://out/"),
                ("INFERGATE_EXECUTION_ROLE", "arn:aws:iam::1:role/batch"),
            ]),
        )
        .unwrap();
        let admission = cfg.batch.admission().unwrap();
        assert_eq!(admission.output_root_uri, "s3://out/");
        assert_eq!(admission.execution_role, "arn:aws:iam::1:role/batch");
        assert_eq!(admission.max_concurrent_jobs, 20);
    }

    #[test]
    fn memory_registry_opens_without_features() {
        let cfg = InfergateConfig::from_env_map(
            "x.db",
            &envs(&[("INFERGATE_REGISTRY_BACKEND", "memory")]),
        )
        .unwrap();
        assert!(cfg.registry.open().is_ok());
    }
}
