//! Environment-driven configuration.
//!
//! Every key is a flat environment variable; `.env` files are honored by the
//! binary before this module reads anything. Missing or unparseable required
//! keys are fatal at startup.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Error type for configuration loading.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required key is absent.
    #[error("missing required configuration key {0}")]
    Missing(&'static str),

    /// A key is present but unusable.
    #[error("invalid value for {key}: {message}")]
    Invalid {
        /// The offending key.
        key: &'static str,
        /// Why the value was rejected.
        message: String,
    },
}

/// Which e-mail transport to bind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmailProvider {
    /// POP3 adapter (external).
    Pop3,
    /// IMAP adapter with an SMTP reply sibling (external).
    Imap,
    /// In-memory mock transport.
    Mock,
}

/// Which object store binding to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectStoreBackend {
    /// In-memory, for tests and local development.
    Memory,
    /// Local filesystem rooted at `OBJECT_STORE_ROOT`.
    Fs,
    /// S3-compatible store (external adapter).
    S3,
}

/// E-mail transport settings.
#[derive(Debug, Clone)]
pub struct EmailConfig {
    /// Bound provider.
    pub provider: EmailProvider,
    /// Mail server host (pop3/imap).
    pub host: Option<String>,
    /// Mail server port (pop3/imap).
    pub port: Option<u16>,
    /// Mailbox user (pop3/imap).
    pub username: Option<String>,
    /// Mailbox password (pop3/imap).
    pub password: Option<String>,
}

/// Object store settings.
#[derive(Debug, Clone)]
pub struct ObjectStoreConfig {
    /// Selected binding.
    pub backend: ObjectStoreBackend,
    /// Root directory for the fs binding.
    pub root: Option<PathBuf>,
    /// Endpoint URL for the s3 binding.
    pub endpoint: Option<String>,
    /// Access key for the s3 binding.
    pub access_key: Option<String>,
    /// Secret key for the s3 binding.
    pub secret_key: Option<String>,
    /// Bucket name for the s3 binding.
    pub bucket: Option<String>,
    /// Whether the s3 binding uses TLS.
    pub ssl: bool,
    /// Optional key prefix such as `test-42/`, applied to every stored object.
    pub test_prefix: Option<String>,
}

/// Outbound API settings.
#[derive(Debug, Clone)]
pub struct ApiConfig {
    /// Base URL of the API.
    pub base_url: String,
    /// Path the batches are POSTed to.
    pub endpoint: String,
    /// Value of the `X-API-Key` header, if any.
    pub api_key: Option<String>,
    /// Bearer token, if any.
    pub bearer_token: Option<String>,
    /// Request timeout.
    pub timeout: Duration,
}

impl ApiConfig {
    /// The full URL batches are POSTed to.
    pub fn url(&self) -> String {
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            self.endpoint.trim_start_matches('/')
        )
    }
}

/// Job engine settings.
#[derive(Debug, Clone)]
pub struct JobsConfig {
    /// Workers on the default queue.
    pub worker_count: usize,
    /// Retry schedule for handlers without their own.
    pub retry_delays_secs: Vec<u64>,
    /// Lease TTL for claimed jobs.
    pub lease_ttl: Duration,
    /// Deployment prefix namespacing all job-store rows.
    pub prefix: String,
    /// Retention window for terminal jobs.
    pub purge_after: Duration,
    /// Maximum rows per dispatched batch.
    pub batch_size: usize,
}

/// Fully loaded application configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// PostgreSQL connection string for the Job Store.
    pub database_url: String,
    /// Address the control surface listens on.
    pub http_listen_addr: SocketAddr,
    /// E-mail transport settings.
    pub email: EmailConfig,
    /// Object store settings.
    pub object_store: ObjectStoreConfig,
    /// Outbound API settings.
    pub api: ApiConfig,
    /// Job engine settings.
    pub jobs: JobsConfig,
    /// Cron expression of the recurring e-mail poll.
    pub email_polling_cron: String,
}

impl Config {
    /// Load from process environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(&|key| std::env::var(key).ok())
    }

    /// Load from an arbitrary key lookup (used by tests).
    pub fn from_lookup(lookup: &dyn Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let env = Env(lookup);

        let email = EmailConfig {
            provider: env.parsed_or("EMAIL_PROVIDER", EmailProvider::Mock)?,
            host: env.get("EMAIL_HOST"),
            port: env.parsed_opt("EMAIL_PORT")?,
            username: env.get("EMAIL_USERNAME"),
            password: env.get("EMAIL_PASSWORD"),
        };
        if email.provider != EmailProvider::Mock {
            for (key, value) in [
                ("EMAIL_HOST", email.host.is_some()),
                ("EMAIL_PORT", email.port.is_some()),
                ("EMAIL_USERNAME", email.username.is_some()),
                ("EMAIL_PASSWORD", email.password.is_some()),
            ] {
                if !value {
                    return Err(ConfigError::Missing(key));
                }
            }
        }

        let object_store = ObjectStoreConfig {
            backend: env.parsed_or("OBJECT_STORE_BACKEND", ObjectStoreBackend::Memory)?,
            root: env.get("OBJECT_STORE_ROOT").map(PathBuf::from),
            endpoint: env.get("OBJECT_STORE_ENDPOINT"),
            access_key: env.get("OBJECT_STORE_ACCESS_KEY"),
            secret_key: env.get("OBJECT_STORE_SECRET_KEY"),
            bucket: env.get("OBJECT_STORE_BUCKET"),
            ssl: env.parsed_or("OBJECT_STORE_SSL", true)?,
            test_prefix: env.get("OBJECT_STORE_TEST_PREFIX"),
        };
        match object_store.backend {
            ObjectStoreBackend::Fs if object_store.root.is_none() => {
                return Err(ConfigError::Missing("OBJECT_STORE_ROOT"));
            }
            ObjectStoreBackend::S3 => {
                for (key, value) in [
                    ("OBJECT_STORE_ENDPOINT", object_store.endpoint.is_some()),
                    ("OBJECT_STORE_ACCESS_KEY", object_store.access_key.is_some()),
                    ("OBJECT_STORE_SECRET_KEY", object_store.secret_key.is_some()),
                    ("OBJECT_STORE_BUCKET", object_store.bucket.is_some()),
                ] {
                    if !value {
                        return Err(ConfigError::Missing(key));
                    }
                }
            }
            _ => {}
        }

        let api = ApiConfig {
            base_url: env.required("API_BASE_URL")?,
            endpoint: env
                .get("API_ENDPOINT")
                .unwrap_or_else(|| "/api/price-lists".to_string()),
            api_key: env.get("API_KEY"),
            bearer_token: env.get("API_BEARER_TOKEN"),
            timeout: Duration::from_secs(env.parsed_or("API_TIMEOUT_SECONDS", 30u64)?),
        };

        let jobs = JobsConfig {
            worker_count: env.parsed_or("JOBS_WORKER_COUNT", default_worker_count())?,
            retry_delays_secs: env.delays("JOBS_RETRY_DELAYS_SECONDS")?,
            lease_ttl: Duration::from_secs(env.parsed_or("JOBS_LEASE_TTL_SECONDS", 120u64)?),
            prefix: env.get("JOBS_PREFIX").unwrap_or_default(),
            purge_after: Duration::from_secs(
                env.parsed_or("JOBS_PURGE_AFTER_SECONDS", 7 * 24 * 60 * 60u64)?,
            ),
            batch_size: env.parsed_or("JOBS_BATCH_SIZE", 1000usize)?.max(1),
        };

        Ok(Config {
            database_url: env.required("DATABASE_URL")?,
            http_listen_addr: env.parsed_or(
                "HTTP_LISTEN_ADDR",
                SocketAddr::from(([0, 0, 0, 0], 8080)),
            )?,
            email,
            object_store,
            api,
            jobs,
            email_polling_cron: env
                .get("EMAIL_POLLING_CRON")
                .unwrap_or_else(|| "*/5 * * * *".to_string()),
        })
    }
}

fn default_worker_count() -> usize {
    std::thread::available_parallelism()
        .map(std::num::NonZeroUsize::get)
        .unwrap_or(4)
}

struct Env<'a>(&'a dyn Fn(&str) -> Option<String>);

impl Env<'_> {
    fn get(&self, key: &str) -> Option<String> {
        (self.0)(key).filter(|value| !value.is_empty())
    }

    fn required(&self, key: &'static str) -> Result<String, ConfigError> {
        self.get(key).ok_or(ConfigError::Missing(key))
    }

    fn parsed_opt<T: std::str::FromStr>(&self, key: &'static str) -> Result<Option<T>, ConfigError>
    where
        T::Err: std::fmt::Display,
    {
        match self.get(key) {
            None => Ok(None),
            Some(raw) => raw.parse().map(Some).map_err(|err: T::Err| ConfigError::Invalid {
                key,
                message: err.to_string(),
            }),
        }
    }

    fn parsed_or<T: std::str::FromStr>(&self, key: &'static str, default: T) -> Result<T, ConfigError>
    where
        T::Err: std::fmt::Display,
    {
        Ok(self.parsed_opt(key)?.unwrap_or(default))
    }

    fn delays(&self, key: &'static str) -> Result<Vec<u64>, ConfigError> {
        let Some(raw) = self.get(key) else {
            return Ok(crate::DEFAULT_RETRY_DELAYS_SECS.to_vec());
        };

        raw.split(',')
            .map(|part| {
                part.trim().parse::<u64>().map_err(|err| ConfigError::Invalid {
                    key,
                    message: format!("`{part}`: {err}"),
                })
            })
            .collect()
    }
}

impl std::str::FromStr for EmailProvider {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "pop3" => Ok(EmailProvider::Pop3),
            "imap" => Ok(EmailProvider::Imap),
            "mock" => Ok(EmailProvider::Mock),
            other => Err(format!("unknown email provider `{other}`")),
        }
    }
}

impl std::str::FromStr for ObjectStoreBackend {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "memory" => Ok(ObjectStoreBackend::Memory),
            "fs" => Ok(ObjectStoreBackend::Fs),
            "s3" => Ok(ObjectStoreBackend::S3),
            other => Err(format!("unknown object store backend `{other}`")),
        }
    }
}

/// Convenience for tests: a lookup backed by a map.
pub fn map_lookup(map: HashMap<&'static str, &'static str>) -> impl Fn(&str) -> Option<String> {
    move |key| map.get(key).map(|value| (*value).to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_env() -> HashMap<&'static str, &'static str> {
        HashMap::from([
            ("DATABASE_URL", "postgres://localhost/pricefeed"),
            ("API_BASE_URL", "http://localhost:9000"),
        ])
    }

    #[test]
    fn defaults_fill_everything_but_the_required_keys() {
        let lookup = map_lookup(base_env());
        let config = Config::from_lookup(&lookup).unwrap();

        assert_eq!(config.email.provider, EmailProvider::Mock);
        assert_eq!(config.object_store.backend, ObjectStoreBackend::Memory);
        assert_eq!(config.api.timeout, Duration::from_secs(30));
        assert_eq!(config.api.url(), "http://localhost:9000/api/price-lists");
        assert_eq!(config.jobs.retry_delays_secs, vec![300, 600, 900]);
        assert_eq!(config.jobs.batch_size, 1000);
        assert_eq!(config.email_polling_cron, "*/5 * * * *");
    }

    #[test]
    fn missing_database_url_is_fatal() {
        let lookup = map_lookup(HashMap::from([("API_BASE_URL", "http://localhost")]));
        assert!(matches!(
            Config::from_lookup(&lookup),
            Err(ConfigError::Missing("DATABASE_URL"))
        ));
    }

    #[test]
    fn retry_delays_parse_from_a_comma_list() {
        let mut env = base_env();
        env.insert("JOBS_RETRY_DELAYS_SECONDS", "1, 2,3");
        let lookup = map_lookup(env);
        let config = Config::from_lookup(&lookup).unwrap();
        assert_eq!(config.jobs.retry_delays_secs, vec![1, 2, 3]);
    }

    #[test]
    fn non_mock_providers_demand_credentials() {
        let mut env = base_env();
        env.insert("EMAIL_PROVIDER", "imap");
        let lookup = map_lookup(env);
        assert!(matches!(
            Config::from_lookup(&lookup),
            Err(ConfigError::Missing("EMAIL_HOST"))
        ));
    }

    #[test]
    fn s3_backend_demands_its_settings() {
        let mut env = base_env();
        env.insert("OBJECT_STORE_BACKEND", "s3");
        env.insert("OBJECT_STORE_ENDPOINT", "https://s3.example.com");
        let lookup = map_lookup(env);
        assert!(matches!(
            Config::from_lookup(&lookup),
            Err(ConfigError::Missing("OBJECT_STORE_ACCESS_KEY"))
        ));
    }

    #[test]
    fn bad_numbers_are_reported_with_their_key() {
        let mut env = base_env();
        env.insert("API_TIMEOUT_SECONDS", "soon");
        let lookup = map_lookup(env);
        assert!(matches!(
            Config::from_lookup(&lookup),
            Err(ConfigError::Invalid {
                key: "API_TIMEOUT_SECONDS",
                ..
            })
        ));
    }
}
