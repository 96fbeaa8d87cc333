// Application configuration, read from RUNNER_* environment variables
use anyhow::{bail, Context, Result};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

pub const ENV_PREFIX: &str = "RUNNER_";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Clone)]
pub struct SandboxConfig {
    pub timeout: Duration,
    pub memory_bytes: i64,
    pub cpus: f64,
    pub network_disabled: bool,
    pub output_limit: usize,
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub min: usize,
    pub max: usize,
    pub scale_interval: Duration,
    pub dequeue_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub debug: bool,
    pub host_root_dir: PathBuf,
    pub bind_address: String,
    pub redis_url: String,
    pub spec_path: PathBuf,
    pub questions_dir: PathBuf,
    pub sandbox: SandboxConfig,
    pub worker: WorkerConfig,
    pub shutdown_grace: Duration,
    pub log_format: LogFormat,
}

impl RunnerConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary variable source. Keys are looked up with the
    /// `RUNNER_` prefix.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env { lookup };

        let memory: String = env.get("SANDBOX_MEMORY", "100M".to_string())?;
        let log_format = match env.get("LOG_FORMAT", "text".to_string())?.to_lowercase().as_str() {
            "json" => LogFormat::Json,
            "text" | "" => LogFormat::Text,
            other => bail!("{}LOG_FORMAT must be 'text' or 'json', got '{}'", ENV_PREFIX, other),
        };

        let config = Self {
            debug: env.get("DEBUG", false)?,
            host_root_dir: PathBuf::from(env.get("HOSTROOTDIR", "./data".to_string())?),
            bind_address: env.get("API_BINDADDRESS", "0.0.0.0:8080".to_string())?,
            redis_url: env.get("REDIS_URL", "redis://127.0.0.1:6379".to_string())?,
            spec_path: PathBuf::from(env.get("SPEC_PATH", "config/spec.json".to_string())?),
            questions_dir: PathBuf::from(env.get("QUESTIONS_DIR", "questions".to_string())?),
            sandbox: SandboxConfig {
                timeout: Duration::from_secs(env.get("SANDBOX_TIMEOUTSECONDS", 20)?),
                memory_bytes: parse_memory(&memory)
                    .with_context(|| format!("Invalid {}SANDBOX_MEMORY", ENV_PREFIX))?,
                cpus: env.get("SANDBOX_CPUS", 1.0)?,
                network_disabled: env.get("SANDBOX_NETWORKDISABLED", true)?,
                output_limit: env.get("SANDBOX_OUTPUTLIMIT", 1024 * 1024)?,
            },
            worker: WorkerConfig {
                min: env.get("WORKER_MIN", 2)?,
                max: env.get("WORKER_MAX", 10)?,
                scale_interval: Duration::from_secs(env.get("WORKER_SCALEINTERVALSECONDS", 3)?),
                dequeue_timeout: Duration::from_secs(env.get("WORKER_DEQUEUETIMEOUTSECONDS", 2)?),
            },
            shutdown_grace: Duration::from_secs(env.get("SHUTDOWN_GRACESECONDS", 10)?),
            log_format,
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.worker.max == 0 {
            bail!("{}WORKER_MAX must be at least 1", ENV_PREFIX);
        }
        if self.worker.min > self.worker.max {
            bail!(
                "{}WORKER_MIN ({}) exceeds {}WORKER_MAX ({})",
                ENV_PREFIX,
                self.worker.min,
                ENV_PREFIX,
                self.worker.max
            );
        }
        if self.sandbox.timeout.is_zero() {
            bail!("{}SANDBOX_TIMEOUTSECONDS must be positive", ENV_PREFIX);
        }
        if self.sandbox.cpus <= 0.0 {
            bail!("{}SANDBOX_CPUS must be positive", ENV_PREFIX);
        }
        if self.worker.dequeue_timeout.is_zero() {
            bail!("{}WORKER_DEQUEUETIMEOUTSECONDS must be positive", ENV_PREFIX);
        }
        Ok(())
    }
}

struct Env<F> {
    lookup: F,
}

impl<F> Env<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn get<T>(&self, key: &str, default: T) -> Result<T>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        let name = format!("{}{}", ENV_PREFIX, key);
        match (self.lookup)(&name) {
            Some(raw) if !raw.trim().is_empty() => raw
                .trim()
                .parse::<T>()
                .map_err(|e| anyhow::anyhow!("Invalid value for {}: '{}' ({})", name, raw, e)),
            _ => Ok(default),
        }
    }
}

/// Parse a docker-style memory amount (`512k`, `100M`, `1g`, plain bytes).
pub fn parse_memory(value: &str) -> Result<i64> {
    let value = value.trim();
    let (digits, multiplier) = match value.chars().last() {
        Some('k' | 'K') => (&value[..value.len() - 1], 1024),
        Some('m' | 'M') => (&value[..value.len() - 1], 1024 * 1024),
        Some('g' | 'G') => (&value[..value.len() - 1], 1024 * 1024 * 1024),
        Some('b' | 'B') => (&value[..value.len() - 1], 1),
        _ => (value, 1),
    };
    let amount: i64 = digits
        .trim()
        .parse()
        .with_context(|| format!("'{}' is not a memory amount", value))?;
    if amount <= 0 {
        bail!("memory amount must be positive, got '{}'", value);
    }
    Ok(amount * multiplier)
}
