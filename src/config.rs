use std::env;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Errors encountered while loading configuration from environment variables.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Required environment variable was not provided.
    #[error("Missing environment variable: {0}")]
    MissingVariable(String),
    /// Environment variable contained a value that could not be parsed.
    #[error("Invalid value for environment variable: {0}")]
    InvalidValue(String),
}

/// Runtime configuration for the resume intake service.
///
/// Built once at process start and shared through an `Arc`; components receive the
/// section they need instead of reading the environment themselves.
#[derive(Debug, Clone)]
pub struct Config {
    /// Object storage access used by the binary fetcher.
    pub storage: StorageSettings,
    /// Extraction engine policy and limits.
    pub extraction: ExtractionSettings,
    /// Chat-completion provider used to structure extracted text.
    pub llm: LlmSettings,
    /// Task persistence and worker pool sizing.
    pub tasks: TaskSettings,
    /// Optional override for the HTTP server port.
    pub server_port: Option<u16>,
}

/// Supabase-compatible storage settings.
#[derive(Debug, Clone)]
pub struct StorageSettings {
    /// Project base URL, e.g. `https://xyz.supabase.co`.
    pub base_url: String,
    /// Service or anon key sent with every storage request.
    pub api_key: String,
    /// Whether `api_key` is the service key (bypasses row level security).
    pub uses_service_key: bool,
    /// Bucket used when a document reference does not name one.
    pub default_bucket: String,
    /// Additional buckets a document reference may address explicitly.
    pub allowed_buckets: Vec<String>,
    /// Lifetime requested for signed download URLs.
    pub signed_url_ttl: Duration,
    /// Upper bound on the signed URL resolution step.
    pub sign_timeout: Duration,
    /// Total budget for resolution plus byte transfer.
    pub fetch_timeout: Duration,
    /// Largest document accepted before the transfer is aborted.
    pub max_document_bytes: usize,
}

/// Preferred extraction engine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EnginePreference {
    /// Parse the PDF inside the service process.
    InProcess,
    /// Shell out to an external `pdftotext` binary.
    External,
}

/// Extraction engine selection and limits.
#[derive(Debug, Clone)]
pub struct ExtractionSettings {
    /// Engine attempted first.
    pub preference: EnginePreference,
    /// Executable invoked by the external engine.
    pub pdftotext_path: PathBuf,
    /// Per-extraction timeout applied to each engine attempt.
    pub extract_timeout: Duration,
    /// Timeout for the external tool liveness check.
    pub check_timeout: Duration,
    /// Optional cap on the number of pages read from a document.
    pub max_pages: Option<usize>,
}

/// Supported chat-completion providers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LlmProvider {
    /// OpenAI or any OpenAI-compatible proxy.
    OpenAI,
    /// DeepSeek hosted API.
    DeepSeek,
}

/// Chat-completion settings for the structuring step.
#[derive(Debug, Clone)]
pub struct LlmSettings {
    /// Provider the base URL and defaults belong to.
    pub provider: LlmProvider,
    /// Base URL without a trailing `/v1`.
    pub base_url: String,
    /// Bearer token for the provider.
    pub api_key: String,
    /// Model identifier.
    pub model: String,
    /// Upper bound on one structuring call, stream included.
    pub timeout: Duration,
    /// Request a streamed response and aggregate the deltas.
    pub stream: bool,
}

/// Backing store for task records.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskStoreKind {
    /// Durable SQLite database.
    Sqlite,
    /// Process-local map; records vanish on restart.
    Memory,
}

/// Task persistence and dispatch settings.
#[derive(Debug, Clone)]
pub struct TaskSettings {
    /// Store implementation.
    pub store: TaskStoreKind,
    /// SQLite database file used when `store` is [`TaskStoreKind::Sqlite`].
    pub db_path: PathBuf,
    /// Number of concurrent orchestrator workers.
    pub workers: usize,
    /// Capacity of the dispatch queue.
    pub queue_capacity: usize,
}

const DEFAULT_BUCKET: &str = "resumes";
const DEFAULT_MAX_DOCUMENT_BYTES: usize = 20 * 1024 * 1024;
const OPENAI_BASE_URL: &str = "https://api.openai.com";
const DEEPSEEK_BASE_URL: &str = "https://api.deepseek.com";

impl Config {
    /// Read `.env` when present, then load configuration from the environment.
    pub fn load() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        let config = Self::from_env()?;
        tracing::debug!(
            storage_url = %config.storage.base_url,
            bucket = %config.storage.default_bucket,
            uses_service_key = config.storage.uses_service_key,
            engine = ?config.extraction.preference,
            provider = ?config.llm.provider,
            model = %config.llm.model,
            task_store = ?config.tasks.store,
            workers = config.tasks.workers,
            server_port = ?config.server_port,
            "Loaded configuration"
        );
        Ok(config)
    }

    /// Load configuration from environment variables, performing validation along the way.
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            storage: StorageSettings::from_env()?,
            extraction: ExtractionSettings::from_env()?,
            llm: LlmSettings::from_env()?,
            tasks: TaskSettings::from_env()?,
            server_port: load_parsed_optional("SERVER_PORT")?,
        })
    }
}

impl StorageSettings {
    fn from_env() -> Result<Self, ConfigError> {
        let base_url = sanitize_base_url(&load_env("SUPABASE_URL")?);
        if base_url.is_empty() {
            return Err(ConfigError::InvalidValue("SUPABASE_URL".into()));
        }
        let (api_key, uses_service_key) = match load_env_optional("SUPABASE_SERVICE_KEY") {
            Some(key) => (key, true),
            None => (
                load_env_optional("SUPABASE_ANON_KEY").ok_or_else(|| {
                    ConfigError::MissingVariable(
                        "SUPABASE_SERVICE_KEY or SUPABASE_ANON_KEY".into(),
                    )
                })?,
                false,
            ),
        };
        let default_bucket =
            load_env_optional("STORAGE_BUCKET").unwrap_or_else(|| DEFAULT_BUCKET.to_string());
        let allowed_buckets = load_env_optional("STORAGE_ALLOWED_BUCKETS")
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|bucket| !bucket.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        Ok(Self {
            base_url,
            api_key,
            uses_service_key,
            default_bucket,
            allowed_buckets,
            signed_url_ttl: Duration::from_secs(
                load_parsed_optional("SIGNED_URL_TTL_SECS")?.unwrap_or(60),
            ),
            sign_timeout: load_millis("STORAGE_SIGN_TIMEOUT_MS", 5_000)?,
            fetch_timeout: load_millis("STORAGE_FETCH_TIMEOUT_MS", 15_000)?,
            max_document_bytes: load_parsed_optional("MAX_DOCUMENT_BYTES")?
                .unwrap_or(DEFAULT_MAX_DOCUMENT_BYTES),
        })
    }

    /// Whether a document reference may address `bucket` explicitly.
    pub fn is_known_bucket(&self, bucket: &str) -> bool {
        bucket == self.default_bucket || self.allowed_buckets.iter().any(|b| b == bucket)
    }
}

impl ExtractionSettings {
    /// Load only the extraction section; used by tools that never touch storage or the LLM.
    pub fn from_env() -> Result<Self, ConfigError> {
        let preference = match load_env_optional("PDF_ENGINE") {
            Some(raw) => raw
                .parse()
                .map_err(|()| ConfigError::InvalidValue("PDF_ENGINE".into()))?,
            None => EnginePreference::InProcess,
        };
        Ok(Self {
            preference,
            pdftotext_path: load_env_optional("PDFTOTEXT_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("pdftotext")),
            extract_timeout: load_millis("EXTRACT_TIMEOUT_MS", 20_000)?,
            check_timeout: load_millis("CHECK_TIMEOUT_MS", 3_000)?,
            max_pages: load_parsed_optional("EXTRACT_MAX_PAGES")?,
        })
    }
}

impl Default for ExtractionSettings {
    fn default() -> Self {
        Self {
            preference: EnginePreference::InProcess,
            pdftotext_path: PathBuf::from("pdftotext"),
            extract_timeout: Duration::from_secs(20),
            check_timeout: Duration::from_secs(3),
            max_pages: None,
        }
    }
}

impl LlmSettings {
    fn from_env() -> Result<Self, ConfigError> {
        let explicit_base =
            load_env_optional("OPENAI_BASE_URL").map(|raw| sanitize_base_url(&raw));
        let provider = match load_env_optional("LLM_PROVIDER") {
            Some(raw) => raw
                .parse()
                .map_err(|()| ConfigError::InvalidValue("LLM_PROVIDER".into()))?,
            None => infer_provider(explicit_base.as_deref()),
        };
        let base_url = explicit_base
            .filter(|base| !base.is_empty())
            .unwrap_or_else(|| provider.default_base_url().to_string());
        let api_key = load_env_optional("OPENAI_API_KEY")
            .or_else(|| match provider {
                LlmProvider::DeepSeek => load_env_optional("DEEPSEEK_API_KEY"),
                LlmProvider::OpenAI => None,
            })
            .ok_or_else(|| ConfigError::MissingVariable("OPENAI_API_KEY".into()))?;
        let model = load_env_optional("MODEL_NAME")
            .unwrap_or_else(|| provider.default_model().to_string());
        let stream = match load_env_optional("LLM_STREAM") {
            Some(raw) => parse_bool(&raw)
                .ok_or_else(|| ConfigError::InvalidValue("LLM_STREAM".into()))?,
            None => true,
        };

        Ok(Self {
            provider,
            base_url,
            api_key,
            model,
            timeout: load_millis("LLM_TIMEOUT_MS", 60_000)?,
            stream,
        })
    }
}

impl LlmProvider {
    /// Public endpoint used when no base URL override is configured.
    pub fn default_base_url(self) -> &'static str {
        match self {
            Self::OpenAI => OPENAI_BASE_URL,
            Self::DeepSeek => DEEPSEEK_BASE_URL,
        }
    }

    /// Model used when `MODEL_NAME` is not set.
    pub fn default_model(self) -> &'static str {
        match self {
            Self::OpenAI => "gpt-4o-mini",
            Self::DeepSeek => "deepseek-chat",
        }
    }
}

impl TaskSettings {
    fn from_env() -> Result<Self, ConfigError> {
        let store = match load_env_optional("TASK_STORE") {
            Some(raw) => raw
                .parse()
                .map_err(|()| ConfigError::InvalidValue("TASK_STORE".into()))?,
            None => TaskStoreKind::Sqlite,
        };
        let workers: usize = load_parsed_optional("TASK_WORKERS")?.unwrap_or(4);
        let queue_capacity: usize = load_parsed_optional("TASK_QUEUE_CAPACITY")?.unwrap_or(64);
        if workers == 0 {
            return Err(ConfigError::InvalidValue("TASK_WORKERS".into()));
        }
        if queue_capacity == 0 {
            return Err(ConfigError::InvalidValue("TASK_QUEUE_CAPACITY".into()));
        }
        Ok(Self {
            store,
            db_path: load_env_optional("TASK_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("data/tasks.db")),
            workers,
            queue_capacity,
        })
    }
}

fn load_env(key: &str) -> Result<String, ConfigError> {
    env::var(key)
        .ok()
        .filter(|value| !value.trim().is_empty())
        .ok_or_else(|| ConfigError::MissingVariable(key.to_string()))
}

fn load_env_optional(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn load_parsed_optional<T: std::str::FromStr>(key: &str) -> Result<Option<T>, ConfigError> {
    load_env_optional(key)
        .map(|value| {
            value
                .parse()
                .map_err(|_| ConfigError::InvalidValue(key.to_string()))
        })
        .transpose()
}

fn load_millis(key: &str, default_ms: u64) -> Result<Duration, ConfigError> {
    let millis = load_parsed_optional(key)?.unwrap_or(default_ms);
    if millis == 0 {
        return Err(ConfigError::InvalidValue(key.to_string()));
    }
    Ok(Duration::from_millis(millis))
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Strip trailing slashes and a trailing `/v1` segment from a base URL.
pub fn sanitize_base_url(raw: &str) -> String {
    let trimmed = raw.trim().trim_end_matches('/');
    let split = trimmed
        .len()
        .checked_sub(3)
        .and_then(|idx| trimmed.get(idx..).map(|tail| (idx, tail)));
    let without_version = match split {
        Some((idx, tail)) if tail.eq_ignore_ascii_case("/v1") => &trimmed[..idx],
        _ => trimmed,
    };
    without_version.trim_end_matches('/').to_string()
}

fn infer_provider(base_url: Option<&str>) -> LlmProvider {
    match base_url {
        Some(base) if base.to_ascii_lowercase().contains("deepseek") => LlmProvider::DeepSeek,
        _ => LlmProvider::OpenAI,
    }
}

impl std::str::FromStr for EnginePreference {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "in-process" | "in_process" | "inprocess" | "native" => Ok(Self::InProcess),
            "external" | "external-process" | "pdftotext" => Ok(Self::External),
            _ => Err(()),
        }
    }
}

impl std::str::FromStr for LlmProvider {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "openai" => Ok(Self::OpenAI),
            "deepseek" => Ok(Self::DeepSeek),
            _ => Err(()),
        }
    }
}

impl std::str::FromStr for TaskStoreKind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "sqlite" => Ok(Self::Sqlite),
            "memory" => Ok(Self::Memory),
            _ => Err(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_base_url_strips_version_and_slashes() {
        assert_eq!(
            sanitize_base_url("https://api.deepseek.com/v1/"),
            "https://api.deepseek.com"
        );
        assert_eq!(
            sanitize_base_url(" https://proxy.local/openai/V1 "),
            "https://proxy.local/openai"
        );
        assert_eq!(
            sanitize_base_url("https://api.openai.com"),
            "https://api.openai.com"
        );
    }

    #[test]
    fn provider_inferred_from_base_url() {
        assert_eq!(
            infer_provider(Some("https://api.deepseek.com")),
            LlmProvider::DeepSeek
        );
        assert_eq!(
            infer_provider(Some("https://proxy.local")),
            LlmProvider::OpenAI
        );
        assert_eq!(infer_provider(None), LlmProvider::OpenAI);
    }

    #[test]
    fn engine_preference_accepts_aliases() {
        assert_eq!("in-process".parse(), Ok(EnginePreference::InProcess));
        assert_eq!("External".parse(), Ok(EnginePreference::External));
        assert_eq!("pdftotext".parse(), Ok(EnginePreference::External));
        assert!("ocr".parse::<EnginePreference>().is_err());
    }

    #[test]
    fn parse_bool_recognizes_common_spellings() {
        assert_eq!(parse_bool("TRUE"), Some(true));
        assert_eq!(parse_bool("0"), Some(false));
        assert_eq!(parse_bool("maybe"), None);
    }
}
