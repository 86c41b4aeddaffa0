use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
pub const LMSTUDIO_BASE_URL: &str = "http://localhost:1234/v1";
pub const DEFAULT_OPENAI_MODEL: &str = "gpt-3.5-turbo";
pub const DEFAULT_LOCAL_MODEL: &str = "local-model";
pub const DEFAULT_LOG_DIR: &str = "conversation_logs";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("OPENAI_API_KEY is not set")]
    MissingApiKey,

    #[error("invalid value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
}

impl ConfigError {
    fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidValue { field, reason: reason.into() }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    #[default]
    OpenAi,
    LmStudio,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::OpenAi => "openai",
            Provider::LmStudio => "lmstudio",
        }
    }

    fn default_base_url(&self) -> &'static str {
        match self {
            Provider::OpenAi => OPENAI_BASE_URL,
            Provider::LmStudio => LMSTUDIO_BASE_URL,
        }
    }

    fn parse(raw: &str) -> Result<Self, ConfigError> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "openai" => Ok(Provider::OpenAi),
            "lmstudio" | "lm-studio" | "local" => Ok(Provider::LmStudio),
            other => Err(ConfigError::invalid("PROVIDER", format!("unknown provider `{other}`"))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelParams {
    pub temperature: f32,
    pub max_tokens: u32,
}

impl Default for ModelParams {
    fn default() -> Self {
        Self { temperature: 0.7, max_tokens: 512 }
    }
}

/// Settings for a model file served by LM Studio. Recorded in the session log
/// but never interpreted by this program.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LocalModelParams {
    pub model_path: Option<PathBuf>,
    pub n_ctx: u32,
    pub n_gpu_layers: i32,
}

impl Default for LocalModelParams {
    fn default() -> Self {
        Self { model_path: None, n_ctx: 2048, n_gpu_layers: -1 }
    }
}

/// Raw values as found in the environment (and `.env`).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EnvDefaults {
    pub provider: Option<String>,
    pub api_key: Option<String>,
    pub base_url: Option<String>,
    pub model: Option<String>,
    pub model_path: Option<String>,
    pub model_index: Option<String>,
    pub temperature: Option<String>,
    pub max_tokens: Option<String>,
    pub n_ctx: Option<String>,
    pub n_gpu_layers: Option<String>,
    pub request_timeout_secs: Option<String>,
    pub max_retries: Option<String>,
    pub max_rounds: Option<String>,
    pub log_dir: Option<String>,
}

impl EnvDefaults {
    /// Loads `.env` from the working directory (if any), then reads the process
    /// environment.
    pub fn load() -> Self {
        match dotenvy::dotenv() {
            Ok(path) => tracing::debug!(path = %path.display(), "loaded .env"),
            Err(err) if err.not_found() => tracing::debug!("no .env file"),
            Err(err) => tracing::warn!(error = %err, "ignoring unreadable .env"),
        }
        Self::from_env()
    }

    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        Self {
            provider: get("PROVIDER"),
            api_key: get("OPENAI_API_KEY"),
            base_url: get("API_BASE_URL").or_else(|| get("OPENAI_BASE_URL")),
            model: get("MODEL_NAME"),
            model_path: get("MODEL_PATH"),
            model_index: get("MODEL_INDEX"),
            temperature: get("TEMPERATURE"),
            max_tokens: get("MAX_TOKENS"),
            n_ctx: get("N_CTX"),
            n_gpu_layers: get("N_GPU_LAYERS"),
            request_timeout_secs: get("REQUEST_TIMEOUT_SECS"),
            max_retries: get("MAX_RETRIES"),
            max_rounds: get("MAX_ROUNDS"),
            log_dir: get("LOG_DIR"),
        }
    }
}

/// Values given on the command line. Each one wins over the environment.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Overrides {
    pub local: bool,
    pub base_url: Option<String>,
    pub model: Option<String>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub max_rounds: Option<u32>,
    pub log_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub provider: Provider,
    pub api_key: Option<String>,
    pub base_url: String,
    pub model: String,
    pub model_params: ModelParams,
    pub local: LocalModelParams,
    pub request_timeout: Duration,
    pub max_retries: u32,
    pub max_rounds: u32,
    pub log_dir: PathBuf,
}

impl Settings {
    pub fn require_api_key(&self) -> Result<(), ConfigError> {
        if self.provider == Provider::OpenAi && self.api_key.is_none() {
            return Err(ConfigError::MissingApiKey);
        }
        Ok(())
    }
}

pub fn resolve_settings(env: &EnvDefaults, overrides: &Overrides) -> Result<Settings, ConfigError> {
    let provider = if overrides.local {
        Provider::LmStudio
    } else {
        env.provider.as_deref().map(Provider::parse).transpose()?.unwrap_or_default()
    };

    let base_url = overrides
        .base_url
        .clone()
        .or_else(|| env.base_url.clone())
        .unwrap_or_else(|| provider.default_base_url().to_string());
    let parsed = url::Url::parse(&base_url).map_err(|e| ConfigError::invalid("API_BASE_URL", e.to_string()))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(ConfigError::invalid("API_BASE_URL", format!("unsupported scheme `{}`", parsed.scheme())));
    }
    let base_url = base_url.trim_end_matches('/').to_string();

    let model_path = env.model_path.as_ref().map(PathBuf::from);
    let model = overrides
        .model
        .clone()
        .or_else(|| env.model.clone())
        .or_else(|| match provider {
            Provider::LmStudio => model_path.as_deref().and_then(model_id_from_path),
            Provider::OpenAi => None,
        })
        .unwrap_or_else(|| match provider {
            Provider::OpenAi => DEFAULT_OPENAI_MODEL.to_string(),
            Provider::LmStudio => DEFAULT_LOCAL_MODEL.to_string(),
        });

    let defaults = ModelParams::default();
    let temperature = match overrides.temperature {
        Some(t) => t,
        None => parse_or("TEMPERATURE", env.temperature.as_deref(), defaults.temperature)?,
    };
    if !(0.0..=2.0).contains(&temperature) {
        return Err(ConfigError::invalid("TEMPERATURE", format!("{temperature} is outside 0.0..=2.0")));
    }
    let max_tokens = match overrides.max_tokens {
        Some(n) => n,
        None => parse_or("MAX_TOKENS", env.max_tokens.as_deref(), defaults.max_tokens)?,
    };
    if max_tokens == 0 {
        return Err(ConfigError::invalid("MAX_TOKENS", "must be greater than zero"));
    }

    let local_defaults = LocalModelParams::default();
    let local = LocalModelParams {
        model_path,
        n_ctx: parse_or("N_CTX", env.n_ctx.as_deref(), local_defaults.n_ctx)?,
        n_gpu_layers: parse_or("N_GPU_LAYERS", env.n_gpu_layers.as_deref(), local_defaults.n_gpu_layers)?,
    };

    let timeout_secs: u64 = parse_or("REQUEST_TIMEOUT_SECS", env.request_timeout_secs.as_deref(), 120)?;
    let max_retries = parse_or("MAX_RETRIES", env.max_retries.as_deref(), 2)?;
    let max_rounds = match overrides.max_rounds {
        Some(n) => n,
        None => parse_or("MAX_ROUNDS", env.max_rounds.as_deref(), 1)?,
    };
    if max_rounds == 0 {
        return Err(ConfigError::invalid("MAX_ROUNDS", "must be at least 1"));
    }

    let log_dir = overrides
        .log_dir
        .clone()
        .or_else(|| env.log_dir.as_ref().map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_LOG_DIR));

    Ok(Settings {
        provider,
        api_key: env.api_key.clone(),
        base_url,
        model,
        model_params: ModelParams { temperature, max_tokens },
        local,
        request_timeout: Duration::from_secs(timeout_secs),
        max_retries,
        max_rounds,
        log_dir,
    })
}

fn parse_or<T: std::str::FromStr>(field: &'static str, raw: Option<&str>, default: T) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match raw {
        Some(v) => v.trim().parse().map_err(|e: T::Err| ConfigError::invalid(field, format!("`{v}`: {e}"))),
        None => Ok(default),
    }
}

fn model_id_from_path(path: &Path) -> Option<String> {
    path.file_stem().map(|s| s.to_string_lossy().into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env_from(pairs: &[(&str, &str)]) -> EnvDefaults {
        let map: HashMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        EnvDefaults::from_lookup(|k| map.get(k).cloned())
    }

    #[test]
    fn precedence_cli_over_env_over_defaults() {
        let env = env_from(&[
            ("OPENAI_API_KEY", "sk-test"),
            ("MODEL_NAME", "env-model"),
            ("TEMPERATURE", "0.2"),
            ("MAX_TOKENS", "1000"),
        ]);
        let overrides = Overrides {
            model: Some("cli-model".into()),
            max_tokens: Some(2048),
            ..Default::default()
        };

        let s = resolve_settings(&env, &overrides).unwrap();

        assert_eq!(s.provider, Provider::OpenAi);
        assert_eq!(s.model, "cli-model"); // from cli
        assert_eq!(s.model_params.temperature, 0.2); // from env
        assert_eq!(s.model_params.max_tokens, 2048); // from cli
        assert_eq!(s.base_url, OPENAI_BASE_URL); // default
        assert_eq!(s.max_rounds, 1);
        assert_eq!(s.log_dir, PathBuf::from(DEFAULT_LOG_DIR));
        assert!(s.require_api_key().is_ok());
    }

    #[test]
    fn local_flag_switches_defaults_and_needs_no_key() {
        let env = env_from(&[("MODEL_PATH", "/models/qwen2.5-7b-instruct-q4_k_m.gguf"), ("N_CTX", "4096")]);
        let s = resolve_settings(&env, &Overrides { local: true, ..Default::default() }).unwrap();

        assert_eq!(s.provider, Provider::LmStudio);
        assert_eq!(s.base_url, LMSTUDIO_BASE_URL);
        assert_eq!(s.model, "qwen2.5-7b-instruct-q4_k_m");
        assert_eq!(s.local.n_ctx, 4096);
        assert_eq!(s.local.n_gpu_layers, -1);
        assert!(s.require_api_key().is_ok());
    }

    #[test]
    fn openai_without_key_is_rejected() {
        let s = resolve_settings(&EnvDefaults::default(), &Overrides::default()).unwrap();
        assert!(matches!(s.require_api_key(), Err(ConfigError::MissingApiKey)));
    }

    #[test]
    fn blank_env_values_are_ignored() {
        let env = env_from(&[("MODEL_NAME", "  "), ("OPENAI_BASE_URL", "http://10.0.0.2:8000/v1/")]);
        let s = resolve_settings(&env, &Overrides::default()).unwrap();
        assert_eq!(s.model, DEFAULT_OPENAI_MODEL);
        assert_eq!(s.base_url, "http://10.0.0.2:8000/v1");
    }

    #[test]
    fn invalid_values_name_the_field() {
        let cases = [
            ("TEMPERATURE", "warm"),
            ("TEMPERATURE", "3.5"),
            ("MAX_TOKENS", "0"),
            ("MAX_ROUNDS", "0"),
            ("API_BASE_URL", "ftp://example.com"),
            ("PROVIDER", "bard"),
        ];
        for (key, value) in cases {
            let err = resolve_settings(&env_from(&[(key, value)]), &Overrides::default()).unwrap_err();
            match err {
                ConfigError::InvalidValue { field, .. } => assert_eq!(field, key, "{key}={value}"),
                other => panic!("unexpected error for {key}={value}: {other}"),
            }
        }
    }

    #[derive(Clone, Default)]
    struct Captured(std::sync::Arc<std::sync::Mutex<Vec<u8>>>);

    impl std::io::Write for Captured {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn env_loading_is_visible_to_an_installed_subscriber() {
        let out = Captured::default();
        let writer = out.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_writer(move || writer.clone())
            .finish();

        tracing::subscriber::with_default(subscriber, EnvDefaults::load);

        let logged = String::from_utf8(out.0.lock().unwrap().clone()).unwrap();
        assert!(logged.contains(".env"), "no .env event in {logged:?}");
    }
}
