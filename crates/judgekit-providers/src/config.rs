//! Provider and rater configuration.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use judgekit_core::batch::BatchConfig;
use judgekit_core::engine::JudgeEngineConfig;
use judgekit_core::paired::{PairedComparator, TieBreak};

use crate::error::ConfigError;
use crate::openai::DEEPSEEK_BASE_URL;

/// Largest sub-batch any provider accepts from us.
pub const MAX_CHUNK_SIZE: usize = 1000;

/// Configuration for a single judge provider.
///
/// Note: Custom Debug impl masks API keys to prevent accidental exposure in logs.
#[derive(Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ProviderConfig {
    Anthropic {
        api_key: String,
        #[serde(default)]
        base_url: Option<String>,
    },
    Gemini {
        api_key: String,
        #[serde(default)]
        base_url: Option<String>,
    },
    OpenAI {
        api_key: String,
        #[serde(default)]
        base_url: Option<String>,
        #[serde(default)]
        org_id: Option<String>,
    },
}

impl std::fmt::Debug for ProviderConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProviderConfig::Anthropic { base_url, .. } => f
                .debug_struct("Anthropic")
                .field("api_key", &"***")
                .field("base_url", base_url)
                .finish(),
            ProviderConfig::Gemini { base_url, .. } => f
                .debug_struct("Gemini")
                .field("api_key", &"***")
                .field("base_url", base_url)
                .finish(),
            ProviderConfig::OpenAI {
                base_url, org_id, ..
            } => f
                .debug_struct("OpenAI")
                .field("api_key", &"***")
                .field("base_url", base_url)
                .field("org_id", org_id)
                .finish(),
        }
    }
}

/// Which client implementation a provider entry needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ProviderKind {
    Anthropic,
    Gemini,
    OpenAi,
}

impl ProviderConfig {
    pub fn kind(&self) -> ProviderKind {
        match self {
            ProviderConfig::Anthropic { .. } => ProviderKind::Anthropic,
            ProviderConfig::Gemini { .. } => ProviderKind::Gemini,
            ProviderConfig::OpenAI { .. } => ProviderKind::OpenAi,
        }
    }

    pub fn api_key(&self) -> &str {
        match self {
            ProviderConfig::Anthropic { api_key, .. }
            | ProviderConfig::Gemini { api_key, .. }
            | ProviderConfig::OpenAI { api_key, .. } => api_key,
        }
    }

    pub fn base_url(&self) -> Option<&str> {
        match self {
            ProviderConfig::Anthropic { base_url, .. }
            | ProviderConfig::Gemini { base_url, .. }
            | ProviderConfig::OpenAI { base_url, .. } => base_url.as_deref(),
        }
    }

    /// Whether this provider offers an asynchronous batch API.
    pub fn supports_batch(&self) -> bool {
        !matches!(self, ProviderConfig::OpenAI { .. })
    }

    fn set_api_key(&mut self, key: String) {
        match self {
            ProviderConfig::Anthropic { api_key, .. }
            | ProviderConfig::Gemini { api_key, .. }
            | ProviderConfig::OpenAI { api_key, .. } => *api_key = key,
        }
    }
}

/// How a rater reaches its provider.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RaterMode {
    #[default]
    Sync,
    Batch,
}

/// One judge: a provider entry, a model and a call mode.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RaterConfig {
    /// Rater id used as the verdict key in scored items.
    pub id: String,
    /// Key into `providers`.
    pub provider: String,
    pub model: String,
    #[serde(default)]
    pub mode: RaterMode,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchSettings {
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_batch_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_deadline_secs")]
    pub deadline_secs: u64,
    #[serde(default = "default_status_retries")]
    pub status_retries: u32,
}

fn default_chunk_size() -> usize {
    MAX_CHUNK_SIZE
}
fn default_batch_concurrency() -> usize {
    2
}
fn default_poll_interval_ms() -> u64 {
    5000
}
fn default_deadline_secs() -> u64 {
    6 * 60 * 60
}
fn default_status_retries() -> u32 {
    3
}

impl Default for BatchSettings {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            concurrency: default_batch_concurrency(),
            poll_interval_ms: default_poll_interval_ms(),
            deadline_secs: default_deadline_secs(),
            status_retries: default_status_retries(),
        }
    }
}

impl BatchSettings {
    pub fn to_batch_config(&self) -> BatchConfig {
        BatchConfig {
            chunk_size: self.chunk_size.clamp(1, MAX_CHUNK_SIZE),
            concurrency: self.concurrency.max(1),
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            deadline: Duration::from_secs(self.deadline_secs),
            status_retries: self.status_retries,
        }
    }
}

/// Defaults for `judgekit report`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompareSettings {
    #[serde(default)]
    pub baseline: Option<String>,
    #[serde(default)]
    pub candidate: Option<String>,
    #[serde(default = "default_semantic_target")]
    pub semantic_target: f64,
    #[serde(default = "default_judge_target")]
    pub judge_target: f64,
    #[serde(default)]
    pub tiebreak: TieBreak,
}

fn default_semantic_target() -> f64 {
    0.04
}
fn default_judge_target() -> f64 {
    0.05
}

impl Default for CompareSettings {
    fn default() -> Self {
        Self {
            baseline: None,
            candidate: None,
            semantic_target: default_semantic_target(),
            judge_target: default_judge_target(),
            tiebreak: TieBreak::default(),
        }
    }
}

impl CompareSettings {
    /// A comparator for the given pair, with targets and tie-break applied.
    pub fn comparator(&self, baseline: &str, candidate: &str) -> PairedComparator {
        PairedComparator::new(baseline, candidate)
            .with_targets(self.semantic_target, self.judge_target)
            .with_tiebreak(self.tiebreak)
    }
}

/// Top-level judgekit configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JudgekitConfig {
    /// Provider configurations keyed by name.
    #[serde(default)]
    pub providers: BTreeMap<String, ProviderConfig>,
    #[serde(default)]
    pub raters: Vec<RaterConfig>,
    /// Max concurrent per-item provider calls.
    #[serde(default = "default_parallelism")]
    pub parallelism: usize,
    /// Rows committed to the checkpoint together. With batch raters a unit
    /// is at least one batch round, `chunk_size * concurrency` rows.
    #[serde(default = "default_work_unit_size")]
    pub work_unit_size: usize,
    /// Output token budget for one verdict.
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    /// Keep going past a failed batch job instead of stopping the run.
    #[serde(default)]
    pub continue_on_batch_failure: bool,
    #[serde(default)]
    pub batch: BatchSettings,
    #[serde(default)]
    pub compare: CompareSettings,
}

fn default_parallelism() -> usize {
    4
}
fn default_work_unit_size() -> usize {
    16
}
fn default_max_tokens() -> u32 {
    512
}

impl Default for JudgekitConfig {
    fn default() -> Self {
        Self {
            providers: BTreeMap::new(),
            raters: Vec::new(),
            parallelism: default_parallelism(),
            work_unit_size: default_work_unit_size(),
            max_tokens: default_max_tokens(),
            continue_on_batch_failure: false,
            batch: BatchSettings::default(),
            compare: CompareSettings::default(),
        }
    }
}

impl JudgekitConfig {
    pub fn engine_config(&self) -> JudgeEngineConfig {
        JudgeEngineConfig {
            parallelism: self.parallelism.max(1),
            work_unit_size: self.work_unit_size.max(1),
            continue_on_batch_failure: self.continue_on_batch_failure,
            ..JudgeEngineConfig::default()
        }
    }

    pub fn rater(&self, id: &str) -> Result<&RaterConfig, ConfigError> {
        self.raters
            .iter()
            .find(|r| r.id == id)
            .ok_or_else(|| ConfigError::UnknownRater(id.to_string()))
    }

    /// Everything that must hold before a single provider call is made.
    pub fn validate_preconditions(&self) -> Result<(), ConfigError> {
        if self.raters.is_empty() {
            return Err(ConfigError::Invalid("no raters configured".into()));
        }

        let mut seen = BTreeSet::new();
        for rater in &self.raters {
            if rater.id.trim().is_empty() {
                return Err(ConfigError::Invalid("rater with empty id".into()));
            }
            if !seen.insert(rater.id.as_str()) {
                return Err(ConfigError::Invalid(format!("duplicate rater id '{}'", rater.id)));
            }
            if rater.model.trim().is_empty() {
                return Err(ConfigError::Invalid(format!("rater '{}' has no model", rater.id)));
            }
            let provider = self.providers.get(&rater.provider).ok_or_else(|| {
                ConfigError::UnknownProvider {
                    rater: rater.id.clone(),
                    provider: rater.provider.clone(),
                }
            })?;
            if provider.api_key().trim().is_empty() {
                return Err(ConfigError::MissingCredential(rater.provider.clone()));
            }
            if rater.mode == RaterMode::Batch && !provider.supports_batch() {
                return Err(ConfigError::Invalid(format!(
                    "rater '{}' uses batch mode but provider '{}' has no batch API",
                    rater.id, rater.provider
                )));
            }
        }

        if self.batch.chunk_size > MAX_CHUNK_SIZE {
            return Err(ConfigError::Invalid(format!(
                "batch.chunk_size {} exceeds {MAX_CHUNK_SIZE}",
                self.batch.chunk_size
            )));
        }
        Ok(())
    }
}

/// Resolve environment variable references like `${VAR_NAME}` in a string.
fn resolve_env_vars(s: &str) -> String {
    let mut result = s.to_string();
    while let Some(start) = result.find("${") {
        if let Some(end) = result[start..].find('}') {
            let var_name = &result[start + 2..start + end];
            let value = std::env::var(var_name).unwrap_or_default();
            result = format!(
                "{}{}{}",
                &result[..start],
                value,
                &result[start + end + 1..]
            );
        } else {
            break;
        }
    }
    result
}

fn resolve_provider_config(config: &ProviderConfig) -> ProviderConfig {
    let resolve = |o: &Option<String>| o.as_deref().map(resolve_env_vars);
    match config {
        ProviderConfig::Anthropic { api_key, base_url } => ProviderConfig::Anthropic {
            api_key: resolve_env_vars(api_key),
            base_url: resolve(base_url),
        },
        ProviderConfig::Gemini { api_key, base_url } => ProviderConfig::Gemini {
            api_key: resolve_env_vars(api_key),
            base_url: resolve(base_url),
        },
        ProviderConfig::OpenAI {
            api_key,
            base_url,
            org_id,
        } => ProviderConfig::OpenAI {
            api_key: resolve_env_vars(api_key),
            base_url: resolve(base_url),
            org_id: resolve(org_id),
        },
    }
}

/// Environment key overrides and the provider entry each one fills.
fn env_override_default(var: &str) -> Option<(&'static str, ProviderConfig)> {
    match var {
        "JUDGEKIT_ANTHROPIC_KEY" => Some((
            "anthropic",
            ProviderConfig::Anthropic {
                api_key: String::new(),
                base_url: None,
            },
        )),
        "JUDGEKIT_GEMINI_KEY" => Some((
            "gemini",
            ProviderConfig::Gemini {
                api_key: String::new(),
                base_url: None,
            },
        )),
        "JUDGEKIT_DEEPSEEK_KEY" => Some((
            "deepseek",
            ProviderConfig::OpenAI {
                api_key: String::new(),
                base_url: Some(DEEPSEEK_BASE_URL.to_string()),
                org_id: None,
            },
        )),
        _ => None,
    }
}

const ENV_OVERRIDES: &[&str] = &[
    "JUDGEKIT_ANTHROPIC_KEY",
    "JUDGEKIT_GEMINI_KEY",
    "JUDGEKIT_DEEPSEEK_KEY",
];

fn apply_env_overrides(config: &mut JudgekitConfig, lookup: impl Fn(&str) -> Option<String>) {
    for var in ENV_OVERRIDES {
        let Some(key) = lookup(var).filter(|k| !k.is_empty()) else {
            continue;
        };
        if let Some((name, default)) = env_override_default(var) {
            config
                .providers
                .entry(name.to_string())
                .or_insert(default)
                .set_api_key(key);
        }
    }
}

/// Load configuration from well-known paths.
///
/// Search order:
/// 1. `judgekit.toml` in the current directory
/// 2. `~/.config/judgekit/config.toml`
///
/// Environment variable overrides: `JUDGEKIT_ANTHROPIC_KEY`,
/// `JUDGEKIT_GEMINI_KEY`, `JUDGEKIT_DEEPSEEK_KEY`.
pub fn load_config() -> Result<JudgekitConfig> {
    load_config_from(None)
}

/// Load config from an explicit path, or search the default locations.
pub fn load_config_from(path: Option<&Path>) -> Result<JudgekitConfig> {
    let config_path = if let Some(p) = path {
        if p.exists() {
            Some(p.to_path_buf())
        } else {
            anyhow::bail!("config file not found: {}", p.display());
        }
    } else {
        let local = PathBuf::from("judgekit.toml");
        if local.exists() {
            Some(local)
        } else {
            dirs_path()
                .map(|home| home.join("config.toml"))
                .filter(|global| global.exists())
        }
    };

    let mut config = match config_path {
        Some(path) => {
            tracing::debug!("loading config from {}", path.display());
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read config: {}", path.display()))?;
            parse_config(&content)
                .with_context(|| format!("failed to parse config: {}", path.display()))?
        }
        None => JudgekitConfig::default(),
    };

    apply_env_overrides(&mut config, |var| std::env::var(var).ok());

    config.providers = config
        .providers
        .iter()
        .map(|(k, v)| (k.clone(), resolve_provider_config(v)))
        .collect();

    Ok(config)
}

pub fn parse_config(content: &str) -> Result<JudgekitConfig> {
    Ok(toml::from_str::<JudgekitConfig>(content)?)
}

fn dirs_path() -> Option<PathBuf> {
    std::env::var("HOME")
        .ok()
        .map(|h| PathBuf::from(h).join(".config").join("judgekit"))
}

/// Starter configuration written by `judgekit init`.
pub const STARTER_CONFIG: &str = r#"# judgekit configuration

parallelism = 4
# Sync-only runs commit this many rows at a time. Batch raters raise it to
# one full round of [batch] chunk_size * concurrency.
work_unit_size = 16

[providers.anthropic]
type = "anthropic"
api_key = "${ANTHROPIC_API_KEY}"

[providers.gemini]
type = "gemini"
api_key = "${GEMINI_API_KEY}"

[providers.deepseek]
type = "openai"
api_key = "${DEEPSEEK_API_KEY}"
base_url = "https://api.deepseek.com"

[[raters]]
id = "gemini"
provider = "gemini"
model = "gemini-2.5-pro"
mode = "batch"

[[raters]]
id = "claude"
provider = "anthropic"
model = "claude-haiku-4-5"
mode = "batch"

[[raters]]
id = "deepseek"
provider = "deepseek"
model = "deepseek-chat"

[batch]
chunk_size = 1000
concurrency = 2
poll_interval_ms = 5000
deadline_secs = 21600

[compare]
semantic_target = 0.04
judge_target = 0.05
tiebreak = "judge-only"
"#;
