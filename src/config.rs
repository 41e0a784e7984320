//! Configuration management for mend
//!
//! Two layers:
//! - `UserConfig` in ~/.config/mend/config.json (model ids, API endpoint)
//! - `PipelineConfig` in a repo-local `mend.toml` (loop, sandbox, and runner policy)
//!
//! The API key is never stored in either file. It comes from the
//! `OPENROUTER_API_KEY` environment variable or the system keychain.

use keyring::Entry;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::warn;
use url::Url;

const KEYRING_SERVICE: &str = "mend";
const KEYRING_USERNAME: &str = "openrouter_api_key";
const API_KEY_ENV: &str = "OPENROUTER_API_KEY";
const DEFAULT_API_BASE: &str = "https://openrouter.ai/api/v1/";

/// File name looked up at the repository root when no `--config` is given.
pub const PIPELINE_CONFIG_FILE: &str = "mend.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config {path}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("no API key configured (set {API_KEY_ENV} or run `mend login`)")]
    MissingApiKey,

    #[error("keychain error: {0}")]
    Keychain(String),
}

// ═══════════════════════════════════════════════════════════════════════════
//  USER CONFIG
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserConfig {
    #[serde(default = "default_generator_model")]
    pub generator_model: String,
    #[serde(default = "default_healer_model")]
    pub healer_model: String,
    #[serde(default = "default_api_base")]
    pub api_base_url: String,
}

fn default_generator_model() -> String {
    "anthropic/claude-sonnet-4.5".to_string()
}

fn default_healer_model() -> String {
    "anthropic/claude-opus-4.5".to_string()
}

fn default_api_base() -> String {
    DEFAULT_API_BASE.to_string()
}

impl Default for UserConfig {
    fn default() -> Self {
        Self {
            generator_model: default_generator_model(),
            healer_model: default_healer_model(),
            api_base_url: default_api_base(),
        }
    }
}

fn keyring_entry() -> Result<Entry, keyring::Error> {
    Entry::new(KEYRING_SERVICE, KEYRING_USERNAME)
}

fn read_keyring_key() -> Result<Option<String>, keyring::Error> {
    let entry = keyring_entry()?;
    match entry.get_password() {
        Ok(key) => Ok(Some(key)),
        Err(keyring::Error::NoEntry) => Ok(None),
        Err(err) => Err(err),
    }
}

impl UserConfig {
    fn config_dir() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("mend"))
    }

    fn config_path() -> Option<PathBuf> {
        Self::config_dir().map(|p| p.join("config.json"))
    }

    /// Load config from disk, or return defaults
    pub fn load() -> Self {
        if let Some(path) = Self::config_path() {
            if let Ok(content) = fs::read_to_string(&path) {
                match serde_json::from_str(&content) {
                    Ok(config) => return config,
                    Err(err) => {
                        preserve_corrupt_config(&path, &content);
                        warn!(
                            path = %path.display(),
                            error = %err,
                            "user config was corrupted; a backup was saved and defaults were loaded"
                        );
                    }
                }
            }
        }
        Self::default()
    }

    pub fn save(&self) -> Result<(), String> {
        let dir = Self::config_dir()
            .ok_or_else(|| "Could not determine config directory".to_string())?;

        fs::create_dir_all(&dir)
            .map_err(|e| format!("Failed to create config directory: {}", e))?;

        let path = dir.join("config.json");
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| format!("Failed to serialize config: {}", e))?;
        write_config_atomic(&path, &content)
    }

    /// Parsed API base. A trailing slash is enforced so `join` appends.
    pub fn api_base(&self) -> Result<Url, ConfigError> {
        let raw = if self.api_base_url.ends_with('/') {
            self.api_base_url.clone()
        } else {
            format!("{}/", self.api_base_url)
        };
        let url = Url::parse(&raw)
            .map_err(|e| ConfigError::Invalid(format!("api_base_url '{}': {}", raw, e)))?;
        if !matches!(url.scheme(), "https" | "http") {
            return Err(ConfigError::Invalid(format!(
                "api_base_url must be http(s), got '{}'",
                url.scheme()
            )));
        }
        Ok(url)
    }

    /// Get the OpenRouter API key (environment first, then keychain)
    pub fn api_key(&self) -> Result<String, ConfigError> {
        if let Ok(key) = std::env::var(API_KEY_ENV) {
            if !key.trim().is_empty() {
                return Ok(key.trim().to_string());
            }
        }

        match read_keyring_key() {
            Ok(Some(key)) => Ok(key),
            Ok(None) => Err(ConfigError::MissingApiKey),
            Err(err) => {
                warn!(error = %err, "failed to read API key from system keychain");
                Err(ConfigError::MissingApiKey)
            }
        }
    }

    /// Store the API key in the system keychain and verify it reads back.
    pub fn set_api_key(key: &str) -> Result<(), ConfigError> {
        let entry = keyring_entry().map_err(|e| ConfigError::Keychain(e.to_string()))?;
        entry
            .set_password(key)
            .map_err(|e| ConfigError::Keychain(e.to_string()))?;
        match read_keyring_key() {
            Ok(Some(stored)) if stored == key => Ok(()),
            Ok(_) => Err(ConfigError::Keychain(
                "stored key could not be verified".to_string(),
            )),
            Err(e) => Err(ConfigError::Keychain(e.to_string())),
        }
    }

    pub fn config_location() -> String {
        Self::config_path()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "~/.config/mend/config.json".to_string())
    }
}

fn preserve_corrupt_config(path: &Path, content: &str) {
    let stamp = chrono::Utc::now().format("%Y%m%d%H%M%S");
    let corrupt_path = path.with_extension(format!("json.corrupt-{}", stamp));
    if fs::rename(path, &corrupt_path).is_err() {
        let _ = fs::write(&corrupt_path, content);
    }
}

fn write_config_atomic(path: &Path, content: &str) -> Result<(), String> {
    use std::fs::OpenOptions;

    let tmp_path = path.with_extension("tmp");
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(&tmp_path)
        .map_err(|e| e.to_string())?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Err(e) = file.set_permissions(fs::Permissions::from_mode(0o600)) {
            warn!(error = %e, "failed to set temp config file permissions");
        }
    }

    file.write_all(content.as_bytes())
        .map_err(|e| e.to_string())?;

    if let Err(err) = fs::rename(&tmp_path, path) {
        let _ = fs::remove_file(&tmp_path);
        return Err(err.to_string());
    }
    Ok(())
}

// ═══════════════════════════════════════════════════════════════════════════
//  PIPELINE CONFIG
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Healing attempts allowed before escalation
    pub max_attempts: u32,
    /// Minimum self-reported confidence for a FIXED verdict
    pub confidence_threshold: u8,
    /// Files processed in parallel by `run_many`
    pub max_concurrency: usize,
    pub model_timeout_secs: u64,
    pub eligibility: EligibilityConfig,
    pub generation: GenerationConfig,
    pub healing: HealingConfig,
    pub sandbox: SandboxConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            confidence_threshold: 70,
            max_concurrency: 4,
            model_timeout_secs: 90,
            eligibility: EligibilityConfig::default(),
            generation: GenerationConfig::default(),
            healing: HealingConfig::default(),
            sandbox: SandboxConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EligibilityConfig {
    pub extensions: Vec<String>,
    /// Path patterns that mark a file as not worth testing. A pattern ending
    /// in `/` names a directory and must match a whole path segment; any
    /// other pattern matches as a substring of the file path.
    pub skip_patterns: Vec<String>,
    pub min_source_chars: usize,
    /// Larger sources are skipped: prompts must carry the whole file
    pub max_source_chars: usize,
}

impl Default for EligibilityConfig {
    fn default() -> Self {
        Self {
            extensions: ["ts", "tsx", "js", "jsx", "mjs", "cjs"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            skip_patterns: [
                ".test.",
                ".spec.",
                "__tests__/",
                "__mocks__/",
                ".d.ts",
                ".config.",
                ".types.",
                "/types.",
                "node_modules/",
                "dist/",
                "build/",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            min_source_chars: 50,
            max_source_chars: 24_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    /// Generated suites shorter than this fail validation
    pub min_test_chars: usize,
    pub max_tokens: u32,
    pub temperature: f32,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            min_test_chars: 200,
            max_tokens: 8_192,
            temperature: 0.3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealingConfig {
    pub max_tokens: u32,
    pub temperature: f32,
    /// Runner output included in the healing prompt
    pub max_evidence_chars: usize,
}

impl Default for HealingConfig {
    fn default() -> Self {
        Self {
            max_tokens: 16_384,
            temperature: 0.1,
            max_evidence_chars: 8_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// Parent for ephemeral workspaces (system temp dir when unset)
    pub workspace_root: Option<PathBuf>,
    /// Dependency install argv. Empty skips provisioning.
    pub install_command: Vec<String>,
    /// Test argv. `{results_file}` and `{test_file}` are substituted.
    pub test_command: Vec<String>,
    pub results_file: String,
    pub install_timeout_secs: u64,
    pub test_timeout_secs: u64,
    pub output_cap_bytes: usize,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            workspace_root: None,
            install_command: ["npm", "install", "--no-audit", "--no-fund", "--silent"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            test_command: [
                "npx",
                "jest",
                "--ci",
                "--json",
                "--outputFile={results_file}",
                "--runTestsByPath",
                "{test_file}",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            results_file: "mend-results.json".to_string(),
            install_timeout_secs: 120,
            test_timeout_secs: 45,
            output_cap_bytes: 64 * 1024,
        }
    }
}

impl SandboxConfig {
    pub fn workspace_root(&self) -> PathBuf {
        self.workspace_root
            .clone()
            .unwrap_or_else(std::env::temp_dir)
    }

    pub fn install_timeout(&self) -> Duration {
        Duration::from_secs(self.install_timeout_secs)
    }

    pub fn test_timeout(&self) -> Duration {
        Duration::from_secs(self.test_timeout_secs)
    }
}

impl PipelineConfig {
    /// Load from an explicit file. Missing files are an error here.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Load `mend.toml` from the repo root if present, otherwise defaults.
    pub fn discover(repo_root: &Path) -> Result<Self, ConfigError> {
        let path = repo_root.join(PIPELINE_CONFIG_FILE);
        if path.exists() {
            Self::from_file(&path)
        } else {
            let config = Self::default();
            config.validate()?;
            Ok(config)
        }
    }

    pub fn model_timeout(&self) -> Duration {
        Duration::from_secs(self.model_timeout_secs)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_string()));

        if self.max_attempts == 0 {
            return invalid("max_attempts must be at least 1");
        }
        if self.confidence_threshold > 100 {
            return invalid("confidence_threshold must be within 0..=100");
        }
        if self.max_concurrency == 0 {
            return invalid("max_concurrency must be at least 1");
        }
        if self.model_timeout_secs == 0 {
            return invalid("model_timeout_secs must be positive");
        }
        if self.eligibility.extensions.is_empty() {
            return invalid("eligibility.extensions must not be empty");
        }
        if self.eligibility.min_source_chars > self.eligibility.max_source_chars {
            return invalid("eligibility.min_source_chars exceeds eligibility.max_source_chars");
        }
        if !(0.0..=2.0).contains(&self.generation.temperature)
            || !(0.0..=2.0).contains(&self.healing.temperature)
        {
            return invalid("temperatures must be within 0.0..=2.0");
        }
        if self.generation.max_tokens == 0 || self.healing.max_tokens == 0 {
            return invalid("max_tokens must be positive");
        }
        let sandbox = &self.sandbox;
        if sandbox.test_command.is_empty() || sandbox.test_command[0].trim().is_empty() {
            return invalid("sandbox.test_command must name a program");
        }
        if sandbox.install_timeout_secs == 0 || sandbox.test_timeout_secs == 0 {
            return invalid("sandbox timeouts must be positive");
        }
        if sandbox.output_cap_bytes == 0 {
            return invalid("sandbox.output_cap_bytes must be positive");
        }
        if crate::util::ensure_relative(Path::new(&sandbox.results_file)).is_err() {
            return invalid("sandbox.results_file must be a relative path");
        }
        Ok(())
    }
}
