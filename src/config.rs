use crate::error::ConfigError;
use crate::upload::UploadCategory;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

const MIB: u64 = 1024 * 1024;

/// Size and type rules for one upload category
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CategoryRule {
    #[serde(rename = "maxFileSize")]
    pub max_file_size: u64,
    #[serde(rename = "allowedTypes")]
    pub allowed_types: Vec<String>,
}

/// Chunk size tiers picked by the chunker heuristic
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ChunkSizeTiers {
    pub small: u64,
    pub medium: u64,
    pub large: u64,
}

impl Default for ChunkSizeTiers {
    fn default() -> Self {
        Self {
            small: MIB,
            medium: 5 * MIB,
            large: 10 * MIB,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetryConfig {
    #[serde(rename = "maxRetries")]
    pub max_retries: u32,
    #[serde(rename = "baseDelayMs")]
    pub base_delay_ms: u64,
    #[serde(rename = "maxDelayMs")]
    pub max_delay_ms: u64,
    #[serde(rename = "backoffMultiplier")]
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
            backoff_multiplier: 2.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UploaderConfig {
    #[serde(rename = "serverUrl")]
    pub server_url: String,
    #[serde(rename = "apiKey")]
    pub api_key: Option<String>,
    #[serde(rename = "requestTimeoutSecs")]
    pub request_timeout_secs: u64,
    pub categories: HashMap<UploadCategory, CategoryRule>,
    #[serde(rename = "chunkSizes")]
    pub chunk_sizes: ChunkSizeTiers,
    pub retry: RetryConfig,
    #[serde(rename = "maxConcurrentChunks")]
    pub max_concurrent_chunks: usize,
    #[serde(rename = "maxConcurrentUploads")]
    pub max_concurrent_uploads: usize,
    /// Lifetime of a local session when the server does not say otherwise
    #[serde(rename = "sessionExpirySecs")]
    pub session_expiry_secs: u64,
    /// How often the expiry sweep runs
    #[serde(rename = "cleanupIntervalSecs")]
    pub cleanup_interval_secs: u64,
    /// Completed sessions older than this are removed by the sweep
    #[serde(rename = "completedRetentionSecs")]
    pub completed_retention_secs: u64,
    /// Directory holding the session database; `~` is expanded
    #[serde(rename = "stateDir")]
    pub state_dir: Option<String>,
}

impl Default for UploaderConfig {
    fn default() -> Self {
        Self {
            server_url: "http://localhost:3000/api/upload".to_string(),
            api_key: None,
            request_timeout_secs: 60,
            categories: default_category_rules(),
            chunk_sizes: ChunkSizeTiers::default(),
            retry: RetryConfig::default(),
            max_concurrent_chunks: 3,
            max_concurrent_uploads: 2,
            session_expiry_secs: 24 * 60 * 60,
            cleanup_interval_secs: 60 * 60,
            completed_retention_secs: 60 * 60,
            state_dir: None,
        }
    }
}

fn default_category_rules() -> HashMap<UploadCategory, CategoryRule> {
    let rule = |max_file_size: u64, types: &[&str]| CategoryRule {
        max_file_size,
        allowed_types: types.iter().map(|t| t.to_string()).collect(),
    };

    HashMap::from([
        (
            UploadCategory::Image,
            rule(
                10 * MIB,
                &["image/jpeg", "image/png", "image/gif", "image/webp"],
            ),
        ),
        (
            UploadCategory::Video,
            rule(
                2048 * MIB,
                &["video/mp4", "video/quicktime", "video/webm", "video/x-msvideo"],
            ),
        ),
        (
            UploadCategory::Document,
            rule(
                100 * MIB,
                &[
                    "application/pdf",
                    "application/msword",
                    "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
                    "application/vnd.ms-powerpoint",
                    "application/vnd.openxmlformats-officedocument.presentationml.presentation",
                    "text/plain",
                ],
            ),
        ),
    ])
}

impl UploaderConfig {
    pub fn category_rule(&self, category: UploadCategory) -> Option<&CategoryRule> {
        self.categories.get(&category)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn session_expiry(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.session_expiry_secs as i64)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs.max(1))
    }

    pub fn completed_retention(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.completed_retention_secs as i64)
    }

    /// Resolve the state directory, expanding `~` if present
    pub fn resolved_state_dir(&self) -> Result<PathBuf, ConfigError> {
        match &self.state_dir {
            Some(dir) => Ok(PathBuf::from(shellexpand::tilde(dir).into_owned())),
            None => get_config_dir(),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server_url.trim().is_empty() {
            return Err(ConfigError::Invalid("serverUrl is empty".to_string()));
        }
        url::Url::parse(&self.server_url)
            .map_err(|e| ConfigError::Invalid(format!("serverUrl '{}': {}", self.server_url, e)))?;

        if self.max_concurrent_chunks == 0 {
            return Err(ConfigError::Invalid(
                "maxConcurrentChunks must be at least 1".to_string(),
            ));
        }
        if self.max_concurrent_uploads == 0 {
            return Err(ConfigError::Invalid(
                "maxConcurrentUploads must be at least 1".to_string(),
            ));
        }
        if self.retry.backoff_multiplier < 1.0 {
            return Err(ConfigError::Invalid(
                "retry.backoffMultiplier must be >= 1.0".to_string(),
            ));
        }
        let tiers = self.chunk_sizes;
        if tiers.small == 0 || tiers.medium == 0 || tiers.large == 0 {
            return Err(ConfigError::Invalid(
                "chunk size tiers must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

pub fn get_config_dir() -> Result<PathBuf, ConfigError> {
    dirs::home_dir()
        .map(|home| home.join(".chunked-uploader"))
        .ok_or(ConfigError::NoHomeDir)
}

pub fn get_config_file_path() -> Result<PathBuf, ConfigError> {
    Ok(get_config_dir()?.join("config.toml"))
}

pub fn get_logs_dir() -> Result<PathBuf, ConfigError> {
    Ok(get_config_dir()?.join("logs"))
}

/// Create a directory readable only by the owner
pub fn ensure_private_dir(dir: &Path) -> Result<(), ConfigError> {
    if !dir.exists() {
        fs::create_dir_all(dir)?;

        // Set permissions to 700 (read/write/execute for owner only) on Unix systems
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let metadata = fs::metadata(dir)?;
            let mut permissions = metadata.permissions();
            permissions.set_mode(0o700);
            fs::set_permissions(dir, permissions)?;
        }
    }
    Ok(())
}

pub fn load_config_from(path: &Path) -> Result<UploaderConfig, ConfigError> {
    if !path.exists() {
        return Ok(UploaderConfig::default());
    }

    let content = fs::read_to_string(path)?;
    let config: UploaderConfig = toml::from_str(&content)?;
    config.validate()?;
    Ok(config)
}

pub fn load_config() -> Result<UploaderConfig, ConfigError> {
    ensure_private_dir(&get_config_dir()?)?;
    load_config_from(&get_config_file_path()?)
}

pub fn save_config_to(config: &UploaderConfig, path: &Path) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        ensure_private_dir(parent)?;
    }

    let content = toml::to_string_pretty(config)?;
    fs::write(path, content)?;

    // Set permissions to 600 (read/write for owner only) on Unix systems
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let metadata = fs::metadata(path)?;
        let mut permissions = metadata.permissions();
        permissions.set_mode(0o600);
        fs::set_permissions(path, permissions)?;
    }

    Ok(())
}
