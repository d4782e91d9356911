//! Layered configuration
//!
//! Sources, lowest precedence first:
//!
//! 1. built-in defaults
//! 2. optional TOML file (`--config`)
//! 3. environment, `RECORDPOOL__<SECTION>__<KEY>` (e.g. `RECORDPOOL__SERVER__HTTP_PORT`)
//! 4. command-line flags (applied by the binary)
//!
//! The shared secret can also come from the legacy `API_KEY` variable.

use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::server::{AuthState, LogSource, ServerConfig};
use crate::storage::{FileStore, MemoryStore, Storage, StoreOptions};

/// Environment prefix for settings
pub const ENV_PREFIX: &str = "RECORDPOOL";

/// Legacy variable holding the shared secret
pub const LEGACY_API_KEY_VAR: &str = "API_KEY";

/// All settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub server: ServerConfig,
    pub store: StoreSettings,
    pub auth: AuthSettings,
    pub logging: LoggingSettings,
}

/// Record store settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreSettings {
    /// Directory holding the journal
    pub data_dir: PathBuf,
    /// Keep records in memory only (nothing survives a restart)
    pub in_memory: bool,
    pub case_insensitive_search: bool,
    /// fsync every journal batch
    pub sync_writes: bool,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data/recordpool"),
            in_memory: false,
            case_insensitive_search: true,
            sync_writes: true,
        }
    }
}

impl StoreSettings {
    pub fn options(&self) -> StoreOptions {
        StoreOptions {
            case_insensitive_search: self.case_insensitive_search,
        }
    }

    /// Open the configured store
    pub fn open(&self) -> anyhow::Result<Storage> {
        if self.in_memory {
            return Ok(Storage::new(Box::new(MemoryStore::with_options(
                self.options(),
            ))));
        }

        let store = FileStore::open(&self.data_dir, self.options(), self.sync_writes)
            .with_context(|| format!("opening store at {}", self.data_dir.display()))?;
        Ok(Storage::new(Box::new(store)))
    }

    /// Open the journal-backed store directly, for maintenance commands
    pub fn open_file_store(&self) -> anyhow::Result<FileStore> {
        if self.in_memory {
            bail!("store is configured in-memory; there is no journal to maintain");
        }
        FileStore::open(&self.data_dir, self.options(), self.sync_writes)
            .with_context(|| format!("opening store at {}", self.data_dir.display()))
    }
}

/// Shared-secret settings
#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthSettings {
    pub api_key: Option<String>,
    /// Serve without checking the key
    pub dev_mode: bool,
}

impl std::fmt::Debug for AuthSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthSettings")
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("dev_mode", &self.dev_mode)
            .finish()
    }
}

impl AuthSettings {
    /// Build the request guard. Refuses to run unprotected outside dev mode.
    pub fn auth_state(&self) -> anyhow::Result<AuthState> {
        if self.dev_mode {
            return Ok(AuthState::disabled());
        }
        match self.api_key.as_deref().map(str::trim) {
            Some(key) if !key.is_empty() => Ok(AuthState::with_api_key(key)),
            _ => bail!(
                "no API key configured; set {} or {}__AUTH__API_KEY, or pass --dev-mode",
                LEGACY_API_KEY_VAR,
                ENV_PREFIX
            ),
        }
    }
}

/// Logging settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    pub dir: PathBuf,
    pub level: String,
    pub file_prefix: String,
    /// Bytes returned by `GET /logs`
    pub tail_bytes: u64,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("logs"),
            level: "info".to_string(),
            file_prefix: "recordpool.log".to_string(),
            tail_bytes: 64 * 1024,
        }
    }
}

impl LoggingSettings {
    pub fn log_source(&self) -> LogSource {
        LogSource::new(&self.dir, &self.file_prefix, self.tail_bytes)
    }
}

impl Settings {
    /// Load defaults, then the optional file, then the environment
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let mut builder = config::Config::builder()
            .add_source(config::Config::try_from(&Settings::default())?);

        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }

        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .try_parsing(true),
        );

        let mut settings: Settings = builder
            .build()
            .context("loading configuration")?
            .try_deserialize()
            .context("parsing configuration")?;

        if settings.auth.api_key.is_none() {
            if let Ok(key) = std::env::var(LEGACY_API_KEY_VAR) {
                settings.auth.api_key = Some(key);
            }
        }

        Ok(settings)
    }

    /// Render as TOML, with the API key masked
    pub fn to_toml(&self) -> anyhow::Result<String> {
        let mut shown = self.clone();
        if shown.auth.api_key.is_some() {
            shown.auth.api_key = Some("<redacted>".to_string());
        }
        Ok(toml::to_string_pretty(&shown)?)
    }

    pub fn open_storage(&self) -> anyhow::Result<Arc<Storage>> {
        Ok(Arc::new(self.store.open()?))
    }
}
