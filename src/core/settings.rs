use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

const CONFIG_FILE: &str = "config.json";
const ENV_MODELS_DIR: &str = "EDGE_MODELS_DIR";
const ENV_PROGRESS_MS: &str = "EDGE_PROGRESS_MS";

pub const DEFAULT_CHUNK_SIZE: usize = 8 * 1024;
pub const DEFAULT_PROGRESS_INTERVAL_MS: u64 = 200;
pub const DEFAULT_THROUGHPUT_WINDOW: usize = 5;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, rename_all = "camelCase")]
pub struct DownloadSettings {
    pub models_dir: Option<PathBuf>,
    pub chunk_size: usize,
    pub progress_interval_ms: u64,
    pub throughput_window: usize,
    pub connect_timeout_secs: u64,
    pub user_agent: String,
    pub check_free_space: bool,
}

impl Default for DownloadSettings {
    fn default() -> Self {
        Self {
            models_dir: None,
            chunk_size: DEFAULT_CHUNK_SIZE,
            progress_interval_ms: DEFAULT_PROGRESS_INTERVAL_MS,
            throughput_window: DEFAULT_THROUGHPUT_WINDOW,
            connect_timeout_secs: 30,
            user_agent: format!("edge-gallery-downloads/{}", env!("CARGO_PKG_VERSION")),
            check_free_space: true,
        }
    }
}

impl DownloadSettings {
    /// Reads `config.json` from the platform config dir, then applies env overrides.
    pub fn load() -> Result<Self> {
        let path = resolve_config_path()?;
        let mut settings = Self::load_from(&path)?;
        settings.apply_env();
        Ok(settings)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let bytes = fs::read(path).with_context(|| format!("failed reading {path:?}"))?;
        let parsed: Self =
            serde_json::from_slice(&bytes).context("config json could not be parsed")?;
        Ok(parsed.sanitized())
    }

    pub fn save(&self) -> Result<()> {
        let path = resolve_config_path()?;
        self.save_to(&path)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| format!("create dir {parent:?}"))?;
        }
        let serialized =
            serde_json::to_vec_pretty(self).context("serialize settings to json failed")?;
        fs::write(path, serialized).with_context(|| format!("write settings to {path:?}"))?;
        Ok(())
    }

    pub fn apply_env(&mut self) {
        if let Ok(dir) = std::env::var(ENV_MODELS_DIR) {
            if !dir.trim().is_empty() {
                self.models_dir = Some(PathBuf::from(dir));
            }
        }
        if let Some(ms) = std::env::var(ENV_PROGRESS_MS)
            .ok()
            .and_then(|value| value.parse::<u64>().ok())
        {
            self.progress_interval_ms = ms;
        }
    }

    /// Storage root for all artifacts, created on first use.
    pub fn models_dir(&self) -> Result<PathBuf> {
        let dir = match &self.models_dir {
            Some(dir) => dir.clone(),
            None => {
                let project_dirs = ProjectDirs::from("com", "EdgeGallery", "EdgeGallery")
                    .context("missing project directories")?;
                project_dirs.data_dir().join("models")
            }
        };
        fs::create_dir_all(&dir).with_context(|| format!("create models dir {dir:?}"))?;
        Ok(dir)
    }

    #[must_use]
    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms)
    }

    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    fn sanitized(mut self) -> Self {
        if self.chunk_size == 0 {
            self.chunk_size = DEFAULT_CHUNK_SIZE;
        }
        if self.throughput_window == 0 {
            self.throughput_window = DEFAULT_THROUGHPUT_WINDOW;
        }
        self
    }
}

fn resolve_config_path() -> Result<PathBuf> {
    let project_dirs = ProjectDirs::from("com", "EdgeGallery", "EdgeGallery")
        .context("missing project directories")?;
    let dir = project_dirs.config_dir();
    fs::create_dir_all(dir).context("creating config directory failed")?;
    Ok(dir.join(CONFIG_FILE))
}
