use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::protocol::{timeouts, HASH_CHECK_LIMIT, MAX_FRAME_SIZE, UPLOAD_CHUNK_SIZE};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    pub operation_timeout_ms: u64,
    pub chunk_size: usize,
    pub hash_check_limit: u64, // larger files skip the hash precheck
    pub send_retry_ms: u64,
    pub consent: u32, // relay consent flags sent in the options message

    pub download_dir: Option<PathBuf>,
    pub journal: Option<PathBuf>,

    pub outbound_queue: usize, // websocket send queue depth before backpressure
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            operation_timeout_ms: timeouts::OPERATION_MS,
            chunk_size: UPLOAD_CHUNK_SIZE,
            hash_check_limit: HASH_CHECK_LIMIT,
            send_retry_ms: timeouts::SEND_RETRY_MS,
            consent: 0,
            download_dir: None,
            journal: None,
            outbound_queue: 64,
        }
    }
}

impl ManagerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            bail!("chunk_size must be greater than zero");
        }
        if self.chunk_size > MAX_FRAME_SIZE {
            bail!(
                "chunk_size {} exceeds frame limit {}",
                self.chunk_size,
                MAX_FRAME_SIZE
            );
        }
        if self.operation_timeout_ms == 0 {
            bail!("operation_timeout_ms must be greater than zero");
        }
        if self.send_retry_ms == 0 {
            bail!("send_retry_ms must be greater than zero");
        }
        if self.outbound_queue == 0 {
            bail!("outbound_queue must be greater than zero");
        }
        Ok(())
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }

    pub fn send_retry(&self) -> Duration {
        Duration::from_millis(self.send_retry_ms)
    }
}

pub fn config_dir() -> PathBuf {
    #[cfg(windows)]
    {
        if let Ok(appdata) = std::env::var("APPDATA") {
            return PathBuf::from(appdata).join("meshfm");
        }
    }
    if let Ok(home) = std::env::var("HOME") {
        return PathBuf::from(home).join(".config").join("meshfm");
    }
    PathBuf::from(".meshfm")
}

pub fn default_config_path() -> PathBuf {
    config_dir().join("meshfm.toml")
}

/// Load from `path`; a missing file yields the defaults
pub fn load_config(path: &Path) -> Result<ManagerConfig> {
    let data = match std::fs::read_to_string(path) {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(ManagerConfig::default()),
        Err(e) => {
            return Err(e).with_context(|| format!("Failed to read config {}", path.display()))
        }
    };
    let cfg: ManagerConfig =
        toml::from_str(&data).with_context(|| format!("Invalid config {}", path.display()))?;
    cfg.validate()?;
    Ok(cfg)
}

pub fn save_config(path: &Path, cfg: &ManagerConfig) -> Result<()> {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(|p| p.to_path_buf())
        .unwrap_or_else(|| PathBuf::from("."));
    std::fs::create_dir_all(&dir).ok();
    let data = toml::to_string(cfg)?;
    // atomic write
    let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
    use std::io::Write as _;
    tmp.write_all(data.as_bytes())?;
    tmp.flush()?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let _ = std::fs::set_permissions(tmp.path(), std::fs::Permissions::from_mode(0o600));
    }
    tmp.persist(path)?;
    Ok(())
}
