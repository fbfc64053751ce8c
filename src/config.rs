use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_DETECTOR_ADDR: &str = "127.0.0.1:8080";
const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 3000;
const DEFAULT_FFMPEG_BIN: &str = "ffmpeg";
const DEFAULT_SHM_DIR: &str = "/dev/shm/detect-bridge";
const DEFAULT_RESTART_BACKOFF_MS: u64 = 1000;
const DEFAULT_EVENT_QUEUE: usize = 16;

#[derive(Debug, Deserialize, Serialize, Default)]
struct BridgeConfigFile {
    #[serde(skip_serializing_if = "Option::is_none")]
    detector: Option<DetectorConfigFile>,
    #[serde(skip_serializing_if = "Option::is_none")]
    ffmpeg_bin: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    shm_dir: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    restart_backoff_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    event_queue: Option<usize>,
}

#[derive(Debug, Deserialize, Serialize, Default)]
struct DetectorConfigFile {
    #[serde(skip_serializing_if = "Option::is_none")]
    addr: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    detectors_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    connect_timeout_ms: Option<u64>,
}

/// Bridge-wide settings shared by every pipeline.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Detector service address, `host:port`.
    pub detector_addr: String,
    /// URL listing the available detectors. Derived from the address unless set.
    pub detectors_url: String,
    pub connect_timeout: Duration,
    pub ffmpeg_bin: String,
    /// Root for named pipes and mask images.
    pub shm_dir: PathBuf,
    pub restart_backoff: Duration,
    pub event_queue: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        // Defaults never fail to build.
        Self::from_file(BridgeConfigFile::default())
    }
}

impl BridgeConfig {
    /// Loads `DETECT_BRIDGE_CONFIG` if set, then applies env overrides.
    pub fn load() -> Result<Self> {
        let path = std::env::var("DETECT_BRIDGE_CONFIG").ok();
        Self::load_from(path.as_deref().map(Path::new))
    }

    /// Loads `path` (or defaults when `None`), then applies env overrides.
    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let file_cfg = match path {
            Some(path) => read_config_file(path)?,
            None => BridgeConfigFile::default(),
        };
        let mut cfg = Self::from_file(file_cfg);
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Like [`BridgeConfig::load_from`], but first writes a default config
    /// file readable by the owner only when `path` does not exist.
    pub fn load_or_generate(path: &Path) -> Result<Self> {
        if !path.exists() {
            generate_config_file(path)?;
            log::info!("generated config file {}", path.display());
        }
        Self::load_from(Some(path))
    }

    fn from_file(file: BridgeConfigFile) -> Self {
        let detector = file.detector.unwrap_or_default();
        let detector_addr = detector
            .addr
            .unwrap_or_else(|| DEFAULT_DETECTOR_ADDR.to_string());
        let detectors_url = detector
            .detectors_url
            .unwrap_or_else(|| detectors_url(&detector_addr));
        Self {
            detector_addr,
            detectors_url,
            connect_timeout: Duration::from_millis(
                detector
                    .connect_timeout_ms
                    .unwrap_or(DEFAULT_CONNECT_TIMEOUT_MS),
            ),
            ffmpeg_bin: file
                .ffmpeg_bin
                .unwrap_or_else(|| DEFAULT_FFMPEG_BIN.to_string()),
            shm_dir: file
                .shm_dir
                .unwrap_or_else(|| PathBuf::from(DEFAULT_SHM_DIR)),
            restart_backoff: Duration::from_millis(
                file.restart_backoff_ms
                    .unwrap_or(DEFAULT_RESTART_BACKOFF_MS),
            ),
            event_queue: file.event_queue.unwrap_or(DEFAULT_EVENT_QUEUE),
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(addr) = std::env::var("DETECT_BRIDGE_DETECTOR_ADDR") {
            if !addr.trim().is_empty() {
                // Keep an explicitly configured URL, follow the address otherwise.
                if self.detectors_url == detectors_url(&self.detector_addr) {
                    self.detectors_url = detectors_url(&addr);
                }
                self.detector_addr = addr;
            }
        }
        if let Ok(bin) = std::env::var("DETECT_BRIDGE_FFMPEG") {
            if !bin.trim().is_empty() {
                self.ffmpeg_bin = bin;
            }
        }
        if let Ok(dir) = std::env::var("DETECT_BRIDGE_SHM_DIR") {
            if !dir.trim().is_empty() {
                self.shm_dir = PathBuf::from(dir);
            }
        }
        if let Ok(ms) = std::env::var("DETECT_BRIDGE_RESTART_BACKOFF_MS") {
            let ms: u64 = ms.parse().map_err(|_| {
                anyhow!("DETECT_BRIDGE_RESTART_BACKOFF_MS must be an integer number of milliseconds")
            })?;
            self.restart_backoff = Duration::from_millis(ms);
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.detector_addr.trim().is_empty() {
            return Err(anyhow!("detector address must not be empty"));
        }
        if self.connect_timeout.is_zero() {
            return Err(anyhow!("detector connect timeout must be greater than zero"));
        }
        if self.ffmpeg_bin.trim().is_empty() {
            return Err(anyhow!("ffmpeg binary must not be empty"));
        }
        if self.event_queue == 0 {
            return Err(anyhow!("event queue must hold at least one event"));
        }
        Ok(())
    }
}

fn detectors_url(addr: &str) -> String {
    format!("http://{}/detectors", addr)
}

fn read_config_file(path: &Path) -> Result<BridgeConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let cfg = serde_json::from_str(&raw)
        .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?;
    Ok(cfg)
}

fn generate_config_file(path: &Path) -> Result<()> {
    let file = BridgeConfigFile {
        detector: Some(DetectorConfigFile {
            addr: Some(DEFAULT_DETECTOR_ADDR.to_string()),
            ..DetectorConfigFile::default()
        }),
        ..BridgeConfigFile::default()
    };
    let raw = serde_json::to_string_pretty(&file)?;

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create config directory {}", parent.display()))?;
    }
    let mut options = std::fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut out = options
        .open(path)
        .with_context(|| format!("create config file {}", path.display()))?;
    std::io::Write::write_all(&mut out, raw.as_bytes())
        .with_context(|| format!("write config file {}", path.display()))?;
    Ok(())
}
