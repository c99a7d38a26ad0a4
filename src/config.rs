use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use log::warn;
use serde::Deserialize;

pub const DEFAULT_CONFIG_PATH: &str = "config.toml";

const ENV_LISTEN_ADDR: &str = "YT_MP3_LISTEN_ADDR";
const ENV_OUTPUT_DIR: &str = "YT_MP3_OUTPUT_DIR";
const ENV_COOKIES_FILE: &str = "YT_MP3_COOKIES_FILE";

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub listen_addr: String,
    pub max_concurrent_downloads: usize,

    // Where artifacts are written before being streamed back.
    pub output_dir: PathBuf,
    // Only set when the file existed at startup.
    pub cookies_file: Option<PathBuf>,

    pub ytdlp_bin: PathBuf,
    pub ytdlp_path: String,
    pub ffmpeg_bin: Option<PathBuf>,
    pub ytdlp_proxy: Option<String>,
    // Whether to let yt-dlp inherit http_proxy/https_proxy from the service environment.
    pub inherit_proxy_env: bool,

    // Target mp3 bitrate in kbps.
    pub audio_quality: u32,
    pub extract_timeout: Option<Duration>,
}

#[derive(Debug, Default, Deserialize)]
struct AppConfigFile {
    listen_addr: Option<String>,
    max_concurrent_downloads: Option<usize>,

    output_dir: Option<String>,
    cookies_file: Option<String>,

    ytdlp_bin: Option<String>,
    ytdlp_path: Option<String>,
    ffmpeg_bin: Option<String>,
    ytdlp_proxy: Option<String>,
    inherit_proxy_env: Option<bool>,

    audio_quality: Option<u32>,
    extract_timeout_secs: Option<u64>,
}

fn default_ytdlp_path() -> String {
    // Prefer inheriting PATH from the service process; override via config.toml when needed.
    std::env::var("PATH").unwrap_or_else(|_| {
        "/opt/homebrew/bin:/usr/local/bin:/usr/bin:/bin:/usr/sbin:/sbin".to_string()
    })
}

fn default_output_dir() -> PathBuf {
    std::env::temp_dir().join("yt_mp3_tmp")
}

fn non_empty(s: Option<String>) -> Option<String> {
    s.and_then(|s| {
        let s = s.trim().to_string();
        if s.is_empty() { None } else { Some(s) }
    })
}

impl AppConfig {
    /// Load from `path`. A missing file is only tolerated when `required` is false,
    /// in which case every field takes its default.
    pub fn load(path: impl AsRef<Path>, required: bool) -> Result<Self> {
        let path = path.as_ref();
        let file = match fs::read_to_string(path) {
            Ok(raw) => toml::from_str::<AppConfigFile>(&raw).with_context(|| {
                format!("Failed to parse config file: {}", path.display())
            })?,
            Err(e) if e.kind() == ErrorKind::NotFound && !required => AppConfigFile::default(),
            Err(e) => {
                return Err(e).with_context(|| {
                    format!("Failed to read config file: {}", path.display())
                })
            }
        };

        Self::from_file(file, |key| std::env::var(key).ok())
    }

    fn from_file(mut file: AppConfigFile, env: impl Fn(&str) -> Option<String>) -> Result<Self> {
        if let Some(v) = non_empty(env(ENV_LISTEN_ADDR)) {
            file.listen_addr = Some(v);
        }
        if let Some(v) = non_empty(env(ENV_OUTPUT_DIR)) {
            file.output_dir = Some(v);
        }
        if let Some(v) = non_empty(env(ENV_COOKIES_FILE)) {
            file.cookies_file = Some(v);
        }

        let cookies_file = non_empty(file.cookies_file).map(PathBuf::from).and_then(|p| {
            if p.is_file() {
                Some(p)
            } else {
                warn!("[CONFIG] cookies file {} not found; continuing without it", p.display());
                None
            }
        });

        let cfg = Self {
            listen_addr: non_empty(file.listen_addr).unwrap_or_else(|| "0.0.0.0:8080".to_string()),
            max_concurrent_downloads: file.max_concurrent_downloads.unwrap_or(5),

            output_dir: non_empty(file.output_dir)
                .map(PathBuf::from)
                .unwrap_or_else(default_output_dir),
            cookies_file,

            ytdlp_bin: PathBuf::from(non_empty(file.ytdlp_bin).unwrap_or_else(|| "yt-dlp".to_string())),
            ytdlp_path: non_empty(file.ytdlp_path).unwrap_or_else(default_ytdlp_path),
            ffmpeg_bin: non_empty(file.ffmpeg_bin).map(PathBuf::from),
            ytdlp_proxy: non_empty(file.ytdlp_proxy),
            inherit_proxy_env: file.inherit_proxy_env.unwrap_or(false),

            audio_quality: file.audio_quality.unwrap_or(192),
            extract_timeout: file.extract_timeout_secs.map(Duration::from_secs),
        };

        if cfg.max_concurrent_downloads == 0 {
            return Err(anyhow!("max_concurrent_downloads must be at least 1"));
        }
        if cfg.audio_quality == 0 {
            return Err(anyhow!("audio_quality must be a positive bitrate in kbps"));
        }
        if cfg.extract_timeout == Some(Duration::ZERO) {
            return Err(anyhow!("extract_timeout_secs must be positive when set"));
        }

        Ok(cfg)
    }

    pub fn cookies_loaded(&self) -> bool {
        self.cookies_file.is_some()
    }

    #[cfg(test)]
    pub(crate) fn for_output_dir(dir: &Path) -> Self {
        Self {
            listen_addr: "127.0.0.1:0".to_string(),
            max_concurrent_downloads: 4,
            output_dir: dir.to_path_buf(),
            cookies_file: None,
            ytdlp_bin: PathBuf::from("yt-dlp"),
            ytdlp_path: default_ytdlp_path(),
            ffmpeg_bin: None,
            ytdlp_proxy: None,
            inherit_proxy_env: false,
            audio_quality: 192,
            extract_timeout: None,
        }
    }

    /// Create the output directory if it does not exist yet.
    pub fn ensure_output_dir(&self) -> Result<()> {
        fs::create_dir_all(&self.output_dir).with_context(|| {
            format!("Failed to create output directory: {}", self.output_dir.display())
        })
    }
}
