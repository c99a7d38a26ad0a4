use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info};
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::Mutex as AsyncMutex;
use tokio::time;

use crate::artifact::Artifact;
use crate::config::AppConfig;

const STDERR_TAIL_LINES: usize = 50;
const DEFAULT_TITLE: &str = "audio";

/// What a finished extraction produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractionResult {
    pub media_id: String,
    pub title: Option<String>,
    pub output_path: PathBuf,
}

impl ExtractionResult {
    /// Title for display, falling back to the media id.
    pub fn display_title(&self) -> &str {
        self.title
            .as_deref()
            .filter(|t| !t.trim().is_empty())
            .or(Some(self.media_id.as_str()).filter(|id| !id.is_empty()))
            .unwrap_or(DEFAULT_TITLE)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ExtractionError {
    /// The tool ran and reported failure; usually a bad URL or stale cookies.
    #[error("Download failed: {message}")]
    DownloadFailed {
        message: String,
        stderr_tail: Option<String>,
    },
    #[error("MP3 file not found after conversion")]
    ArtifactMissing,
    #[error("yt-dlp timed out after {after:?}")]
    TimedOut {
        after: Duration,
        stderr_tail: Option<String>,
    },
    #[error("Unexpected error: {0}")]
    Internal(String),
}

impl ExtractionError {
    /// Last lines yt-dlp wrote to stderr, when it got far enough to write any.
    pub fn stderr_tail(&self) -> Option<&str> {
        match self {
            Self::DownloadFailed { stderr_tail, .. } | Self::TimedOut { stderr_tail, .. } => {
                stderr_tail.as_deref()
            }
            Self::ArtifactMissing | Self::Internal(_) => None,
        }
    }
}

/// Fetch the best audio for `url` and transcode it to mp3 at the artifact's location.
#[async_trait]
pub trait Extractor: Send + Sync {
    async fn extract(&self, url: &str, artifact: &Artifact) -> Result<ExtractionResult, ExtractionError>;
}

#[derive(Debug, Deserialize)]
struct VideoMeta {
    id: String,
    title: Option<String>,
}

fn parse_metadata(stdout: &[u8]) -> Option<VideoMeta> {
    String::from_utf8_lossy(stdout)
        .lines()
        .rev()
        .filter(|l| l.trim_start().starts_with('{'))
        .find_map(|l| serde_json::from_str::<VideoMeta>(l).ok())
}

async fn collect_stderr(
    stderr: tokio::process::ChildStderr,
    buf: Arc<AsyncMutex<VecDeque<String>>>,
) {
    let mut r = BufReader::new(stderr);
    let mut line = String::new();
    loop {
        line.clear();
        match r.read_line(&mut line).await {
            Ok(0) => break,
            Ok(_) => {
                let l = line.trim_end().to_string();
                if !l.is_empty() {
                    debug!("[YTDLP] {}", l);
                    let mut g = buf.lock().await;
                    if g.len() >= STDERR_TAIL_LINES {
                        g.pop_front();
                    }
                    g.push_back(l);
                }
            }
            Err(_) => break,
        }
    }
}

async fn render_tail(buf: &AsyncMutex<VecDeque<String>>) -> Option<String> {
    let g = buf.lock().await;
    if g.is_empty() {
        return None;
    }
    Some(g.iter().cloned().collect::<Vec<_>>().join("\n"))
}

fn find_ffmpeg(cfg: &AppConfig) -> Option<PathBuf> {
    if let Some(p) = &cfg.ffmpeg_bin {
        return Some(p.clone());
    }
    ["/opt/homebrew/bin/ffmpeg", "/usr/local/bin/ffmpeg", "/usr/bin/ffmpeg"]
        .into_iter()
        .map(PathBuf::from)
        .find(|p| p.exists())
}

/// Runs the `yt-dlp` binary as a subprocess.
pub struct YtDlpExtractor {
    config: Arc<AppConfig>,
}

impl YtDlpExtractor {
    pub fn new(config: Arc<AppConfig>) -> Self {
        Self { config }
    }

    fn build_command(&self, url: &str, artifact: &Artifact) -> Command {
        let cfg = self.config.as_ref();
        let mut cmd = Command::new(&cfg.ytdlp_bin);
        cmd.env("PATH", &cfg.ytdlp_path);

        if !cfg.inherit_proxy_env {
            // Avoid being accidentally bound to a dead local proxy (common in shell env).
            cmd.env_remove("http_proxy")
                .env_remove("https_proxy")
                .env_remove("HTTP_PROXY")
                .env_remove("HTTPS_PROXY")
                .env_remove("no_proxy")
                .env_remove("NO_PROXY");
        }

        if let Some(p) = &cfg.ytdlp_proxy {
            cmd.arg("--proxy").arg(p);
        }
        if let Some(cookies) = &cfg.cookies_file {
            cmd.arg("--cookies").arg(cookies);
        }
        if let Some(ffmpeg) = find_ffmpeg(cfg) {
            cmd.arg("--ffmpeg-location").arg(ffmpeg);
        }

        cmd.arg("-f")
            .arg("bestaudio/best")
            .arg("-x")
            .arg("--audio-format")
            .arg("mp3")
            .arg("--audio-quality")
            .arg(format!("{}K", cfg.audio_quality))
            .arg("--no-playlist")
            .arg("--no-part")
            .arg("--no-cache-dir")
            .arg("--no-write-thumbnail")
            .arg("--no-warnings")
            .arg("--dump-json")
            .arg("--no-simulate")
            .arg("-o")
            .arg(artifact.output_template())
            .arg("--")
            .arg(url)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);

        cmd
    }
}

#[async_trait]
impl Extractor for YtDlpExtractor {
    async fn extract(&self, url: &str, artifact: &Artifact) -> Result<ExtractionResult, ExtractionError> {
        let mut child = self
            .build_command(url, artifact)
            .spawn()
            .map_err(|e| ExtractionError::Internal(format!("Failed to start yt-dlp: {}", e)))?;
        if let Some(pid) = child.id() {
            info!("[YTDLP] started (pid={}) key={}", pid, artifact.key());
        }

        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| ExtractionError::Internal("Failed to capture yt-dlp stderr".to_string()))?;
        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| ExtractionError::Internal("Failed to capture yt-dlp stdout".to_string()))?;

        let tail_buf: Arc<AsyncMutex<VecDeque<String>>> = Arc::new(AsyncMutex::new(VecDeque::new()));
        let stderr_task = tokio::spawn(collect_stderr(stderr, tail_buf.clone()));
        let stdout_task = tokio::spawn(async move {
            let mut out = Vec::new();
            stdout.read_to_end(&mut out).await.map(|_| out)
        });

        let waited = match self.config.extract_timeout {
            Some(limit) => match time::timeout(limit, child.wait()).await {
                Ok(r) => r,
                Err(_) => {
                    let _ = child.start_kill();
                    stderr_task.abort();
                    stdout_task.abort();
                    return Err(ExtractionError::TimedOut {
                        after: limit,
                        stderr_tail: render_tail(&tail_buf).await,
                    });
                }
            },
            None => child.wait().await,
        };
        let status = waited
            .map_err(|e| ExtractionError::Internal(format!("Failed waiting for yt-dlp: {}", e)))?;
        let _ = stderr_task.await;

        if !status.success() {
            return Err(ExtractionError::DownloadFailed {
                message: format!("yt-dlp exited with error (status={})", status),
                stderr_tail: render_tail(&tail_buf).await,
            });
        }

        let stdout = stdout_task
            .await
            .map_err(|e| ExtractionError::Internal(format!("yt-dlp stdout reader failed: {}", e)))?
            .map_err(|e| ExtractionError::Internal(format!("Failed reading yt-dlp output: {}", e)))?;
        let meta = parse_metadata(&stdout).ok_or_else(|| {
            ExtractionError::Internal("yt-dlp succeeded but printed no metadata".to_string())
        })?;

        let output_path = artifact.locate().await.ok_or(ExtractionError::ArtifactMissing)?;
        Ok(ExtractionResult {
            media_id: meta.id,
            title: meta.title,
            output_path,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::OsStr;
    use std::path::Path;

    fn test_config(dir: &Path) -> AppConfig {
        let mut cfg = AppConfig::for_output_dir(dir);
        cfg.ffmpeg_bin = Some(PathBuf::from("/opt/ffmpeg/bin/ffmpeg"));
        cfg
    }

    fn args_of(cmd: &Command) -> Vec<String> {
        cmd.as_std()
            .get_args()
            .map(|a: &OsStr| a.to_string_lossy().to_string())
            .collect()
    }

    #[tokio::test]
    async fn command_requests_single_mp3_audio() {
        let dir = tempfile::tempdir().unwrap();
        let extractor = YtDlpExtractor::new(Arc::new(test_config(dir.path())));
        let artifact = Artifact::create(dir.path()).await.unwrap();
        let args = args_of(&extractor.build_command("https://youtu.be/x", &artifact));

        for flag in ["-x", "--no-playlist", "--no-part", "--dump-json", "--no-simulate"] {
            assert!(args.iter().any(|a| a == flag), "missing {flag}");
        }
        let after = |flag: &str| {
            let i = args.iter().position(|a| a == flag).unwrap();
            args[i + 1].clone()
        };
        assert_eq!(after("-f"), "bestaudio/best");
        assert_eq!(after("--audio-format"), "mp3");
        assert_eq!(after("--audio-quality"), "192K");
        assert_eq!(after("-o"), artifact.output_template().to_string_lossy());
        assert_eq!(after("--ffmpeg-location"), "/opt/ffmpeg/bin/ffmpeg");
        assert_eq!(args.last().map(String::as_str), Some("https://youtu.be/x"));
        assert!(!args.iter().any(|a| a == "--cookies"));
        assert!(!args.iter().any(|a| a == "--proxy"));
    }

    #[tokio::test]
    async fn command_passes_cookies_and_proxy() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = test_config(dir.path());
        cfg.cookies_file = Some(dir.path().join("cookies.txt"));
        cfg.ytdlp_proxy = Some("socks5://127.0.0.1:7890".to_string());
        cfg.audio_quality = 320;
        let extractor = YtDlpExtractor::new(Arc::new(cfg));
        let artifact = Artifact::create(dir.path()).await.unwrap();
        let args = args_of(&extractor.build_command("u", &artifact));

        let cookies = dir.path().join("cookies.txt").to_string_lossy().to_string();
        assert!(args.windows(2).any(|w| w[0] == "--cookies" && w[1] == cookies));
        assert!(args.windows(2).any(|w| w[0] == "--proxy" && w[1] == "socks5://127.0.0.1:7890"));
        assert!(args.windows(2).any(|w| w[0] == "--audio-quality" && w[1] == "320K"));
    }

    #[test]
    fn metadata_from_last_json_line() {
        let out = b"[info] something\n{\"id\":\"abc\",\"title\":\"Song\",\"duration\":12}\n";
        let meta = parse_metadata(out).unwrap();
        assert_eq!(meta.id, "abc");
        assert_eq!(meta.title.as_deref(), Some("Song"));
        assert!(parse_metadata(b"").is_none());
        assert!(parse_metadata(b"{not json}\n").is_none());
    }

    #[test]
    fn display_title_falls_back() {
        let mut r = ExtractionResult {
            media_id: "abc".to_string(),
            title: Some("  ".to_string()),
            output_path: PathBuf::from("x.mp3"),
        };
        assert_eq!(r.display_title(), "abc");
        r.media_id.clear();
        assert_eq!(r.display_title(), "audio");
        r.title = Some("Real".to_string());
        assert_eq!(r.display_title(), "Real");
    }

    #[cfg(unix)]
    fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    // All subprocess scenarios share one test so no other test thread forks
    // while a script is still open for writing.
    #[cfg(unix)]
    #[tokio::test]
    async fn subprocess_outcomes() {
        let bin_dir = tempfile::tempdir().unwrap();
        let out_dir = tempfile::tempdir().unwrap();

        let ok = write_script(
            bin_dir.path(),
            "ok.sh",
            r#"while [ $# -gt 0 ]; do
  if [ "$1" = "-o" ]; then out="$2"; fi
  shift
done
printf 'ID3' > "$(dirname "$out")/$(basename "$out" '.%(ext)s').mp3"
echo '{"id":"abc123","title":"Fake Song"}'"#,
        );
        let failing = write_script(bin_dir.path(), "fail.sh", "echo 'ERROR: Unsupported URL' >&2\nexit 1");
        let no_file = write_script(bin_dir.path(), "nofile.sh", r#"echo '{"id":"abc123"}'"#);
        let silent = write_script(bin_dir.path(), "silent.sh", "exit 0");
        let slow = write_script(bin_dir.path(), "slow.sh", "echo '[download] 3.0%' >&2\nexec sleep 5");

        let run = |bin: PathBuf, timeout: Option<Duration>| {
            let mut cfg = test_config(out_dir.path());
            cfg.ytdlp_bin = bin;
            cfg.ffmpeg_bin = None;
            cfg.extract_timeout = timeout;
            YtDlpExtractor::new(Arc::new(cfg))
        };

        let artifact = Artifact::create(out_dir.path()).await.unwrap();
        let result = run(ok, None).extract("https://example.com/v", &artifact).await.unwrap();
        assert_eq!(result.media_id, "abc123");
        assert_eq!(result.title.as_deref(), Some("Fake Song"));
        assert_eq!(result.output_path, artifact.expected_path());
        drop(artifact);
        assert!(!result.output_path.exists());
        assert!(std::fs::read_dir(out_dir.path()).unwrap().next().is_none());

        let artifact = Artifact::create(out_dir.path()).await.unwrap();
        match run(failing, None).extract("u", &artifact).await {
            Err(err @ ExtractionError::DownloadFailed { .. }) => {
                assert!(err.to_string().starts_with("Download failed: yt-dlp exited with error"));
                assert_eq!(err.stderr_tail(), Some("ERROR: Unsupported URL"));
            }
            other => panic!("unexpected: {other:?}"),
        }
        assert!(matches!(
            run(no_file, None).extract("u", &artifact).await,
            Err(ExtractionError::ArtifactMissing)
        ));
        assert!(matches!(
            run(silent, None).extract("u", &artifact).await,
            Err(ExtractionError::Internal(_))
        ));
        match run(slow, Some(Duration::from_millis(500))).extract("u", &artifact).await {
            Err(err @ ExtractionError::TimedOut { .. }) => {
                assert_eq!(err.stderr_tail(), Some("[download] 3.0%"));
            }
            other => panic!("unexpected: {other:?}"),
        }
        assert!(matches!(
            run(bin_dir.path().join("missing"), None).extract("u", &artifact).await,
            Err(ExtractionError::Internal(_))
        ));
    }
}
