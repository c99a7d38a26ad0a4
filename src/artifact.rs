use std::fs;
use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};

use log::{debug, warn};
use uuid::Uuid;

// Upper bound on directory entries inspected by the fallback search.
const MAX_SCAN_ENTRIES: usize = 256;

/// Temporary output of one request: a private directory `<root>/<key>/`
/// named by a fresh random identifier.
///
/// Dropping the guard removes that directory, i.e. the mp3 and any
/// intermediate files yt-dlp left behind, without touching anything else
/// under the root. Move it into the response body so deletion happens once
/// the body is finished or abandoned.
#[derive(Debug)]
pub struct Artifact {
    dir: PathBuf,
    key: String,
}

impl Artifact {
    /// Reserve a new key under `root` and create its directory.
    pub async fn create(root: impl AsRef<Path>) -> io::Result<Self> {
        let key = Uuid::new_v4().simple().to_string();
        let dir = root.as_ref().join(&key);
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self { dir, key })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// yt-dlp `-o` template for this artifact.
    pub fn output_template(&self) -> PathBuf {
        self.dir.join(format!("{}.%(ext)s", self.key))
    }

    pub fn expected_path(&self) -> PathBuf {
        self.dir.join(format!("{}.mp3", self.key))
    }

    /// Find the finished mp3 on a blocking thread: the expected path first,
    /// then a bounded scan of the private directory for `<key>*.mp3`.
    pub async fn locate(&self) -> Option<PathBuf> {
        let dir = self.dir.clone();
        let key = self.key.clone();
        let expected = self.expected_path();
        tokio::task::spawn_blocking(move || locate_in(&dir, &key, expected))
            .await
            .ok()
            .flatten()
    }
}

fn locate_in(dir: &Path, key: &str, expected: PathBuf) -> Option<PathBuf> {
    if expected.is_file() {
        return Some(expected);
    }

    fs::read_dir(dir)
        .ok()?
        .take(MAX_SCAN_ENTRIES)
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .find(|p| {
            let name = p.file_name().and_then(|n| n.to_str()).unwrap_or("");
            p.is_file() && name.starts_with(key) && name.to_ascii_lowercase().ends_with(".mp3")
        })
}

impl Drop for Artifact {
    fn drop(&mut self) {
        // Only this request's directory is removed; its size is bounded by one extraction.
        match fs::remove_dir_all(&self.dir) {
            Ok(()) => debug!("[CLEANUP] removed {}", self.dir.display()),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => warn!("[CLEANUP] failed to remove {}: {}", self.dir.display(), e),
        }
    }
}
