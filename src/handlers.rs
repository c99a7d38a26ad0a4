use std::path::PathBuf;

use actix_web::body::SizedStream;
use actix_web::http::header::{
    self, Charset, ContentDisposition, DispositionParam, DispositionType, ExtendedValue,
};
use actix_web::{web, HttpResponse, Responder};
use async_stream::stream;
use log::{debug, info};
use serde::Deserialize;
use tokio::fs::File;
use tokio::io::AsyncReadExt;
use tokio::sync::OwnedSemaphorePermit;

use crate::artifact::Artifact;
use crate::error::ApiError;
use crate::state::AppState;
use crate::util;
use crate::ytdlp::{ExtractionError, ExtractionResult};

const DEFAULT_FILENAME: &str = "audio";
const CHUNK_SIZE: usize = 64 * 1024;

#[derive(Deserialize)]
pub struct DownloadQuery {
    pub url: Option<String>,
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(web::resource("/").route(web::get().to(index)))
        .service(web::resource("/health").route(web::get().to(health)))
        .service(web::resource("/download").route(web::get().to(download)))
        .service(web::resource("/mp3").route(web::get().to(download)));
}

pub async fn index(state: web::Data<AppState>) -> impl Responder {
    HttpResponse::Ok().json(serde_json::json!({
        "status": "running",
        "service": "YouTube -> MP3 Service",
        "version": env!("CARGO_PKG_VERSION"),
        "cookies_loaded": state.config.cookies_loaded(),
        "endpoints": {
            "GET /": "Service status",
            "GET /health": "Health check",
            "GET /download?url=URL": "Extract audio as mp3 and return it as an attachment",
            "GET /mp3?url=URL": "Alias of /download"
        }
    }))
}

pub async fn health(state: web::Data<AppState>) -> impl Responder {
    HttpResponse::Ok().json(serde_json::json!({
        "status": "ok",
        "output_dir": state.config.output_dir.to_string_lossy()
    }))
}

/// Externally visible attachment name for a title.
fn download_filename(title: &str) -> String {
    let mut name = util::sanitize_filename(title);
    if name.is_empty() {
        name = DEFAULT_FILENAME.to_string();
    }
    if !name.to_ascii_lowercase().ends_with(".mp3") {
        name.push_str(".mp3");
    }
    name
}

fn content_disposition(filename: &str) -> ContentDisposition {
    let ascii: String = filename
        .chars()
        .map(|c| if c.is_ascii() { c } else { '_' })
        .collect();
    let mut parameters = vec![DispositionParam::Filename(ascii)];
    if !filename.is_ascii() {
        parameters.push(DispositionParam::FilenameExt(ExtendedValue {
            charset: Charset::Ext("UTF-8".to_string()),
            language_tag: None,
            value: filename.as_bytes().to_vec(),
        }));
    }
    ContentDisposition {
        disposition: DispositionType::Attachment,
        parameters,
    }
}

// Only files belonging to this request's artifact are served, so the guard
// is guaranteed to clean up whatever gets streamed.
async fn locate_output(artifact: &Artifact, result: &ExtractionResult) -> Option<PathBuf> {
    let reported = &result.output_path;
    let owned = reported.parent() == Some(artifact.dir())
        && reported
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.starts_with(artifact.key()));
    if owned
        && tokio::fs::metadata(reported)
            .await
            .is_ok_and(|m| m.is_file())
    {
        return Some(reported.clone());
    }
    artifact.locate().await
}

pub async fn download(
    query: web::Query<DownloadQuery>,
    state: web::Data<AppState>,
) -> Result<HttpResponse, ApiError> {
    let raw = query.url.as_deref().map(str::trim).unwrap_or("");
    if raw.is_empty() {
        return Err(ApiError::MissingUrl);
    }
    let url = util::normalize_url(raw);
    info!("[DOWNLOAD] Request: url={}", url);

    // Requests beyond the limit wait for a slot; the slot is held until the body is done.
    let permit = state
        .limiter
        .clone()
        .acquire_owned()
        .await
        .map_err(|e| ExtractionError::Internal(format!("Download limiter closed: {}", e)))?;

    // From here on every exit path drops the guard, which removes the files.
    let artifact = Artifact::create(&state.config.output_dir)
        .await
        .map_err(|e| ExtractionError::Internal(format!("Failed to create artifact directory: {}", e)))?;
    let result = state.extractor.extract(&url, &artifact).await?;
    let path = locate_output(&artifact, &result)
        .await
        .ok_or(ExtractionError::ArtifactMissing)?;
    let len = tokio::fs::metadata(&path)
        .await
        .map_err(|e| ExtractionError::Internal(format!("Failed to stat {}: {}", path.display(), e)))?
        .len();

    let filename = download_filename(result.display_title());
    info!(
        "[DOWNLOAD] Extracted id={} -> {} ({} bytes)",
        result.media_id, filename, len
    );

    let body = stream! {
        let _permit: OwnedSemaphorePermit = permit;
        let _artifact: Artifact = artifact;

        let mut file = match File::open(&path).await {
            Ok(f) => f,
            Err(e) => {
                yield Err(e);
                return;
            }
        };

        let mut buffer = vec![0u8; CHUNK_SIZE];
        loop {
            match file.read(&mut buffer).await {
                Ok(0) => break,
                Ok(n) => yield Ok(bytes::Bytes::copy_from_slice(&buffer[..n])),
                Err(e) => {
                    yield Err(e);
                    break;
                }
            }
        }
        debug!("[DOWNLOAD] Finished streaming {}", path.display());
    };

    Ok(HttpResponse::Ok()
        .content_type("audio/mpeg")
        .insert_header(content_disposition(&filename))
        .append_header((header::CACHE_CONTROL, "no-store"))
        .body(SizedStream::new(len, body)))
}
