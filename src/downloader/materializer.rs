// File materializer - turns an extraction result into a file in storage
//
// Naming happens in two phases. The extension is first guessed from what the
// tier declared (or the content kind), then, for remote sources, checked
// against the response Content-Type. When the two disagree the header wins.
// Bytes are staged in the attempt's work dir and moved into storage once,
// under a name reserved with `create_new`.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tempfile::TempDir;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use super::errors::{ExtractionErrorKind, MaterializeError};
use super::models::{ByteSource, ContentKind, ExtractionResult, ManagedFile};
use super::utils::BrowserProfile;

const MAX_TITLE_CHARS: usize = 50;

/// Prefix of per-attempt scratch directories inside storage
pub const ATTEMPT_DIR_PREFIX: &str = ".attempt-";

/// Extensions we prefer for common media types. Anything else goes through
/// `mime_guess`. The first entry for a MIME type or an extension wins.
const MIME_EXTENSIONS: &[(&str, &str)] = &[
    ("video/mp4", "mp4"),
    ("video/webm", "webm"),
    ("video/quicktime", "mov"),
    ("video/x-matroska", "mkv"),
    ("audio/mpeg", "mp3"),
    ("audio/mp3", "mp3"),
    ("audio/mp4", "m4a"),
    ("audio/mp4", "mp4"),
    ("audio/x-m4a", "m4a"),
    ("audio/m4a", "m4a"),
    ("audio/aac", "aac"),
    ("audio/ogg", "ogg"),
    ("audio/opus", "opus"),
    ("audio/webm", "webm"),
    ("audio/x-matroska", "mkv"),
    ("audio/wav", "wav"),
    ("audio/x-wav", "wav"),
    ("image/jpeg", "jpg"),
    ("image/png", "png"),
    ("image/webp", "webp"),
    ("image/gif", "gif"),
    ("text/plain", "txt"),
];

/// Content types that say nothing about the payload
const GENERIC_MIMES: &[&str] = &[
    "application/octet-stream",
    "binary/octet-stream",
    "application/download",
    "application/force-download",
    "application/x-download",
];

/// Lowercased MIME type without parameters
fn essence(mime: &str) -> String {
    mime.split(';').next().unwrap_or("").trim().to_ascii_lowercase()
}

pub fn is_generic_mime(mime: &str) -> bool {
    let e = essence(mime);
    e.is_empty() || GENERIC_MIMES.contains(&e.as_str())
}

/// Preferred extension for a MIME type
pub fn extension_for_mime(mime: &str) -> Option<String> {
    let e = essence(mime);
    if let Some((_, ext)) = MIME_EXTENSIONS.iter().find(|(m, _)| *m == e) {
        return Some(ext.to_string());
    }
    mime_guess::get_mime_extensions_str(&e)
        .and_then(|exts| exts.first())
        .map(|ext| ext.to_string())
}

/// MIME type served for an extension
pub fn mime_for_extension(ext: &str) -> String {
    let ext = ext.to_ascii_lowercase();
    MIME_EXTENSIONS
        .iter()
        .find(|(_, e)| *e == ext)
        .map(|(m, _)| m.to_string())
        .unwrap_or_else(|| mime_guess::from_ext(&ext).first_or_octet_stream().to_string())
}

/// Like `mime_for_extension`, but an audio `webm` is `audio/webm`
pub fn mime_for_kind(ext: &str, kind: ContentKind) -> String {
    let ext = ext.to_ascii_lowercase();
    let top = format!("{}/", kind.as_str());
    MIME_EXTENSIONS
        .iter()
        .find(|(m, e)| *e == ext && m.starts_with(&top))
        .map(|(m, _)| m.to_string())
        .unwrap_or_else(|| mime_for_extension(&ext))
}

/// True when the guessed extension already describes this MIME type
fn extension_agrees(ext: &str, mime: &str) -> bool {
    let e = essence(mime);
    MIME_EXTENSIONS.iter().any(|(m, x)| *m == e && *x == ext)
        || extension_for_mime(&e).as_deref() == Some(ext)
        || mime_for_extension(ext) == e
        || mime_guess::from_ext(ext).iter().any(|m| m.essence_str() == e)
}

/// Title reduced to `[A-Za-z0-9_]`, at most 50 characters
pub fn safe_title(title: &str) -> String {
    let cleaned: String = title
        .chars()
        .take(MAX_TITLE_CHARS)
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    if cleaned.is_empty() {
        "download".to_string()
    } else {
        cleaned
    }
}

/// Keep only a plausible extension
fn clean_extension(ext: &str) -> Option<String> {
    let ext = ext.trim().trim_start_matches('.').to_ascii_lowercase();
    let plausible = !ext.is_empty() && ext.len() <= 8 && ext.chars().all(|c| c.is_ascii_alphanumeric());
    plausible.then_some(ext)
}

pub fn build_filename(title: &str, millis: u128, ext: &str) -> String {
    format!("{}_{}.{}", safe_title(title), millis, ext)
}

fn unix_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0)
}

fn transport_kind(err: &reqwest::Error) -> ExtractionErrorKind {
    if err.is_timeout() {
        ExtractionErrorKind::Timeout
    } else {
        ExtractionErrorKind::ProcessFailure
    }
}

pub struct Materializer {
    storage_dir: PathBuf,
    client: reqwest::Client,
}

impl Materializer {
    pub fn new(storage_dir: impl Into<PathBuf>, client: reqwest::Client) -> Self {
        Self {
            storage_dir: storage_dir.into(),
            client,
        }
    }

    pub fn storage_dir(&self) -> &Path {
        &self.storage_dir
    }

    /// Fresh scratch directory for one tier attempt. It lives inside storage
    /// so the final move is a rename; dropping it removes anything left over.
    pub async fn workspace(&self) -> Result<TempDir, MaterializeError> {
        tokio::fs::create_dir_all(&self.storage_dir)
            .await
            .map_err(|e| MaterializeError::write(&self.storage_dir, e))?;

        tempfile::Builder::new()
            .prefix(ATTEMPT_DIR_PREFIX)
            .tempdir_in(&self.storage_dir)
            .map_err(|e| MaterializeError::write(&self.storage_dir, e))
    }

    /// Claim the first free `{title}_{millis}.{ext}` at or after `millis`.
    /// The empty placeholder is created with `create_new`, so two requests
    /// never end up with the same name.
    async fn reserve_name(&self, title: &str, ext: &str, mut millis: u128) -> Result<(PathBuf, String), MaterializeError> {
        loop {
            let filename = build_filename(title, millis, ext);
            let path = self.storage_dir.join(&filename);
            match tokio::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
                .await
            {
                Ok(_) => return Ok((path, filename)),
                Err(e) if e.kind() == ErrorKind::AlreadyExists => millis += 1,
                Err(e) => return Err(MaterializeError::write(&path, e)),
            }
        }
    }

    /// Move a staged file onto a freshly reserved name
    async fn commit(&self, staged: &Path, title: &str, ext: &str) -> Result<(PathBuf, String), MaterializeError> {
        let (path, filename) = self.reserve_name(title, ext, unix_millis()).await?;
        if let Err(e) = move_file(staged, &path).await {
            if let Err(rm) = tokio::fs::remove_file(&path).await {
                warn!(path = %path.display(), error = %rm, "failed to remove name placeholder");
            }
            return Err(e);
        }
        Ok((path, filename))
    }

    /// Stage the bytes of `result` in `work_dir`, then move them into storage
    pub async fn materialize(&self, result: &ExtractionResult, work_dir: &Path) -> Result<ManagedFile, MaterializeError> {
        tokio::fs::create_dir_all(&self.storage_dir)
            .await
            .map_err(|e| MaterializeError::write(&self.storage_dir, e))?;

        let guessed_ext = result
            .declared_ext
            .as_deref()
            .and_then(clean_extension)
            .unwrap_or_else(|| result.content_type.default_extension().to_string());

        let (staged, ext, content_type, mime) = match &result.source {
            ByteSource::Inline(bytes) => {
                let staged = work_dir.join(format!("inline.{}", guessed_ext));
                tokio::fs::write(&staged, bytes)
                    .await
                    .map_err(|e| MaterializeError::write(&staged, e))?;
                let mime = mime_for_kind(&guessed_ext, result.content_type);
                (staged, guessed_ext, result.content_type, mime)
            }
            ByteSource::LocalFile(source) => {
                // The tool chose the container, so its extension is authoritative
                let mime = mime_for_kind(&guessed_ext, result.content_type);
                (source.clone(), guessed_ext, result.content_type, mime)
            }
            ByteSource::Remote(url) => {
                let staged = work_dir.join(format!("remote.{}", guessed_ext));
                let header = self.fetch(url, &staged).await?;
                match header.filter(|h| !is_generic_mime(h)) {
                    Some(header) => {
                        let mime = essence(&header);
                        let kind = match ContentKind::from_mime(&mime) {
                            Some(ContentKind::Video) if result.content_type == ContentKind::Audio => ContentKind::Audio,
                            Some(kind) => kind,
                            None => result.content_type,
                        };
                        let ext = match extension_for_mime(&mime) {
                            Some(ext) if !extension_agrees(&guessed_ext, &mime) => {
                                info!(from = %guessed_ext, to = %ext, mime = %mime, "corrected extension from Content-Type");
                                ext
                            }
                            _ => guessed_ext,
                        };
                        (staged, ext, kind, mime)
                    }
                    None => {
                        let mime = mime_for_kind(&guessed_ext, result.content_type);
                        (staged, guessed_ext, result.content_type, mime)
                    }
                }
            }
        };

        let (path, filename) = self.commit(&staged, &result.title, &ext).await?;

        let size = tokio::fs::metadata(&path)
            .await
            .map_err(|e| MaterializeError::write(&path, e))?
            .len();

        debug!(file = %filename, size, kind = content_type.as_str(), "materialized");

        Ok(ManagedFile {
            path,
            filename,
            content_type,
            mime,
            size,
            created_at: SystemTime::now(),
        })
    }

    /// Stream a remote body to `path`; returns the Content-Type header.
    /// A partial file is left for the work dir to discard.
    async fn fetch(&self, url: &str, path: &Path) -> Result<Option<String>, MaterializeError> {
        let fetch_err = |kind: ExtractionErrorKind, message: String| MaterializeError::Fetch {
            url: url.to_string(),
            kind,
            message,
        };

        let mut response = self
            .client
            .get(url)
            .headers(BrowserProfile::random().headers())
            .send()
            .await
            .map_err(|e| fetch_err(transport_kind(&e), e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(fetch_err(
                ExtractionErrorKind::from_http_status(status.as_u16()),
                format!("media fetch returned HTTP {}", status.as_u16()),
            ));
        }

        let header = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        if header.as_deref().map(essence).as_deref() == Some("text/html") {
            return Err(fetch_err(
                ExtractionErrorKind::EmptyResult,
                "upstream returned an HTML page instead of media".to_string(),
            ));
        }

        let mut file = tokio::fs::File::create(path)
            .await
            .map_err(|e| MaterializeError::write(path, e))?;

        let mut written: u64 = 0;
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| fetch_err(transport_kind(&e), e.to_string()))?
        {
            file.write_all(&chunk)
                .await
                .map_err(|e| MaterializeError::write(path, e))?;
            written += chunk.len() as u64;
        }

        file.flush().await.map_err(|e| MaterializeError::write(path, e))?;

        if written == 0 {
            return Err(fetch_err(ExtractionErrorKind::EmptyResult, "empty response body".to_string()));
        }

        Ok(header)
    }
}

/// Rename, falling back to copy + remove across filesystems
async fn move_file(from: &Path, to: &Path) -> Result<(), MaterializeError> {
    if tokio::fs::rename(from, to).await.is_ok() {
        return Ok(());
    }

    tokio::fs::copy(from, to)
        .await
        .map_err(|e| MaterializeError::Rename {
            from: from.to_path_buf(),
            to: to.to_path_buf(),
            source: e,
        })?;
    if let Err(e) = tokio::fs::remove_file(from).await {
        warn!(path = %from.display(), error = %e, "copied staged file but could not remove the original");
    }
    Ok(())
}
