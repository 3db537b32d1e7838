use async_trait::async_trait;
use calamine::{open_workbook_auto, Reader};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DOWNLOAD_ATTEMPTS: u32 = 3;
pub const DOWNLOAD_RETRY_DELAY: Duration = Duration::from_secs(2);

pub const DATABOOK_ARCHIVE_DIR: &str = "Databook_Archive";
pub const IMPORT_ARCHIVE_DIR: &str = "Import_Archive";
pub const STATS_CSV: &str = "stats.csv";
/// Workbook copies moved into the import archive after each run.
pub const SECONDARY_FILES: [&str; 2] = ["stats.xlsx", "stats.xls"];

/// Strip any directory components from an uploaded filename.
pub fn sanitize_filename(name: &str) -> String {
    let base = name
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or_default()
        .trim();
    match base {
        "" | "." | ".." => "upload".to_string(),
        other => other.to_string(),
    }
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Write to `<path>.tmp` and rename over `path`.
pub fn write_atomic(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = tmp_path(path);
    std::fs::write(&tmp, contents)?;
    std::fs::rename(&tmp, path).inspect_err(|_| {
        let _ = std::fs::remove_file(&tmp);
    })
}

pub fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<(), StorageError> {
    let body = serde_json::to_vec_pretty(value)?;
    write_atomic(path, &body)?;
    Ok(())
}

/// Append one CSV row, writing `header` first when the file is new and the
/// header is non-empty.
pub fn append_csv_row(path: &Path, header: &[&str], row: &[String]) -> Result<(), StorageError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let is_new = std::fs::metadata(path).map(|m| m.len() == 0).unwrap_or(true);
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(file);
    if is_new && !header.is_empty() {
        writer.write_record(header)?;
    }
    writer.write_record(row)?;
    writer.flush()?;
    Ok(())
}

/// `<stem>_<YYYY-mm-dd_HHMM><ext>` for archived copies.
pub fn archive_name(path: &Path, at: DateTime<Utc>) -> String {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "file".to_string());
    let ext = path
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();
    format!("{}_{}{}", stem, at.format("%Y-%m-%d_%H%M"), ext)
}

/// Rename, falling back to copy + delete across filesystems.
pub fn move_file(src: &Path, dst: &Path) -> Result<(), StorageError> {
    if let Some(parent) = dst.parent() {
        std::fs::create_dir_all(parent)?;
    }
    if std::fs::rename(src, dst).is_ok() {
        return Ok(());
    }
    std::fs::copy(src, dst)?;
    std::fs::remove_file(src)?;
    Ok(())
}

/// Move `src` into `dir` under its timestamped archive name.
pub fn archive_into(src: &Path, dir: &Path, at: DateTime<Utc>) -> Result<PathBuf, StorageError> {
    let dst = dir.join(archive_name(src, at));
    move_file(src, &dst)?;
    Ok(dst)
}

/// True when both paths resolve to the same existing file.
pub fn same_file(a: &Path, b: &Path) -> bool {
    match (a.canonicalize(), b.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

fn is_csv(path: &Path) -> bool {
    path.extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("csv"))
}

/// Value written to the `updated_on` column, e.g. `02Jun25-14h07m`.
pub fn updated_on_stamp(at: DateTime<Utc>) -> String {
    at.format("%d%b%y-%Hh%Mm").to_string()
}

/// Files produced from one upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedStats {
    /// `<download>/stats.csv`, the import input
    pub csv: PathBuf,
    /// `<download>/stats.<xlsx|xls>` for workbook uploads
    pub workbook: Option<PathBuf>,
}

/// Normalize an upload into `<download>/stats.csv` with an `updated_on`
/// column. Workbooks contribute their last sheet and are also copied to
/// `<download>/stats.<ext>`.
pub fn normalize_stats_file(
    source: &Path,
    download_folder: &Path,
    at: DateTime<Utc>,
) -> Result<NormalizedStats, StorageError> {
    if !source.is_file() {
        return Err(StorageError::MissingSource(source.display().to_string()));
    }
    std::fs::create_dir_all(download_folder)?;
    let csv_path = download_folder.join(STATS_CSV);
    let stamp = updated_on_stamp(at);

    if is_csv(source) {
        let mut reader = csv::Reader::from_path(source)?;
        let headers = reader.headers()?.iter().map(str::to_string).collect();
        let rows: Vec<Result<Vec<String>, StorageError>> = reader
            .records()
            .map(|record| {
                record
                    .map(|r| r.iter().map(str::to_string).collect())
                    .map_err(StorageError::from)
            })
            .collect();
        write_with_updated_on(&csv_path, headers, rows, &stamp)?;
        return Ok(NormalizedStats {
            csv: csv_path,
            workbook: None,
        });
    }

    let mut workbook = open_workbook_auto(source)?;
    let sheet = workbook
        .sheet_names()
        .last()
        .cloned()
        .ok_or_else(|| StorageError::EmptyWorkbook(source.display().to_string()))?;
    let range = workbook.worksheet_range(&sheet)?;
    let mut rows = range
        .rows()
        .map(|row| row.iter().map(|cell| cell.to_string()).collect::<Vec<_>>());
    let headers = rows.next().unwrap_or_default();
    write_with_updated_on(&csv_path, headers, rows.map(Ok), &stamp)?;
    tracing::info!(sheet = %sheet, output = %csv_path.display(), "Wrote stats CSV from workbook");

    let ext = source
        .extension()
        .map(|e| e.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_else(|| "xlsx".to_string());
    let copy = download_folder.join(format!("stats.{ext}"));
    if !same_file(source, &copy) {
        std::fs::copy(source, &copy)?;
    }
    Ok(NormalizedStats {
        csv: csv_path,
        workbook: Some(copy),
    })
}

fn write_with_updated_on<I>(
    output: &Path,
    mut headers: Vec<String>,
    rows: I,
    stamp: &str,
) -> Result<(), StorageError>
where
    I: IntoIterator<Item = Result<Vec<String>, StorageError>>,
{
    let add_column = !headers
        .iter()
        .any(|h| h.trim().eq_ignore_ascii_case("updated_on"));
    if add_column {
        headers.push("updated_on".to_string());
    }
    let tmp = tmp_path(output);
    {
        let mut writer = csv::Writer::from_path(&tmp)?;
        writer.write_record(&headers)?;
        for row in rows {
            let mut row = row?;
            if add_column {
                row.push(stamp.to_string());
            }
            writer.write_record(&row)?;
        }
        writer.flush()?;
    }
    std::fs::rename(&tmp, output)?;
    Ok(())
}

/// Fetches attachment bytes from a URL.
#[async_trait]
pub trait AttachmentFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, StorageError>;
}

/// Discord CDN downloads over HTTPS.
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new() -> Result<Self, StorageError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl AttachmentFetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, StorageError> {
        let response = self.client.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(StorageError::Status(status.as_u16()));
        }
        Ok(response.bytes().await?.to_vec())
    }
}

/// Download `url` to `dest`, retrying on failure.
pub async fn download_with_retries(
    fetcher: &dyn AttachmentFetcher,
    url: &str,
    dest: &Path,
    attempts: u32,
    delay: Duration,
) -> Result<(), StorageError> {
    let mut last_error = StorageError::MissingSource(url.to_string());
    for attempt in 1..=attempts.max(1) {
        match fetcher.fetch(url).await {
            Ok(bytes) => {
                if let Some(parent) = dest.parent() {
                    tokio::fs::create_dir_all(parent).await?;
                }
                tokio::fs::write(dest, bytes).await?;
                return Ok(());
            }
            Err(e) => {
                tracing::warn!(attempt, url, error = %e, "Attachment download failed");
                last_error = e;
                if attempt < attempts {
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
    Err(last_error)
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Unexpected HTTP status {0}")]
    Status(u16),

    #[error("Workbook error: {0}")]
    Workbook(#[from] calamine::Error),

    #[error("Workbook has no sheets: {0}")]
    EmptyWorkbook(String),

    #[error("Source file not found: {0}")]
    MissingSource(String),
}
