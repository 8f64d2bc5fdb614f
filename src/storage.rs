//! Local file handling: reference-image inlining, output naming, and
//! collision-free writes into the output and input folders.

use anyhow::{Context, Result};
use base64::Engine;
use chrono::{DateTime, Local};
use std::fs::OpenOptions;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

/// Read a local image and encode it as a `data:image/<ext>;base64,...` URI.
pub fn to_data_uri(path: &Path) -> std::io::Result<String> {
    let bytes = std::fs::read(path)?;
    let encoded = base64::engine::general_purpose::STANDARD.encode(bytes);
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .filter(|e| !e.is_empty())
        .unwrap_or_else(|| "png".to_string());
    let mime_ext = if ext == "jpg" { "jpeg".to_string() } else { ext };
    Ok(format!("data:image/{};base64,{}", mime_ext, encoded))
}

/// Convert every local-file source into an inline data URI; URLs and
/// existing data URIs pass through untouched. Files that cannot be read are
/// dropped. Returns `None` when nothing is left to send.
pub fn prepare_reference_images(sources: &[String]) -> Option<Vec<String>> {
    let converted: Vec<String> = sources
        .iter()
        .filter_map(|source| {
            let path = Path::new(source);
            if !path.is_file() {
                return Some(source.clone());
            }
            match to_data_uri(path) {
                Ok(uri) => Some(uri),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "skipping unreadable reference image");
                    None
                }
            }
        })
        .collect();

    if converted.is_empty() {
        None
    } else {
        Some(converted)
    }
}

/// Pick the file extension for a downloaded result from its URL.
pub fn extension_for_url(url: &str) -> &'static str {
    if url.contains(".jpeg") {
        "jpeg"
    } else if url.contains(".jpg") {
        "jpg"
    } else {
        "png"
    }
}

/// File stem for an output image created at `now`.
pub fn timestamp_stem(now: DateTime<Local>) -> String {
    now.format("%Y-%m-%d-%H-%M-%S").to_string()
}

/// Write `bytes` into `dir` as `<stem>.<ext>`, creating `dir` if needed.
///
/// Never overwrites: when the name is taken (another unit finished in the
/// same second), `-1`, `-2`, ... is appended to the stem.
pub fn write_unique(dir: &Path, stem: &str, ext: &str, bytes: &[u8]) -> Result<PathBuf> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create directory {}", dir.display()))?;

    let mut n: u32 = 0;
    loop {
        let name = if n == 0 {
            format!("{}.{}", stem, ext)
        } else {
            format!("{}-{}.{}", stem, n, ext)
        };
        let path = dir.join(name);
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(mut file) => {
                file.write_all(bytes)
                    .with_context(|| format!("Failed to write {}", path.display()))?;
                return Ok(path);
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => n += 1,
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to create {}", path.display()))
            }
        }
    }
}

/// Save a downloaded result image for `url` into the output folder.
pub fn save_result_image(output_dir: &Path, url: &str, bytes: &[u8]) -> Result<PathBuf> {
    write_unique(
        output_dir,
        &timestamp_stem(Local::now()),
        extension_for_url(url),
        bytes,
    )
}

/// Save PNG bytes pasted from the clipboard as `clipboard_<unix>.png` in the
/// input folder so they can be used as a reference image.
pub fn save_clipboard_image(input_dir: &Path, png_bytes: &[u8]) -> Result<PathBuf> {
    let stem = format!("clipboard_{}", Local::now().timestamp());
    write_unique(input_dir, &stem, "png", png_bytes)
}
