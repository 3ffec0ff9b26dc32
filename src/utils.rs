use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::JobError;

/// Extensions treated as video containers.
pub const VIDEO_EXTENSIONS: &[&str] = &[
    "mp4", "mkv", "mov", "avi", "webm", "m4v", "flv", "wmv", "ts", "m2ts", "mpg", "mpeg", "3gp",
];

/// Extensions picked up when the input is a directory.
pub const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "bmp", "tif", "tiff", "webp"];

fn has_extension(path: &Path, list: &[&str]) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| list.iter().any(|known| known.eq_ignore_ascii_case(ext)))
        .unwrap_or(false)
}

pub fn is_video_path(path: &Path) -> bool {
    has_extension(path, VIDEO_EXTENSIONS)
}

pub fn is_image_path(path: &Path) -> bool {
    has_extension(path, IMAGE_EXTENSIONS)
}

/// Image files directly inside `dir`, sorted by path.
pub fn list_images(dir: &Path) -> Result<Vec<PathBuf>, JobError> {
    let mut images = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_file() && is_image_path(&path) {
            images.push(path);
        }
    }
    images.sort();
    debug!(dir = %dir.display(), count = images.len(), "Listed input images");
    Ok(images)
}

/// Output file suffix, e.g. `2x_mymodel`.
///
/// A model name that already carries its scale (`2x_...`) is used as is.
pub fn output_suffix(scale: u32, model_name: &str, custom: Option<&str>) -> String {
    let prefix = format!("{scale}x_");
    match custom {
        Some(custom) => format!("{prefix}{custom}"),
        None if model_name.contains(&prefix) => model_name.to_string(),
        None => format!("{prefix}{model_name}"),
    }
}

/// `W:H` or `WxH`.
pub fn parse_resolution(s: &str) -> Result<(u32, u32), JobError> {
    let bad = || JobError::Resolution(s.to_string());
    let (w, h) = s
        .split_once(':')
        .or_else(|| s.split_once(['x', 'X']))
        .ok_or_else(bad)?;
    let width: u32 = w.trim().parse().map_err(|_| bad())?;
    let height: u32 = h.trim().parse().map_err(|_| bad())?;
    if width == 0 || height == 0 {
        return Err(bad());
    }
    Ok((width, height))
}

/// File name without its extension, for output naming.
pub fn file_stem(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default()
}
