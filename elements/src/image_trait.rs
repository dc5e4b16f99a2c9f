// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::path::{Path, PathBuf};

use canonical_error::CanonicalError;

// File name markers of the cloud detector's own snapshots.
pub const STATUS_IMAGE_MARKERS: [&str; 2] = ["cloudy_img", "clearing"];

// Suffix of generated thumbnails.
pub const THUMBNAIL_SUFFIX: &str = ".thumb.jpg";

const RAW_EXTENSIONS: [&str; 4] = ["nef", "cr2", "cr3", "arw"];
const LOW_RES_EXTENSIONS: [&str; 2] = ["jpg", "jpeg"];

/// What a file in the data directory is, judged from its name alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageKind {
    // Snapshot written by the cloud detector, not a capture.
    StatusSnapshot,
    Thumbnail,
    // JPEG capture (twilight class).
    LowResolution,
    // Raw capture (night class).
    Raw,
    Other,
}

pub fn classify(path: &Path) -> ImageKind {
    let name = match path.file_name().and_then(|n| n.to_str()) {
        Some(n) => n.to_ascii_lowercase(),
        None => return ImageKind::Other,
    };
    if STATUS_IMAGE_MARKERS.iter().any(|m| name.contains(m)) {
        return ImageKind::StatusSnapshot;
    }
    if name.ends_with(THUMBNAIL_SUFFIX) {
        return ImageKind::Thumbnail;
    }
    let ext = match name.rsplit_once('.') {
        Some((_, ext)) => ext,
        None => return ImageKind::Other,
    };
    if RAW_EXTENSIONS.contains(&ext) {
        ImageKind::Raw
    } else if LOW_RES_EXTENSIONS.contains(&ext) {
        ImageKind::LowResolution
    } else {
        ImageKind::Other
    }
}

// Renaming, thumbnailing and disk bookkeeping for captured images.
//
// Renaming is what makes repeated directory scans idempotent: a renamed
// file no longer looks like a fresh capture, so no "seen" set is needed.
pub trait ImageProcessorTrait: Send + Sync {
    /// True for a capture that has not been renamed yet.
    fn is_fresh_capture(&self, path: &Path) -> bool;

    /// Renames one capture to the station naming convention. A file that is
    /// not a fresh capture is returned unchanged.
    fn rename_raw(&self, file: &Path) -> Result<PathBuf, CanonicalError>;

    /// Renames every fresh capture in `dir`, oldest first. Returns the new
    /// paths.
    fn rename_raw_all(&self, dir: &Path) -> Result<Vec<PathBuf>, CanonicalError>;

    fn thumbnail_path(&self, file: &Path) -> PathBuf;

    fn make_thumbnail(&self, file: &Path) -> Result<PathBuf, CanonicalError>;

    /// Thumbnails the given images, or every image in `dir` lacking one when
    /// `images` is None. Failures on individual files are skipped.
    fn make_all_thumbnails(&self, dir: &Path, images: Option<&[PathBuf]>)
                           -> Result<Vec<PathBuf>, CanonicalError>;

    /// The most recently modified capture in `dir`, if any.
    fn latest_image(&self, dir: &Path) -> Result<Option<PathBuf>, CanonicalError>;

    /// Raw captures in `dir`.
    fn raw_images(&self, dir: &Path) -> Result<Vec<PathBuf>, CanonicalError>;

    /// Camera frame counter recorded in a renamed capture's name.
    fn shutter_count(&self, file: &Path) -> Option<u64>;

    fn write_last_image_pointer(&self, file: &Path, pointer: &Path)
                                -> Result<(), CanonicalError>;

    /// Bytes used by the files under `dir`.
    fn disk_usage(&self, dir: &Path) -> Result<u64, CanonicalError>;

    /// True once the volume holding `dir` is at or past its full threshold.
    fn is_disk_full(&self, dir: &Path) -> Result<bool, CanonicalError>;
}

// mod tests.
