// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use canonical_error::{CanonicalError, failed_precondition_error,
                      internal_error, invalid_argument_error, not_found_error};
use chrono::{DateTime, Local};
use image::{DynamicImage, ImageFormat};
use log::{debug, warn};
use memchr::memmem;

use interval_elements::image_trait::{ImageKind, ImageProcessorTrait,
                                     THUMBNAIL_SUFFIX, classify};

// Bounding box of generated thumbnails; aspect ratio is preserved.
const THUMBNAIL_WIDTH: u32 = 1024;
const THUMBNAIL_HEIGHT: u32 = 768;

// Raw files carry several embedded JPEG previews; give up after this many
// candidate start markers.
const MAX_PREVIEW_CANDIDATES: usize = 16;

const JPEG_SOI: [u8; 3] = [0xFF, 0xD8, 0xFF];

fn io_error(what: &str, path: &Path, e: std::io::Error) -> CanonicalError {
    if e.kind() == std::io::ErrorKind::NotFound {
        not_found_error(format!("{} {:?}: {:?}", what, path, e).as_str())
    } else {
        failed_precondition_error(format!("{} {:?}: {:?}", what, path, e).as_str())
    }
}

fn modified(path: &Path) -> Result<SystemTime, CanonicalError> {
    fs::metadata(path).and_then(|m| m.modified())
        .map_err(|e| io_error("metadata", path, e))
}

// Files directly inside `dir`, in no particular order.
fn list_files(dir: &Path) -> Result<Vec<PathBuf>, CanonicalError> {
    let entries = fs::read_dir(dir).map_err(|e| io_error("read_dir", dir, e))?;
    let mut files = Vec::new();
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_file() {
            files.push(path);
        }
    }
    Ok(files)
}

// Sorts oldest first, breaking mtime ties by name.
fn sort_by_age(files: &mut Vec<PathBuf>) {
    let mut keyed: Vec<(SystemTime, PathBuf)> = files.drain(..).map(|f| {
        (modified(&f).unwrap_or(SystemTime::UNIX_EPOCH), f)
    }).collect();
    keyed.sort();
    files.extend(keyed.into_iter().map(|(_, f)| f));
}

fn is_capture(path: &Path) -> bool {
    matches!(classify(path), ImageKind::Raw | ImageKind::LowResolution)
}

/// Decodes the largest JPEG preview embedded in a raw file.
pub fn extract_preview(raw: &[u8]) -> Result<DynamicImage, CanonicalError> {
    let mut best: Option<DynamicImage> = None;
    for offset in memmem::find_iter(raw, &JPEG_SOI).take(MAX_PREVIEW_CANDIDATES) {
        let Ok(img) = image::load_from_memory_with_format(
            &raw[offset..], ImageFormat::Jpeg) else {
            continue;
        };
        let area = img.width() as u64 * img.height() as u64;
        if best.as_ref().map_or(true,
                                |b| area > b.width() as u64 * b.height() as u64) {
            best = Some(img);
        }
    }
    best.ok_or_else(|| invalid_argument_error("no embedded preview found"))
}

/// The station's image post-processor, operating on the local filesystem.
pub struct ImageFiles {
    station: String,
    disk_full_threshold: f64,
}

impl ImageFiles {
    pub fn new(station: &str, disk_full_threshold: f64) -> Self {
        ImageFiles{station: station.to_string(), disk_full_threshold}
    }

    fn prefix(&self) -> String {
        format!("{}_", self.station)
    }

    // New name for a fresh capture: station, capture time, original stem.
    fn renamed(&self, file: &Path) -> Result<PathBuf, CanonicalError> {
        let stem = file.file_stem().and_then(|s| s.to_str()).ok_or_else(
            || invalid_argument_error(format!("bad file name {:?}", file).as_str()))?;
        let ext = file.extension().and_then(|s| s.to_str()).unwrap_or("");
        let taken: DateTime<Local> = modified(file)?.into();
        let base = format!("{}{}_{}", self.prefix(),
                           taken.format("%Y-%m-%d_%H%M%S"), stem);
        let mut candidate = file.with_file_name(format!("{}.{}", base, ext));
        let mut n = 1;
        while candidate.exists() {
            candidate = file.with_file_name(format!("{}-{}.{}", base, n, ext));
            n += 1;
        }
        Ok(candidate)
    }
}

impl ImageProcessorTrait for ImageFiles {
    fn is_fresh_capture(&self, path: &Path) -> bool {
        if !is_capture(path) {
            return false;
        }
        match path.file_name().and_then(|n| n.to_str()) {
            Some(name) => !name.starts_with(&self.prefix()),
            None => false,
        }
    }

    fn rename_raw(&self, file: &Path) -> Result<PathBuf, CanonicalError> {
        if !file.exists() {
            return Err(not_found_error(format!("{:?}", file).as_str()));
        }
        if !self.is_fresh_capture(file) {
            return Ok(file.to_path_buf());
        }
        let target = self.renamed(file)?;
        fs::rename(file, &target).map_err(|e| io_error("rename", file, e))?;
        debug!("renamed, {}, {}", file.display(), target.display());
        Ok(target)
    }

    fn rename_raw_all(&self, dir: &Path) -> Result<Vec<PathBuf>, CanonicalError> {
        let mut fresh: Vec<PathBuf> = list_files(dir)?.into_iter()
            .filter(|f| self.is_fresh_capture(f))
            .collect();
        sort_by_age(&mut fresh);
        let mut renamed = Vec::with_capacity(fresh.len());
        for file in fresh {
            match self.rename_raw(&file) {
                Ok(path) => renamed.push(path),
                // The tether may still be writing it; the next pass gets it.
                Err(e) => warn!("rename_failed, {}, {:?}", file.display(), e),
            }
        }
        Ok(renamed)
    }

    fn thumbnail_path(&self, file: &Path) -> PathBuf {
        let stem = file.file_stem().and_then(|s| s.to_str()).unwrap_or("image");
        file.with_file_name(format!("{}{}", stem, THUMBNAIL_SUFFIX))
    }

    fn make_thumbnail(&self, file: &Path) -> Result<PathBuf, CanonicalError> {
        let kind = classify(file);
        if kind == ImageKind::Thumbnail {
            return Ok(file.to_path_buf());
        }
        let bytes = fs::read(file).map_err(|e| io_error("read", file, e))?;
        let img = match kind {
            ImageKind::Raw => extract_preview(&bytes)?,
            _ => image::load_from_memory(&bytes).map_err(|e| invalid_argument_error(
                format!("decode {:?}: {:?}", file, e).as_str()))?,
        };
        let img = if img.width() > THUMBNAIL_WIDTH || img.height() > THUMBNAIL_HEIGHT {
            img.thumbnail(THUMBNAIL_WIDTH, THUMBNAIL_HEIGHT)
        } else {
            img
        };
        let thumb = img.to_rgb8();
        let path = self.thumbnail_path(file);
        thumb.save_with_format(&path, ImageFormat::Jpeg).map_err(|e| {
            internal_error(format!("save {:?}: {:?}", path, e).as_str())
        })?;
        Ok(path)
    }

    fn make_all_thumbnails(&self, dir: &Path, images: Option<&[PathBuf]>)
                           -> Result<Vec<PathBuf>, CanonicalError> {
        let candidates: Vec<PathBuf> = match images {
            Some(images) => images.to_vec(),
            None => {
                let mut files: Vec<PathBuf> = list_files(dir)?.into_iter()
                    .filter(|f| is_capture(f) && !self.thumbnail_path(f).exists())
                    .collect();
                files.sort();
                files
            },
        };
        let mut thumbnails = Vec::new();
        for file in candidates {
            match self.make_thumbnail(&file) {
                Ok(thumb) => thumbnails.push(thumb),
                Err(e) => warn!("thumbnail_failed, {}, {:?}", file.display(), e),
            }
        }
        Ok(thumbnails)
    }

    fn latest_image(&self, dir: &Path) -> Result<Option<PathBuf>, CanonicalError> {
        let mut captures: Vec<PathBuf> = list_files(dir)?.into_iter()
            .filter(|f| is_capture(f))
            .collect();
        sort_by_age(&mut captures);
        Ok(captures.pop())
    }

    fn raw_images(&self, dir: &Path) -> Result<Vec<PathBuf>, CanonicalError> {
        let mut raws: Vec<PathBuf> = list_files(dir)?.into_iter()
            .filter(|f| classify(f) == ImageKind::Raw)
            .collect();
        sort_by_age(&mut raws);
        Ok(raws)
    }

    fn shutter_count(&self, file: &Path) -> Option<u64> {
        let stem = file.file_stem()?.to_str()?;
        // A collision suffix ("-1") is not part of the camera's counter.
        let stem = match stem.rsplit_once('-') {
            Some((head, tail)) if tail.chars().all(|c| c.is_ascii_digit()) => head,
            _ => stem,
        };
        let digits: String = stem.chars().rev()
            .take_while(|c| c.is_ascii_digit())
            .collect::<Vec<_>>().into_iter().rev().collect();
        digits.parse().ok()
    }

    fn write_last_image_pointer(&self, file: &Path, pointer: &Path)
                                -> Result<(), CanonicalError> {
        let tmp = pointer.with_extension("tmp");
        let mut f = fs::File::create(&tmp).map_err(|e| io_error("create", &tmp, e))?;
        writeln!(f, "{}", file.display()).map_err(|e| io_error("write", &tmp, e))?;
        drop(f);
        fs::rename(&tmp, pointer).map_err(|e| io_error("rename", pointer, e))
    }

    fn disk_usage(&self, dir: &Path) -> Result<u64, CanonicalError> {
        let entries = fs::read_dir(dir).map_err(|e| io_error("read_dir", dir, e))?;
        let mut total = 0;
        for entry in entries.flatten() {
            let Ok(file_type) = entry.file_type() else { continue };
            if file_type.is_dir() {
                total += self.disk_usage(&entry.path())?;
            } else if file_type.is_file() {
                total += entry.metadata().map(|m| m.len()).unwrap_or(0);
            }
        }
        Ok(total)
    }

    fn is_disk_full(&self, dir: &Path) -> Result<bool, CanonicalError> {
        let stats = nix::sys::statvfs::statvfs(dir).map_err(|e| {
            failed_precondition_error(format!("statvfs {:?}: {}", dir, e).as_str())
        })?;
        let blocks = stats.blocks() as f64;
        if blocks == 0.0 {
            return Ok(false);
        }
        let used = 1.0 - stats.blocks_available() as f64 / blocks;
        Ok(used >= self.disk_full_threshold)
    }
}

#[cfg(test)]
mod tests {
    use std::thread::sleep;
    use std::time::Duration;

    use tempfile::TempDir;

    use crate::testing::{fake_raw_bytes, jpeg_bytes};
    use super::*;

    #[test]
    fn test_rename_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let files = ImageFiles::new("DFNSMALL36", 0.95);
        fs::write(dir.path().join("capt0001.nef"), fake_raw_bytes()).unwrap();
        sleep(Duration::from_millis(10));
        fs::write(dir.path().join("capt0002.nef"), fake_raw_bytes()).unwrap();
        fs::write(dir.path().join("notes.txt"), "x").unwrap();

        let renamed = files.rename_raw_all(dir.path()).unwrap();
        assert_eq!(renamed.len(), 2);
        let name = renamed[1].file_name().unwrap().to_str().unwrap();
        assert!(name.starts_with("DFNSMALL36_"), "{}", name);
        assert!(name.ends_with("_capt0002.nef"), "{}", name);
        assert!(!files.is_fresh_capture(&renamed[0]));

        // Second pass finds nothing new.
        assert!(files.rename_raw_all(dir.path()).unwrap().is_empty());
        assert_eq!(files.rename_raw(&renamed[0]).unwrap(), renamed[0]);
        assert!(files.rename_raw(&dir.path().join("gone.nef")).is_err());
    }

    #[test]
    fn test_thumbnails() {
        let dir = TempDir::new().unwrap();
        let files = ImageFiles::new("S", 0.95);
        let raw = dir.path().join("capt0003.nef");
        fs::write(&raw, fake_raw_bytes()).unwrap();
        let jpg = dir.path().join("capt0004.jpg");
        fs::write(&jpg, jpeg_bytes(64, 48)).unwrap();

        let thumb = files.make_thumbnail(&raw).unwrap();
        assert_eq!(thumb, dir.path().join("capt0003.thumb.jpg"));
        let decoded = image::open(&thumb).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (64, 48));
        assert_eq!(files.make_thumbnail(&thumb).unwrap(), thumb);

        // Only the JPEG still lacks a thumbnail.
        let made = files.make_all_thumbnails(dir.path(), None).unwrap();
        assert_eq!(made, vec![dir.path().join("capt0004.thumb.jpg")]);

        let junk = dir.path().join("junk.nef");
        fs::write(&junk, b"not an image").unwrap();
        assert!(files.make_thumbnail(&junk).is_err());
        let made = files.make_all_thumbnails(dir.path(), Some(&[junk])).unwrap();
        assert!(made.is_empty());
    }

    #[test]
    fn test_latest_and_pointer() {
        let dir = TempDir::new().unwrap();
        let files = ImageFiles::new("S", 0.95);
        assert_eq!(files.latest_image(dir.path()).unwrap(), None);
        fs::write(dir.path().join("a.nef"), b"1").unwrap();
        sleep(Duration::from_millis(10));
        fs::write(dir.path().join("b.jpg"), b"2").unwrap();
        fs::write(dir.path().join("b.thumb.jpg"), b"3").unwrap();
        let latest = files.latest_image(dir.path()).unwrap().unwrap();
        assert_eq!(latest, dir.path().join("b.jpg"));
        assert_eq!(files.raw_images(dir.path()).unwrap(),
                   vec![dir.path().join("a.nef")]);

        let pointer = dir.path().join("last_image.txt");
        files.write_last_image_pointer(&latest, &pointer).unwrap();
        assert_eq!(fs::read_to_string(&pointer).unwrap(),
                   format!("{}\n", latest.display()));
        assert_eq!(files.disk_usage(dir.path()).unwrap(),
                   3 + latest.display().to_string().len() as u64 + 1);
    }

    #[test]
    fn test_shutter_count() {
        let files = ImageFiles::new("S", 0.95);
        assert_eq!(files.shutter_count(
            Path::new("/d/S_2024-06-21_203000_capt0042.nef")), Some(42));
        assert_eq!(files.shutter_count(
            Path::new("/d/S_2024-06-21_203000_DSC_1234-1.nef")), Some(1234));
        assert_eq!(files.shutter_count(Path::new("/d/S_x_capture.nef")), None);
    }

    #[test]
    fn test_disk_full_threshold() {
        let dir = TempDir::new().unwrap();
        assert!(!ImageFiles::new("S", 1.0).is_disk_full(dir.path()).unwrap());
        assert!(ImageFiles::new("S", 0.0).is_disk_full(dir.path()).unwrap());
        assert!(ImageFiles::new("S", 0.5)
                .is_disk_full(&dir.path().join("missing")).is_err());
    }

}  // mod tests.
