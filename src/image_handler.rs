// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::fs;
use std::path::Path;

use log::{error, info, warn};

use interval_elements::image_trait::{ImageKind, ImageProcessorTrait, classify};

use crate::config::SessionConfig;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageDisposition {
    // Renamed (if fresh), thumbnailed as needed, pointer updated.
    Handled,
    // Cloud detector snapshot; only the pointer was updated.
    StatusImage,
    // The capture never materialized.
    Missing,
    // The data volume is full; the session must stop.
    DiskFull,
}

/// Processes one image returned by an acquisition step. The disk-full check
/// runs before anything else touches the image. Failures other than a full
/// disk are logged and absorbed.
pub fn handle_new_image(images: &dyn ImageProcessorTrait,
                        config: &SessionConfig,
                        data_path: &Path,
                        image: Option<&Path>) -> ImageDisposition {
    let Some(image) = image.filter(|i| i.is_file()) else {
        info!("argh-imgfile_not_exist, {}, {:?}", data_path.display(), image);
        return ImageDisposition::Missing;
    };
    info!("handle-image_starting, {}", image.display());
    match images.is_disk_full(data_path) {
        Ok(true) => {
            error!("disk-full_early-exit, {}", data_path.display());
            return ImageDisposition::DiskFull;
        },
        Ok(false) => (),
        Err(e) => warn!("disk_check_failed, {:?}", e),
    }
    let pointer = &config.internal.last_img_status_file;
    if classify(image) == ImageKind::StatusSnapshot {
        info!("handle-image_cloudy_and_clearing, {}", image.display());
        if let Err(e) = images.write_last_image_pointer(image, pointer) {
            warn!("pointer_write_failed, {:?}", e);
        }
        return ImageDisposition::StatusImage;
    }

    let renamed = match images.rename_raw(image) {
        Ok(renamed) => renamed,
        Err(e) => {
            warn!("rename_failed, {}, {:?}", image.display(), e);
            image.to_path_buf()
        },
    };
    let thumbnail = images.thumbnail_path(&renamed);
    let needs_thumbnail = match classify(&renamed) {
        ImageKind::LowResolution => !thumbnail.exists(),
        ImageKind::Raw => true,
        _ => false,
    };
    if needs_thumbnail {
        match images.make_thumbnail(&renamed) {
            Ok(thumb) => info!("making_thumb_for_cloudy, {}", thumb.display()),
            Err(e) => warn!("thumbnail_failed, {}, {:?}", renamed.display(), e),
        }
    }
    if let Err(e) = images.write_last_image_pointer(&renamed, pointer) {
        warn!("pointer_write_failed, {:?}", e);
    }
    let size = fs::metadata(&renamed).map(|m| m.len()).unwrap_or(0);
    info!("latest_image, {}, {}", renamed.display(), size);
    ImageDisposition::Handled
}

// mod tests.
