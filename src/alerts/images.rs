// =============================================================================
// Alert Image Collection — random image per alert
// =============================================================================
//
// Images live in a flat `images/` directory next to the binary. Every alert
// picks a random member; the configured `image_path` acts as a fallback
// when the directory is empty. Gif and mp4 files are sent as animations.
// =============================================================================

use std::path::{Path, PathBuf};

use rand::seq::SliceRandom;
use tracing::{debug, warn};

/// Directory scanned for alert images.
pub const IMAGES_DIR: &str = "images";

const SUPPORTED_EXTENSIONS: [&str; 6] = ["png", "jpg", "jpeg", "gif", "mp4", "webp"];

/// Whether a file should be delivered as a Telegram animation rather than
/// a photo.
pub fn is_animation(path: &Path) -> bool {
    matches!(
        path.extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .as_deref(),
        Some("gif") | Some("mp4")
    )
}

/// Scans a directory of alert images and picks one at random per alert.
pub struct ImageCollection {
    dir: PathBuf,
    fallback: PathBuf,
}

impl ImageCollection {
    /// Create the collection, ensuring `dir` exists so operators can drop
    /// images in while the bot runs.
    pub fn new(dir: impl Into<PathBuf>, fallback: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        if let Err(e) = std::fs::create_dir_all(&dir) {
            warn!(dir = %dir.display(), error = %e, "could not create images directory");
        }
        Self {
            dir,
            fallback: fallback.into(),
        }
    }

    /// All supported images in the directory, sorted for stable listings.
    pub fn collection(&self) -> Vec<PathBuf> {
        let Ok(entries) = std::fs::read_dir(&self.dir) else {
            return Vec::new();
        };

        let mut images: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| {
                path.is_file()
                    && path
                        .extension()
                        .and_then(|e| e.to_str())
                        .map(|e| {
                            SUPPORTED_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str())
                        })
                        .unwrap_or(false)
            })
            .collect();
        images.sort();
        images
    }

    /// Number of images available (debug surface).
    pub fn count(&self) -> usize {
        self.collection().len()
    }

    /// Random member of the collection, the configured fallback when the
    /// directory is empty, or nothing when neither exists.
    pub fn pick_random(&self) -> Option<PathBuf> {
        let images = self.collection();
        if let Some(choice) = images.choose(&mut rand::thread_rng()) {
            debug!(image = %choice.display(), "selected alert image");
            return Some(choice.clone());
        }
        if self.fallback.is_file() {
            debug!(image = %self.fallback.display(), "using fallback alert image");
            return Some(self.fallback.clone());
        }
        None
    }
}
