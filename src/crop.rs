//! Crop rectangles and evidence image storage.
//!
//! A violation candidate is cut out of its source image with a fixed
//! `PADDING` on all four sides, clamped to the image bounds. A rectangle
//! that collapses after clamping is skipped rather than saved.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use image::{DynamicImage, GenericImageView, ImageFormat};

use crate::error::PipelineError;
use crate::pairing::Candidate;

/// Padding in pixels added to every edge of a driver box.
pub const PADDING: f64 = 50.0;

/// Public path segment under which crop files are served.
pub const PUBLIC_CROP_SEGMENT: &str = "cropped_images";

/// Rectangle in image pixel space, edges as `(left, top, right, bottom)`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CropRect {
    pub left: f64,
    pub top: f64,
    pub right: f64,
    pub bottom: f64,
}

impl CropRect {
    /// Padded rectangle around a center-based box, before clamping.
    pub fn padded(x: f64, y: f64, width: f64, height: f64) -> Self {
        Self {
            left: x - width / 2.0 - PADDING,
            top: y - height / 2.0 - PADDING,
            right: x + width / 2.0 + PADDING,
            bottom: y + height / 2.0 + PADDING,
        }
    }

    /// Clamp to `[0, width] x [0, height]`.
    pub fn clamp(self, width: u32, height: u32) -> Self {
        Self {
            left: self.left.max(0.0),
            top: self.top.max(0.0),
            right: self.right.min(f64::from(width)),
            bottom: self.bottom.min(f64::from(height)),
        }
    }

    pub fn is_degenerate(&self) -> bool {
        self.left >= self.right || self.top >= self.bottom
    }

    /// Whole-pixel `(x, y, width, height)` covering the rectangle.
    pub fn pixel_bounds(&self) -> (u32, u32, u32, u32) {
        let left = self.left.floor().max(0.0) as u32;
        let top = self.top.floor().max(0.0) as u32;
        let right = self.right.ceil().max(0.0) as u32;
        let bottom = self.bottom.ceil().max(0.0) as u32;
        (
            left,
            top,
            right.saturating_sub(left),
            bottom.saturating_sub(top),
        )
    }
}

/// One planned evidence crop.
#[derive(Clone, Debug, PartialEq)]
pub struct CropTask {
    pub candidate: Candidate,
    /// Clamped rectangle; may be degenerate.
    pub rect: CropRect,
    pub filename: String,
}

impl CropTask {
    pub fn plan(image_id: &str, candidate: &Candidate, width: u32, height: u32) -> Self {
        let d = &candidate.driver;
        let rect = CropRect::padded(d.x, d.y, d.width, d.height).clamp(width, height);
        Self {
            candidate: candidate.clone(),
            rect,
            filename: crop_filename(image_id, candidate.index),
        }
    }
}

/// `{image_id}_violation_{index}.jpeg`
pub fn crop_filename(image_id: &str, index: usize) -> String {
    format!("{}{}.jpeg", violation_prefix(image_id), index)
}

/// Filename prefix shared by every crop of one image.
pub fn violation_prefix(image_id: &str) -> String {
    format!("{}_violation_", image_id)
}

/// A decoded source image.
pub struct EvidenceImage {
    image: DynamicImage,
}

impl EvidenceImage {
    pub fn open(path: &Path) -> Result<Self, PipelineError> {
        if !path.exists() {
            return Err(PipelineError::ImageNotFound(path.display().to_string()));
        }
        let image = image::open(path)
            .map_err(|e| anyhow!("failed to decode image {}: {}", path.display(), e))?;
        Ok(Self { image })
    }

    pub fn from_image(image: DynamicImage) -> Self {
        Self { image }
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    /// Extract the sub-image under `rect`.
    pub fn crop(&self, rect: &CropRect) -> Result<DynamicImage> {
        if rect.is_degenerate() {
            return Err(anyhow!("degenerate crop rectangle {:?}", rect));
        }
        let (x, y, w, h) = rect.pixel_bounds();
        let (img_w, img_h) = self.image.dimensions();
        if w == 0 || h == 0 || x + w > img_w || y + h > img_h {
            return Err(anyhow!(
                "crop {}x{}+{}+{} outside {}x{} image",
                w,
                h,
                x,
                y,
                img_w,
                img_h
            ));
        }
        Ok(self.image.crop_imm(x, y, w, h))
    }
}

/// Destination for evidence crops.
pub trait CropStore {
    /// Save `crop` as JPEG under `filename`, replacing any existing file.
    fn save(&mut self, crop: &DynamicImage, filename: &str) -> Result<PathBuf>;

    fn remove(&mut self, filename: &str) -> Result<()>;

    /// Remove every crop whose filename starts with `prefix`.
    fn remove_with_prefix(&mut self, prefix: &str) -> Result<usize>;

    /// Public URL under which `filename` is served.
    fn public_url(&self, filename: &str) -> String;
}

/// Crop store on the local filesystem.
#[derive(Clone, Debug)]
pub struct FilesystemCropStore {
    root: PathBuf,
    base_url: String,
}

impl FilesystemCropStore {
    pub fn new(root: impl Into<PathBuf>, base_url: &str) -> Self {
        Self {
            root: root.into(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Read a stored crop.
    pub fn read(&self, filename: &str) -> Result<Vec<u8>> {
        let path = self.path_for(filename)?;
        fs::read(&path).with_context(|| format!("read crop {}", path.display()))
    }

    fn path_for(&self, filename: &str) -> Result<PathBuf> {
        let sanitized = sanitize_crop_filename(filename)?;
        Ok(self.root.join(sanitized))
    }
}

impl CropStore for FilesystemCropStore {
    fn save(&mut self, crop: &DynamicImage, filename: &str) -> Result<PathBuf> {
        let path = self.path_for(filename)?;
        fs::create_dir_all(&self.root)
            .with_context(|| format!("create crop dir {}", self.root.display()))?;
        DynamicImage::ImageRgb8(crop.to_rgb8())
            .save_with_format(&path, ImageFormat::Jpeg)
            .with_context(|| format!("write crop {}", path.display()))?;
        Ok(path)
    }

    fn remove(&mut self, filename: &str) -> Result<()> {
        let path = self.path_for(filename)?;
        if path.exists() {
            fs::remove_file(&path).with_context(|| format!("remove crop {}", path.display()))?;
        }
        Ok(())
    }

    fn remove_with_prefix(&mut self, prefix: &str) -> Result<usize> {
        if !self.root.exists() {
            return Ok(0);
        }
        let mut removed = 0;
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if name.starts_with(prefix) && entry.file_type()?.is_file() {
                fs::remove_file(entry.path())?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    fn public_url(&self, filename: &str) -> String {
        format!("{}/{}/{}", self.base_url, PUBLIC_CROP_SEGMENT, filename)
    }
}

fn sanitize_crop_filename(filename: &str) -> Result<&str> {
    if filename.is_empty()
        || filename.starts_with('.')
        || filename.contains(['/', '\\'])
        || filename.contains("..")
    {
        return Err(anyhow!("invalid crop filename '{}'", filename));
    }
    Ok(filename)
}
