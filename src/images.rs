//! Image upload, listing and deletion.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context};
use serde::Serialize;
use uuid::Uuid;

use crate::crop::{violation_prefix, CropStore};
use crate::error::PipelineError;
use crate::now_s;
use crate::storage::{ImageRecord, ViolationRecord, ViolationStore};

pub const DEFAULT_PAGE_SIZE: usize = 10;
pub const MAX_PAGE_SIZE: usize = 100;

/// A validated 1-based page request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PageRequest {
    pub page: usize,
    pub size: usize,
}

impl PageRequest {
    pub fn new(page: usize, size: usize) -> Result<Self, PipelineError> {
        if page < 1 {
            return Err(PipelineError::InvalidRequest(
                "page must be >= 1".to_string(),
            ));
        }
        if !(1..=MAX_PAGE_SIZE).contains(&size) {
            return Err(PipelineError::InvalidRequest(format!(
                "size must be between 1 and {}",
                MAX_PAGE_SIZE
            )));
        }
        // The offset is bound as an SQLite integer.
        let in_range = (page - 1)
            .checked_mul(size)
            .is_some_and(|skip| i64::try_from(skip).is_ok());
        if !in_range {
            return Err(PipelineError::InvalidRequest(format!(
                "page {} is out of range",
                page
            )));
        }
        Ok(Self { page, size })
    }

    pub fn skip(&self) -> usize {
        self.page.saturating_sub(1).saturating_mul(self.size)
    }
}

impl Default for PageRequest {
    fn default() -> Self {
        Self {
            page: 1,
            size: DEFAULT_PAGE_SIZE,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Page<T> {
    pub total: usize,
    pub items: Vec<T>,
    pub page: usize,
    pub size: usize,
    pub pages: usize,
}

impl<T> Page<T> {
    fn new(request: PageRequest, total: usize, items: Vec<T>) -> Self {
        Self {
            total,
            items,
            page: request.page,
            size: request.size,
            pages: total.div_ceil(request.size),
        }
    }
}

/// Manages uploaded source images on disk and in the store.
#[derive(Clone, Debug)]
pub struct ImageService {
    upload_dir: PathBuf,
}

impl ImageService {
    pub fn new(upload_dir: impl Into<PathBuf>) -> Self {
        Self {
            upload_dir: upload_dir.into(),
        }
    }

    pub fn upload_dir(&self) -> &Path {
        &self.upload_dir
    }

    /// Store an uploaded image under a fresh id.
    ///
    /// The file is removed again when the record cannot be inserted.
    pub fn upload(
        &self,
        store: &mut dyn ViolationStore,
        bytes: &[u8],
        original_filename: &str,
        content_type: &str,
    ) -> Result<ImageRecord, PipelineError> {
        if !content_type.starts_with("image/") {
            return Err(PipelineError::InvalidImageFormat(content_type.to_string()));
        }
        fs::create_dir_all(&self.upload_dir)
            .with_context(|| format!("create upload dir {}", self.upload_dir.display()))?;

        let id = Uuid::new_v4().to_string();
        let filename = format!("{}{}", id, extension_of(original_filename));
        let path = self.upload_dir.join(&filename);
        fs::write(&path, bytes).with_context(|| format!("write upload {}", path.display()))?;

        let record = ImageRecord {
            id,
            filename,
            filepath: path.display().to_string(),
            content_type: content_type.to_string(),
            size: bytes.len() as u64,
            upload_time: now_s()?,
            predictions: None,
        };
        if let Err(err) = store.insert_image(&record) {
            if let Err(remove_err) = fs::remove_file(&path) {
                log::error!(
                    "failed to remove upload {} after insert failure: {}",
                    path.display(),
                    remove_err
                );
            }
            return Err(anyhow!("failed to save image to database: {:#}", err).into());
        }
        log::info!(
            "uploaded image {} ({} bytes) as {}",
            record.id,
            record.size,
            record.filepath
        );
        Ok(record)
    }

    pub fn get_image(
        &self,
        store: &mut dyn ViolationStore,
        id: &str,
    ) -> Result<ImageRecord, PipelineError> {
        store
            .get_image(id)?
            .ok_or_else(|| PipelineError::ImageNotFound(id.to_string()))
    }

    pub fn list_images(
        &self,
        store: &mut dyn ViolationStore,
        request: PageRequest,
    ) -> Result<Page<ImageRecord>, PipelineError> {
        let items = store.list_images(request.skip(), request.size)?;
        let total = store.count_images()?;
        Ok(Page::new(request, total, items))
    }

    pub fn list_violations(
        &self,
        store: &mut dyn ViolationStore,
        request: PageRequest,
    ) -> Result<Page<ViolationRecord>, PipelineError> {
        let items = store.list_violations(request.skip(), request.size)?;
        let total = store.count_violations()?;
        Ok(Page::new(request, total, items))
    }

    /// Delete an image, its file, its crop files and its violations.
    pub fn delete_image(
        &self,
        store: &mut dyn ViolationStore,
        crops: &mut dyn CropStore,
        id: &str,
    ) -> Result<(), PipelineError> {
        let image = self.get_image(store, id)?;
        let source = Path::new(&image.filepath);
        if source.exists() {
            fs::remove_file(source)
                .with_context(|| format!("remove image {}", source.display()))?;
        }
        let removed = crops.remove_with_prefix(&violation_prefix(id))?;
        store.delete_image(id)?;
        log::info!("deleted image {} and {} crop files", id, removed);
        Ok(())
    }

    /// Drop every record and recreate empty upload and crop directories.
    pub fn cleanup(
        &self,
        store: &mut dyn ViolationStore,
        cropped_dir: &Path,
    ) -> Result<(), PipelineError> {
        store.clear()?;
        for dir in [self.upload_dir.as_path(), cropped_dir] {
            if dir.exists() {
                fs::remove_dir_all(dir).with_context(|| format!("remove {}", dir.display()))?;
            }
            fs::create_dir_all(dir).with_context(|| format!("create {}", dir.display()))?;
        }
        log::info!(
            "cleaned database and directories {} and {}",
            self.upload_dir.display(),
            cropped_dir.display()
        );
        Ok(())
    }
}

fn extension_of(filename: &str) -> String {
    Path::new(filename)
        .extension()
        .and_then(|ext| ext.to_str())
        .filter(|ext| ext.chars().all(|c| c.is_ascii_alphanumeric()))
        .map(|ext| format!(".{}", ext))
        .unwrap_or_default()
}
