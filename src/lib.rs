//! Helmet Witness
//!
//! This crate implements the detection-to-violation pipeline for helmet
//! enforcement on photographs of motorcyclists.
//!
//! # Architecture
//!
//! One prediction request runs three sequential stages:
//!
//! 1. **Detection**: the image is sent to a `Detector` (hosted inference
//!    endpoint or stub) and parsed into `BoundingBox` values.
//! 2. **Pairing**: every `driver` box is matched against the nearest `helmet`
//!    box; drivers without a helmet closer than `MATCH_RADIUS` become
//!    violation candidates.
//! 3. **Emission**: each candidate is cropped (padded and clamped), saved as
//!    evidence, and recorded as a violation. Failures are contained per item.
//!
//! # Module Structure
//!
//! - `detect`: detector trait, hosted and stub backends, box types
//! - `pairing`: nearest-helmet matching
//! - `crop`: crop rectangles, evidence images, crop file storage
//! - `emit`: per-candidate crop and record emission
//! - `pipeline`: the per-request state machine
//! - `storage`: image and violation persistence (SQLite, in-memory)
//! - `images`: upload, listing, deletion cascade
//! - `config`, `api`: service configuration and HTTP surface

use anyhow::Result;
use rand::RngCore;
use rusqlite::{Connection, OpenFlags};
use std::time::{SystemTime, UNIX_EPOCH};

pub mod api;
pub mod config;
pub mod crop;
pub mod detect;
pub mod emit;
pub mod error;
pub mod images;
pub mod pairing;
pub mod pipeline;
pub mod storage;

pub use crop::{CropRect, CropStore, CropTask, EvidenceImage, FilesystemCropStore, PADDING};
pub use detect::{BoundingBox, Detector, HttpDetector, StubDetector};
pub use emit::{emit, CropOutcome, EmitReport, NO_HELMET_VIOLATION};
pub use error::PipelineError;
pub use images::{ImageService, Page, PageRequest};
pub use pairing::{pair, Candidate, MATCH_RADIUS};
pub use pipeline::{PipelineStage, PredictionReport, PredictionService};
pub use storage::{
    ImageRecord, InMemoryViolationStore, NewViolation, SqliteViolationStore, ViolationRecord,
    ViolationStore,
};

/// Returns a URI for a private, shared-cache SQLite in-memory database.
pub fn shared_memory_uri() -> String {
    let mut bytes = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut bytes);
    format!(
        "file:helmet_witness_{:x}?mode=memory&cache=shared",
        u64::from_le_bytes(bytes)
    )
}

pub(crate) fn open_db_connection(db_path: &str) -> Result<Connection> {
    if db_path.starts_with("file:") {
        return Ok(Connection::open_with_flags(
            db_path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_URI,
        )?);
    }
    Ok(Connection::open(db_path)?)
}

pub(crate) fn now_s() -> Result<u64> {
    Ok(SystemTime::now().duration_since(UNIX_EPOCH)?.as_secs())
}
