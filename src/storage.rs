use anyhow::{anyhow, Result};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;

use crate::detect::BoundingBox;
use crate::{now_s, open_db_connection};

/// An uploaded source image.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ImageRecord {
    pub id: String,
    pub filename: String,
    pub filepath: String,
    pub content_type: String,
    pub size: u64,
    pub upload_time: u64,
    /// JSON array of the last detection result.
    pub predictions: Option<String>,
}

impl ImageRecord {
    /// Decode the stored detection result; empty when never predicted.
    pub fn prediction_boxes(&self) -> Result<Vec<BoundingBox>> {
        match &self.predictions {
            Some(json) => serde_json::from_str(json)
                .map_err(|e| anyhow!("corrupt predictions for image {}: {}", self.id, e)),
            None => Ok(Vec::new()),
        }
    }
}

/// A recorded violation.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ViolationRecord {
    pub id: i64,
    pub status: i64,
    #[serde(rename = "type")]
    pub violation_type: i64,
    pub plate_number: Option<String>,
    pub timestamp: u64,
    pub location: Option<String>,
    pub image_url: String,
    pub drone: Option<String>,
    pub image_id: String,
}

/// Fields supplied when a violation is created.
#[derive(Clone, Debug, PartialEq)]
pub struct NewViolation {
    pub image_id: String,
    pub violation_type: i64,
    pub image_url: String,
}

/// Persistence of images and violations.
pub trait ViolationStore: Send {
    fn insert_image(&mut self, image: &ImageRecord) -> Result<()>;

    fn get_image(&mut self, id: &str) -> Result<Option<ImageRecord>>;

    fn list_images(&mut self, skip: usize, limit: usize) -> Result<Vec<ImageRecord>>;

    fn count_images(&mut self) -> Result<usize>;

    /// Replace the stored detection result of an image.
    fn record_predictions(&mut self, image_id: &str, boxes: &[BoundingBox]) -> Result<()>;

    /// Insert a violation and return its id.
    fn record_violation(&mut self, violation: &NewViolation) -> Result<i64>;

    /// Violations, newest first.
    fn list_violations(&mut self, skip: usize, limit: usize) -> Result<Vec<ViolationRecord>>;

    fn count_violations(&mut self) -> Result<usize>;

    /// Delete an image and its violations. Returns false when absent.
    fn delete_image(&mut self, id: &str) -> Result<bool>;

    /// Remove every record.
    fn clear(&mut self) -> Result<()>;
}

pub struct SqliteViolationStore {
    conn: Connection,
}

impl SqliteViolationStore {
    pub fn open(db_path: &str) -> Result<Self> {
        let conn = open_db_connection(db_path)?;
        let mut store = Self { conn };
        store.ensure_schema()?;
        Ok(store)
    }

    fn ensure_schema(&mut self) -> Result<()> {
        self.conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;

            CREATE TABLE IF NOT EXISTS images (
              id TEXT PRIMARY KEY,
              filename TEXT NOT NULL,
              filepath TEXT NOT NULL,
              content_type TEXT NOT NULL,
              size INTEGER NOT NULL,
              upload_time INTEGER NOT NULL,
              predictions TEXT
            );

            CREATE TABLE IF NOT EXISTS violations (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              status INTEGER NOT NULL DEFAULT 0,
              type INTEGER NOT NULL,
              plate_number TEXT,
              timestamp INTEGER NOT NULL,
              location TEXT,
              image_url TEXT NOT NULL,
              drone TEXT,
              image_id TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_violations_timestamp ON violations(timestamp);
            CREATE INDEX IF NOT EXISTS idx_violations_image ON violations(image_id);
            "#,
        )?;
        Ok(())
    }
}

fn image_from_row(row: &Row<'_>) -> rusqlite::Result<ImageRecord> {
    let size: i64 = row.get(4)?;
    let upload_time: i64 = row.get(5)?;
    Ok(ImageRecord {
        id: row.get(0)?,
        filename: row.get(1)?,
        filepath: row.get(2)?,
        content_type: row.get(3)?,
        size: size.max(0) as u64,
        upload_time: upload_time.max(0) as u64,
        predictions: row.get(6)?,
    })
}

fn violation_from_row(row: &Row<'_>) -> rusqlite::Result<ViolationRecord> {
    let timestamp: i64 = row.get(4)?;
    Ok(ViolationRecord {
        id: row.get(0)?,
        status: row.get(1)?,
        violation_type: row.get(2)?,
        plate_number: row.get(3)?,
        timestamp: timestamp.max(0) as u64,
        location: row.get(5)?,
        image_url: row.get(6)?,
        drone: row.get(7)?,
        image_id: row.get(8)?,
    })
}

const IMAGE_COLUMNS: &str = "id, filename, filepath, content_type, size, upload_time, predictions";
const VIOLATION_COLUMNS: &str =
    "id, status, type, plate_number, timestamp, location, image_url, drone, image_id";

fn to_i64(value: u64, what: &str) -> Result<i64> {
    i64::try_from(value).map_err(|_| anyhow!("{} exceeds i64 range", what))
}

impl ViolationStore for SqliteViolationStore {
    fn insert_image(&mut self, image: &ImageRecord) -> Result<()> {
        self.conn.execute(
            r#"
            INSERT INTO images(id, filename, filepath, content_type, size, upload_time, predictions)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
            params![
                image.id,
                image.filename,
                image.filepath,
                image.content_type,
                to_i64(image.size, "image size")?,
                to_i64(image.upload_time, "upload time")?,
                image.predictions,
            ],
        )?;
        Ok(())
    }

    fn get_image(&mut self, id: &str) -> Result<Option<ImageRecord>> {
        let sql = format!("SELECT {} FROM images WHERE id = ?1", IMAGE_COLUMNS);
        let image = self
            .conn
            .query_row(&sql, params![id], image_from_row)
            .optional()?;
        Ok(image)
    }

    fn list_images(&mut self, skip: usize, limit: usize) -> Result<Vec<ImageRecord>> {
        let sql = format!(
            "SELECT {} FROM images ORDER BY upload_time ASC, rowid ASC LIMIT ?1 OFFSET ?2",
            IMAGE_COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![limit as i64, skip as i64], image_from_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    fn count_images(&mut self) -> Result<usize> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM images", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    fn record_predictions(&mut self, image_id: &str, boxes: &[BoundingBox]) -> Result<()> {
        let json = serde_json::to_string(boxes)?;
        let updated = self.conn.execute(
            "UPDATE images SET predictions = ?1 WHERE id = ?2",
            params![json, image_id],
        )?;
        if updated == 0 {
            return Err(anyhow!("image {} not found", image_id));
        }
        Ok(())
    }

    fn record_violation(&mut self, violation: &NewViolation) -> Result<i64> {
        let timestamp = to_i64(now_s()?, "timestamp")?;
        self.conn.execute(
            r#"
            INSERT INTO violations(status, type, timestamp, image_url, image_id)
            VALUES (0, ?1, ?2, ?3, ?4)
            "#,
            params![
                violation.violation_type,
                timestamp,
                violation.image_url,
                violation.image_id
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    fn list_violations(&mut self, skip: usize, limit: usize) -> Result<Vec<ViolationRecord>> {
        let sql = format!(
            "SELECT {} FROM violations ORDER BY timestamp DESC, id DESC LIMIT ?1 OFFSET ?2",
            VIOLATION_COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![limit as i64, skip as i64], violation_from_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    fn count_violations(&mut self) -> Result<usize> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM violations", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    fn delete_image(&mut self, id: &str) -> Result<bool> {
        let tx = self.conn.transaction()?;
        tx.execute("DELETE FROM violations WHERE image_id = ?1", params![id])?;
        let deleted = tx.execute("DELETE FROM images WHERE id = ?1", params![id])?;
        tx.commit()?;
        Ok(deleted > 0)
    }

    fn clear(&mut self) -> Result<()> {
        self.conn.execute_batch(
            r#"
            DELETE FROM violations;
            DELETE FROM images;
            "#,
        )?;
        Ok(())
    }
}

#[derive(Clone, Debug, Default)]
pub struct InMemoryViolationStore {
    images: Vec<ImageRecord>,
    violations: Vec<ViolationRecord>,
    next_violation_id: i64,
}

impl InMemoryViolationStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ViolationStore for InMemoryViolationStore {
    fn insert_image(&mut self, image: &ImageRecord) -> Result<()> {
        if self.images.iter().any(|existing| existing.id == image.id) {
            return Err(anyhow!("image {} already exists", image.id));
        }
        self.images.push(image.clone());
        Ok(())
    }

    fn get_image(&mut self, id: &str) -> Result<Option<ImageRecord>> {
        Ok(self.images.iter().find(|image| image.id == id).cloned())
    }

    fn list_images(&mut self, skip: usize, limit: usize) -> Result<Vec<ImageRecord>> {
        Ok(self.images.iter().skip(skip).take(limit).cloned().collect())
    }

    fn count_images(&mut self) -> Result<usize> {
        Ok(self.images.len())
    }

    fn record_predictions(&mut self, image_id: &str, boxes: &[BoundingBox]) -> Result<()> {
        let image = self
            .images
            .iter_mut()
            .find(|image| image.id == image_id)
            .ok_or_else(|| anyhow!("image {} not found", image_id))?;
        image.predictions = Some(serde_json::to_string(boxes)?);
        Ok(())
    }

    fn record_violation(&mut self, violation: &NewViolation) -> Result<i64> {
        self.next_violation_id += 1;
        let id = self.next_violation_id;
        self.violations.push(ViolationRecord {
            id,
            status: 0,
            violation_type: violation.violation_type,
            plate_number: None,
            timestamp: now_s()?,
            location: None,
            image_url: violation.image_url.clone(),
            drone: None,
            image_id: violation.image_id.clone(),
        });
        Ok(id)
    }

    fn list_violations(&mut self, skip: usize, limit: usize) -> Result<Vec<ViolationRecord>> {
        let mut sorted = self.violations.clone();
        sorted.sort_by(|a, b| b.timestamp.cmp(&a.timestamp).then(b.id.cmp(&a.id)));
        Ok(sorted.into_iter().skip(skip).take(limit).collect())
    }

    fn count_violations(&mut self) -> Result<usize> {
        Ok(self.violations.len())
    }

    fn delete_image(&mut self, id: &str) -> Result<bool> {
        self.violations.retain(|violation| violation.image_id != id);
        let before = self.images.len();
        self.images.retain(|image| image.id != id);
        Ok(self.images.len() != before)
    }

    fn clear(&mut self) -> Result<()> {
        self.images.clear();
        self.violations.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn image(id: &str, upload_time: u64) -> ImageRecord {
        ImageRecord {
            id: id.to_string(),
            filename: format!("{id}.jpg"),
            filepath: format!("images/{id}.jpg"),
            content_type: "image/jpeg".to_string(),
            size: 1234,
            upload_time,
            predictions: None,
        }
    }

    fn violation(image_id: &str, n: usize) -> NewViolation {
        NewViolation {
            image_id: image_id.to_string(),
            violation_type: 1,
            image_url: format!("http://localhost/cropped_images/{image_id}_violation_{n}.jpeg"),
        }
    }

    fn stores() -> Vec<Box<dyn ViolationStore>> {
        vec![
            Box::new(SqliteViolationStore::open(&crate::shared_memory_uri()).unwrap()),
            Box::new(InMemoryViolationStore::new()),
        ]
    }

    #[test]
    fn predictions_round_trip() {
        for mut store in stores() {
            store.insert_image(&image("a", 10)).unwrap();
            let boxes = vec![
                BoundingBox::new(100.25, 200.5, 61.125, 119.75, 0.8731, "driver"),
                BoundingBox::new(110.0, 105.0, 30.0, 28.5, 0.6612, "helmet"),
                BoundingBox::new(300.0, 300.0, 400.0, 200.0, 0.42, "motorcycle"),
            ];
            store.record_predictions("a", &boxes).unwrap();
            let loaded = store.get_image("a").unwrap().unwrap();
            let reloaded = loaded.prediction_boxes().unwrap();
            assert_eq!(reloaded.len(), boxes.len());
            for (got, want) in reloaded.iter().zip(&boxes) {
                assert_eq!(got.class_name, want.class_name);
                assert!((got.confidence - want.confidence).abs() < 1e-9);
                assert!((got.x - want.x).abs() < 1e-9);
                assert!((got.y - want.y).abs() < 1e-9);
                assert!((got.width - want.width).abs() < 1e-9);
                assert!((got.height - want.height).abs() < 1e-9);
            }
        }
    }

    #[test]
    fn predictions_for_unknown_image_fail() {
        for mut store in stores() {
            assert!(store.record_predictions("missing", &[]).is_err());
        }
    }

    #[test]
    fn violation_ids_increment_and_list_newest_first() {
        for mut store in stores() {
            store.insert_image(&image("a", 10)).unwrap();
            let first = store.record_violation(&violation("a", 0)).unwrap();
            let second = store.record_violation(&violation("a", 1)).unwrap();
            assert!(second > first);
            assert_eq!(store.count_violations().unwrap(), 2);

            let listed = store.list_violations(0, 10).unwrap();
            assert_eq!(listed[0].id, second);
            assert_eq!(listed[1].id, first);
            assert_eq!(listed[0].violation_type, 1);
            assert_eq!(listed[0].status, 0);
            assert!(listed[0].plate_number.is_none());
            assert!(listed[0].location.is_none());
            assert!(listed[0].drone.is_none());

            let page = store.list_violations(1, 10).unwrap();
            assert_eq!(page.len(), 1);
            assert_eq!(page[0].id, first);
        }
    }

    #[test]
    fn delete_cascades_to_violations() {
        for mut store in stores() {
            store.insert_image(&image("a", 10)).unwrap();
            store.insert_image(&image("b", 11)).unwrap();
            store.record_violation(&violation("a", 0)).unwrap();
            store.record_violation(&violation("b", 0)).unwrap();

            assert!(store.delete_image("a").unwrap());
            assert!(!store.delete_image("a").unwrap());
            assert!(store.get_image("a").unwrap().is_none());
            let remaining = store.list_violations(0, 10).unwrap();
            assert_eq!(remaining.len(), 1);
            assert_eq!(remaining[0].image_id, "b");
        }
    }

    #[test]
    fn list_and_count_images() {
        for mut store in stores() {
            for (i, id) in ["a", "b", "c"].iter().enumerate() {
                store.insert_image(&image(id, 10 + i as u64)).unwrap();
            }
            assert_eq!(store.count_images().unwrap(), 3);
            let page: Vec<String> = store
                .list_images(1, 5)
                .unwrap()
                .into_iter()
                .map(|i| i.id)
                .collect();
            assert_eq!(page, vec!["b", "c"]);

            store.clear().unwrap();
            assert_eq!(store.count_images().unwrap(), 0);
        }
    }

    #[test]
    fn sqlite_store_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("helmet.db");
        let db_path = db_path.to_string_lossy().to_string();
        {
            let mut store = SqliteViolationStore::open(&db_path).unwrap();
            store.insert_image(&image("a", 10)).unwrap();
            store.record_violation(&violation("a", 0)).unwrap();
        }
        let mut store = SqliteViolationStore::open(&db_path).unwrap();
        assert_eq!(store.get_image("a").unwrap().unwrap().size, 1234);
        assert_eq!(store.count_violations().unwrap(), 1);
    }
}
