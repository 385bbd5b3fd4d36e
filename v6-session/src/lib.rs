//! Per-session scratch directory and Parquet dataframe/state-log I/O.
//!
//! Layout: `<data-root>/sessions/session<09d>/`, containing one
//! `session_state.parquet` append-only log plus one `<handle>.parquet`
//! per dataframe the session holds.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use arrow::array::{RecordBatch, StringArray};
use arrow::datatypes::{DataType, Field, Schema};
use chrono::Utc;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("parquet error: {0}")]
    Parquet(#[from] parquet::errors::ParquetError),
    #[error("arrow error: {0}")]
    Arrow(#[from] arrow::error::ArrowError),
}

fn state_schema() -> Arc<Schema> {
    Arc::new(Schema::new(vec![
        Field::new("action", DataType::Utf8, false),
        Field::new("file", DataType::Utf8, false),
        Field::new("timestamp", DataType::Utf8, false),
        Field::new("message", DataType::Utf8, false),
        Field::new("dataframe", DataType::Utf8, true),
    ]))
}

#[derive(Debug, Clone)]
pub struct StateEvent {
    pub action: String,
    pub file: String,
    pub timestamp: String,
    pub message: String,
    pub dataframe: Option<String>,
}

pub struct SessionFileManager {
    dir: PathBuf,
}

impl SessionFileManager {
    /// Opens (creating if absent) the scratch directory for `session_id`
    /// under `data_root`, seeding `session_state.parquet` if this is a
    /// new session.
    pub fn open(data_root: &Path, session_id: u64) -> Result<Self, SessionError> {
        let dir = data_root
            .join("sessions")
            .join(format!("session{session_id:09}"));
        fs::create_dir_all(&dir)?;
        let manager = SessionFileManager { dir };
        if !manager.state_path().exists() {
            manager.write_state_rows(&[StateEvent {
                action: "create".to_string(),
                file: "session_state.parquet".to_string(),
                timestamp: Utc::now().to_rfc3339(),
                message: "session created".to_string(),
                dataframe: None,
            }])?;
        }
        Ok(manager)
    }

    fn state_path(&self) -> PathBuf {
        self.dir.join("session_state.parquet")
    }

    fn dataframe_path(&self, handle: &str) -> PathBuf {
        self.dir.join(format!("{handle}.parquet"))
    }

    /// Atomically write `batch` to `<handle>.parquet` (write to a `.tmp`
    /// sibling, then rename) and append a `write` event to the state log.
    pub fn write_dataframe(&self, handle: &str, batch: &RecordBatch) -> Result<(), SessionError> {
        let final_path = self.dataframe_path(handle);
        let tmp_path = self.dir.join(format!("{handle}.parquet.tmp"));

        let file = fs::File::create(&tmp_path)?;
        let mut writer = ArrowWriter::try_new(file, batch.schema(), None)?;
        writer.write(batch)?;
        writer.close()?;
        fs::rename(&tmp_path, &final_path)?;

        self.append_state_event(
            "write",
            &format!("{handle}.parquet"),
            "dataframe written",
            Some(handle),
        )
    }

    /// Adopt a Parquet file already written elsewhere (e.g. by an
    /// algorithm container into a mounted scratch path) as `<handle>.parquet`,
    /// via the same tmp-then-rename sequence as [`Self::write_dataframe`].
    pub fn ingest_dataframe_file(&self, handle: &str, produced_path: &Path) -> Result<(), SessionError> {
        let final_path = self.dataframe_path(handle);
        fs::copy(produced_path, &final_path)?;
        self.append_state_event(
            "write",
            &format!("{handle}.parquet"),
            "dataframe ingested from container output",
            Some(handle),
        )
    }

    pub fn read_dataframe(&self, handle: &str) -> Result<Vec<RecordBatch>, SessionError> {
        let file = fs::File::open(self.dataframe_path(handle))?;
        let reader = ParquetRecordBatchReaderBuilder::try_new(file)?.build()?;
        let mut batches = Vec::new();
        for batch in reader {
            batches.push(batch?);
        }
        Ok(batches)
    }

    /// Remove `<handle>.parquet` if present; a missing file is logged,
    /// not treated as an error.
    pub fn delete_dataframe(&self, handle: &str) -> Result<(), SessionError> {
        let path = self.dataframe_path(handle);
        if path.exists() {
            fs::remove_file(&path)?;
        } else {
            log::warn!("delete_dataframe: {handle}.parquet was already absent");
        }
        self.append_state_event(
            "delete",
            &format!("{handle}.parquet"),
            "dataframe deleted",
            Some(handle),
        )
    }

    pub fn append_state_event(
        &self,
        action: &str,
        file: &str,
        message: &str,
        dataframe: Option<&str>,
    ) -> Result<(), SessionError> {
        let mut rows = if self.state_path().exists() {
            self.read_state()?
        } else {
            Vec::new()
        };
        rows.push(StateEvent {
            action: action.to_string(),
            file: file.to_string(),
            timestamp: Utc::now().to_rfc3339(),
            message: message.to_string(),
            dataframe: dataframe.map(|s| s.to_string()),
        });
        self.write_state_rows(&rows)
    }

    pub fn read_state(&self) -> Result<Vec<StateEvent>, SessionError> {
        let file = fs::File::open(self.state_path())?;
        let reader = ParquetRecordBatchReaderBuilder::try_new(file)?.build()?;
        let mut rows = Vec::new();
        for batch in reader {
            let batch = batch?;
            let action = column_as_strings(&batch, 0);
            let file_col = column_as_strings(&batch, 1);
            let timestamp = column_as_strings(&batch, 2);
            let message = column_as_strings(&batch, 3);
            let dataframe = column_as_strings(&batch, 4);
            for i in 0..batch.num_rows() {
                rows.push(StateEvent {
                    action: action[i].clone(),
                    file: file_col[i].clone(),
                    timestamp: timestamp[i].clone(),
                    message: message[i].clone(),
                    dataframe: if dataframe[i].is_empty() {
                        None
                    } else {
                        Some(dataframe[i].clone())
                    },
                });
            }
        }
        Ok(rows)
    }

    fn write_state_rows(&self, rows: &[StateEvent]) -> Result<(), SessionError> {
        let schema = state_schema();
        let action = StringArray::from(rows.iter().map(|r| r.action.as_str()).collect::<Vec<_>>());
        let file = StringArray::from(rows.iter().map(|r| r.file.as_str()).collect::<Vec<_>>());
        let timestamp =
            StringArray::from(rows.iter().map(|r| r.timestamp.as_str()).collect::<Vec<_>>());
        let message =
            StringArray::from(rows.iter().map(|r| r.message.as_str()).collect::<Vec<_>>());
        let dataframe = StringArray::from(
            rows.iter()
                .map(|r| r.dataframe.as_deref())
                .collect::<Vec<_>>(),
        );

        let batch = RecordBatch::try_new(
            schema.clone(),
            vec![
                Arc::new(action),
                Arc::new(file),
                Arc::new(timestamp),
                Arc::new(message),
                Arc::new(dataframe),
            ],
        )?;

        let tmp_path = self.dir.join("session_state.parquet.tmp");
        let out = fs::File::create(&tmp_path)?;
        let mut writer = ArrowWriter::try_new(out, schema, None)?;
        writer.write(&batch)?;
        writer.close()?;
        fs::rename(&tmp_path, self.state_path())?;
        Ok(())
    }
}

fn column_as_strings(batch: &RecordBatch, idx: usize) -> Vec<String> {
    let array = batch
        .column(idx)
        .as_any()
        .downcast_ref::<StringArray>()
        .expect("session state columns are all Utf8");
    (0..array.len())
        .map(|i| {
            if array.is_null(i) {
                String::new()
            } else {
                array.value(i).to_string()
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::Int64Array;
    use tempfile::tempdir;

    #[test]
    fn seeds_one_row_on_creation() {
        let dir = tempdir().unwrap();
        let manager = SessionFileManager::open(dir.path(), 1).unwrap();
        let rows = manager.read_state().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].action, "create");
    }

    #[test]
    fn appending_n_events_yields_n_plus_one_rows() {
        let dir = tempdir().unwrap();
        let manager = SessionFileManager::open(dir.path(), 2).unwrap();
        for i in 0..5 {
            manager
                .append_state_event("note", "x", &format!("event {i}"), None)
                .unwrap();
        }
        let rows = manager.read_state().unwrap();
        assert_eq!(rows.len(), 6);
    }

    #[test]
    fn write_then_read_dataframe_round_trips() {
        let dir = tempdir().unwrap();
        let manager = SessionFileManager::open(dir.path(), 3).unwrap();
        let schema = Arc::new(Schema::new(vec![Field::new("n", DataType::Int64, false)]));
        let batch = RecordBatch::try_new(
            schema,
            vec![Arc::new(Int64Array::from(vec![1, 2, 3]))],
        )
        .unwrap();

        manager.write_dataframe("patients", &batch).unwrap();
        let read_back = manager.read_dataframe("patients").unwrap();
        assert_eq!(read_back[0].num_rows(), 3);
    }

    #[test]
    fn delete_missing_dataframe_does_not_error() {
        let dir = tempdir().unwrap();
        let manager = SessionFileManager::open(dir.path(), 4).unwrap();
        manager.delete_dataframe("never-existed").unwrap();
    }
}
