use crate::error::{RResult, RecorderError};
use crate::session::DataRow;
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};

pub const CSV_HEADER: &str = "X Acceleration, Y Acceleration, Z Acceleration, Acceleration, \
Latitude, Longitude, Heading, Magnetic X, Magnetic Y, Magnetic Z, Time";

/// Folder created under the output directory for session files
pub const DATA_FOLDER: &str = "iSENSE";

/// Opaque handle returned by `PersistenceSink::open`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SinkHandle(pub(crate) u64);

/// Append-only row writer.
///
/// Errors are reported to the caller, which decides whether they matter;
/// the recording session keeps its in-memory rows regardless.
pub trait PersistenceSink {
    fn open(&mut self, name: &str) -> RResult<SinkHandle>;
    fn append(&mut self, handle: SinkHandle, row: &DataRow) -> RResult<()>;
    /// Must accept a handle that never saw an append
    fn close(&mut self, handle: SinkHandle) -> RResult<()>;
}

struct OpenFile {
    writer: BufWriter<File>,
    path: PathBuf,
}

/// CSV writer: one file per session in `<root>/iSENSE/<name>.csv`
pub struct CsvFileSink {
    folder: PathBuf,
    next_handle: u64,
    open_files: HashMap<SinkHandle, OpenFile>,
    last_path: Option<PathBuf>,
}

impl CsvFileSink {
    pub fn new(output_dir: &Path) -> Self {
        Self {
            folder: output_dir.join(DATA_FOLDER),
            next_handle: 1,
            open_files: HashMap::new(),
            last_path: None,
        }
    }

    pub fn folder(&self) -> &Path {
        &self.folder
    }

    /// Path of the most recently opened file
    pub fn last_path(&self) -> Option<&Path> {
        self.last_path.as_deref()
    }

    fn storage_error(context: &str, path: &Path, err: std::io::Error) -> RecorderError {
        RecorderError::StorageWriteFailed(format!("{} {}: {}", context, path.display(), err))
    }
}

impl PersistenceSink for CsvFileSink {
    fn open(&mut self, name: &str) -> RResult<SinkHandle> {
        fs::create_dir_all(&self.folder)
            .map_err(|e| Self::storage_error("creating", &self.folder, e))?;

        let base = sanitize_file_name(name);
        let (file, path) = create_unique(&self.folder, &base)
            .map_err(|e| Self::storage_error("creating", &self.folder.join(format!("{}.csv", base)), e))?;

        let mut writer = BufWriter::new(file);
        writeln!(writer, "{}", CSV_HEADER)
            .and_then(|_| writer.flush())
            .map_err(|e| Self::storage_error("writing header to", &path, e))?;

        let handle = SinkHandle(self.next_handle);
        self.next_handle += 1;

        log::info!("Recording to {}", path.display());
        self.last_path = Some(path.clone());
        self.open_files.insert(handle, OpenFile { writer, path });
        Ok(handle)
    }

    fn append(&mut self, handle: SinkHandle, row: &DataRow) -> RResult<()> {
        let open = self
            .open_files
            .get_mut(&handle)
            .ok_or_else(|| RecorderError::StorageWriteFailed(format!("unknown handle {:?}", handle)))?;

        // Flush per row so a crash leaves every completed tick on disk
        writeln!(open.writer, "{}", format_csv_row(row))
            .and_then(|_| open.writer.flush())
            .map_err(|e| Self::storage_error("appending to", &open.path, e))
    }

    fn close(&mut self, handle: SinkHandle) -> RResult<()> {
        match self.open_files.remove(&handle) {
            Some(mut open) => open
                .writer
                .flush()
                .map_err(|e| Self::storage_error("closing", &open.path, e)),
            None => Ok(()),
        }
    }
}

/// Creates `<base>.csv`, or `<base>-2.csv`, `<base>-3.csv`... if taken. Never truncates.
fn create_unique(folder: &Path, base: &str) -> io::Result<(File, PathBuf)> {
    let mut suffix = 1u32;
    loop {
        let name = match suffix {
            1 => format!("{}.csv", base),
            n => format!("{}-{}.csv", base, n),
        };
        let path = folder.join(name);
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => return Ok((file, path)),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => suffix += 1,
            Err(e) => return Err(e),
        }
    }
}

/// One CSV line (no trailing newline). Missing fixes become empty fields.
pub fn format_csv_row(row: &DataRow) -> String {
    let coord = |value: Option<f64>| value.map(|v| v.to_string()).unwrap_or_default();

    format!(
        "{:.3}, {:.3}, {:.3}, {:.3}, {}, {}, {:.3}, {}, {}, {}, {}",
        row.accel_x,
        row.accel_y,
        row.accel_z,
        row.accel_magnitude,
        coord(row.latitude),
        coord(row.longitude),
        row.heading,
        row.mag_x,
        row.mag_y,
        row.mag_z,
        row.timestamp_ms
    )
}

/// Strips path separators so a ride name cannot escape the data folder
pub fn sanitize_file_name(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '\0' => '_',
            other => other,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(timestamp_ms: i64, fix: bool) -> DataRow {
        DataRow {
            accel_x: 1.0,
            accel_y: 0.0,
            accel_z: 0.0,
            accel_magnitude: 1.0,
            latitude: fix.then_some(42.0),
            longitude: fix.then_some(-71.0),
            heading: 0.12345,
            mag_x: 0.0,
            mag_y: 1.0,
            mag_z: 0.0,
            timestamp_ms,
        }
    }

    #[test]
    fn test_format_csv_row() {
        let line = format_csv_row(&row(1_700_000_000_200, true));
        assert_eq!(
            line,
            "1.000, 0.000, 0.000, 1.000, 42, -71, 0.123, 0, 1, 0, 1700000000200"
        );
    }

    #[test]
    fn test_missing_fix_writes_empty_fields() {
        let line = format_csv_row(&row(200, false));
        assert!(line.starts_with("1.000, 0.000, 0.000, 1.000, , , 0.123"));
        assert_eq!(line.split(", ").count(), 11);
    }

    #[test]
    fn test_csv_file_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = CsvFileSink::new(dir.path());

        let handle = sink.open("Drop Tower-2-10-18-2026--12-00-00").unwrap();
        sink.append(handle, &row(200, true)).unwrap();
        sink.append(handle, &row(400, true)).unwrap();
        sink.close(handle).unwrap();

        let path = dir.path().join(DATA_FOLDER).join("Drop Tower-2-10-18-2026--12-00-00.csv");
        assert_eq!(sink.last_path(), Some(path.as_path()));

        let contents = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], CSV_HEADER);
        assert!(lines[2].ends_with(", 400"));
    }

    #[test]
    fn test_rows_visible_before_close() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = CsvFileSink::new(dir.path());

        let handle = sink.open("partial").unwrap();
        sink.append(handle, &row(200, true)).unwrap();

        let contents = fs::read_to_string(sink.last_path().unwrap()).unwrap();
        assert_eq!(contents.lines().count(), 2);
    }

    #[test]
    fn test_close_without_append() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = CsvFileSink::new(dir.path());

        let handle = sink.open("empty").unwrap();
        sink.close(handle).unwrap();
        // Second close of the same handle is harmless
        sink.close(handle).unwrap();

        let contents = fs::read_to_string(sink.last_path().unwrap()).unwrap();
        assert_eq!(contents.trim_end(), CSV_HEADER);
    }

    #[test]
    fn test_append_after_close_fails() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = CsvFileSink::new(dir.path());

        let handle = sink.open("closed").unwrap();
        sink.close(handle).unwrap();

        let err = sink.append(handle, &row(200, true)).unwrap_err();
        assert!(matches!(err, RecorderError::StorageWriteFailed(_)));
    }

    #[test]
    fn test_unwritable_folder_reports_storage_failure() {
        let dir = tempfile::tempdir().unwrap();
        // A regular file where the data folder should go
        fs::write(dir.path().join(DATA_FOLDER), b"not a directory").unwrap();

        let mut sink = CsvFileSink::new(dir.path());
        let err = sink.open("blocked").unwrap_err();
        assert!(err.is_retryable());
    }

    #[test]
    fn test_same_name_gets_suffix_instead_of_truncating() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = CsvFileSink::new(dir.path());

        let first = sink.open("Untamed-3-10-18-2026--12-00-00").unwrap();
        sink.append(first, &row(200, true)).unwrap();
        sink.close(first).unwrap();
        let first_path = sink.last_path().unwrap().to_path_buf();

        let second = sink.open("Untamed-3-10-18-2026--12-00-00").unwrap();
        sink.close(second).unwrap();
        let second_path = sink.last_path().unwrap().to_path_buf();

        assert_ne!(first_path, second_path);
        assert_eq!(
            second_path,
            dir.path().join(DATA_FOLDER).join("Untamed-3-10-18-2026--12-00-00-2.csv")
        );
        // Earlier session is intact
        assert_eq!(fs::read_to_string(&first_path).unwrap().lines().count(), 2);
    }

    #[test]
    fn test_sanitize_file_name() {
        assert_eq!(sanitize_file_name("Top/Thrill:2"), "Top_Thrill_2");
    }
}
