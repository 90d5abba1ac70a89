use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

/// Line-oriented file writer that only becomes visible on [`TableWriter::finish`].
///
/// Rows go to a temp file in the target directory, which is renamed over the
/// target once flushed and synced. A writer dropped before `finish` leaves the
/// previous file untouched.
pub struct TableWriter {
    writer: BufWriter<NamedTempFile>,
    target: PathBuf,
    row_count: usize,
}

impl TableWriter {
    pub fn new<P: AsRef<Path>>(path: P) -> std::io::Result<Self> {
        let target = path.as_ref().to_path_buf();
        let parent = match target.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        std::fs::create_dir_all(&parent)?;
        let temp = NamedTempFile::new_in(&parent)?;

        Ok(Self {
            writer: BufWriter::new(temp),
            target,
            row_count: 0,
        })
    }

    /// Writer for a comma-separated file starting with `header`.
    pub fn with_header<P: AsRef<Path>, S: AsRef<str>>(path: P, header: &[S]) -> std::io::Result<Self> {
        let mut writer = Self::new(path)?;
        writer.write_fields(header)?;
        writer.row_count = 0;
        Ok(writer)
    }

    pub fn write_line(&mut self, line: &str) -> std::io::Result<()> {
        self.writer.write_all(line.as_bytes())?;
        self.writer.write_all(b"\n")?;
        self.row_count += 1;
        Ok(())
    }

    pub fn write_fields<S: AsRef<str>>(&mut self, fields: &[S]) -> std::io::Result<()> {
        for (i, field) in fields.iter().enumerate() {
            if i > 0 {
                self.writer.write_all(b",")?;
            }
            self.writer.write_all(field.as_ref().as_bytes())?;
        }
        self.writer.write_all(b"\n")?;
        self.row_count += 1;
        Ok(())
    }

    /// Flush, sync and rename into place. Returns the number of data rows.
    pub fn finish(self) -> std::io::Result<usize> {
        let temp = self.writer.into_inner().map_err(|e| e.into_error())?;
        temp.as_file().sync_all()?;
        temp.persist(&self.target).map_err(|e| e.error)?;
        Ok(self.row_count)
    }
}

/// Replace `path` with `contents` atomically.
pub fn write_atomic<P: AsRef<Path>>(path: P, contents: &[u8]) -> std::io::Result<()> {
    let mut writer = TableWriter::new(path)?;
    writer.writer.write_all(contents)?;
    writer.finish().map(|_| ())
}
