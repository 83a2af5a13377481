// SPDX-License-Identifier: GPL-3.0-only

//! Storage for captured stills
//!
//! A still is written to `<final>~` first and renamed into place only after
//! it has been flushed and closed, so a reader never sees half an image.

use crate::constants::DEFAULT_SAVE_FOLDER;
use crate::pipelines::photo::StillSink;
use chrono::{DateTime, Datelike, TimeZone, Timelike};
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// `{day}{month}{year}_{hour}{minute}{second}.jpg`, numbers unpadded
pub fn photo_filename<Tz: TimeZone>(time: &DateTime<Tz>) -> String {
    format!(
        "{}{}{}_{}{}{}.jpg",
        time.day(),
        time.month(),
        time.year(),
        time.hour(),
        time.minute(),
        time.second()
    )
}

/// Pictures directory, falling back to home and then the working directory
pub fn default_photo_dir() -> PathBuf {
    dirs::picture_dir()
        .unwrap_or_else(|| dirs::home_dir().unwrap_or_else(|| PathBuf::from(".")))
        .join(DEFAULT_SAVE_FOLDER)
}

/// Temporary name a still is written under
pub fn temp_path(final_path: &Path) -> PathBuf {
    let mut name = final_path.as_os_str().to_os_string();
    name.push("~");
    PathBuf::from(name)
}

/// Output file that only appears under its final name once committed
pub struct PendingFile {
    final_path: PathBuf,
    temp_path: PathBuf,
    writer: Option<BufWriter<File>>,
}

impl PendingFile {
    /// Open `<final_path>~` for writing
    pub fn create(final_path: impl Into<PathBuf>) -> io::Result<Self> {
        let final_path = final_path.into();
        let temp_path = temp_path(&final_path);
        let file = File::create(&temp_path)?;
        debug!(path = %temp_path.display(), "Opened still output");
        Ok(Self {
            final_path,
            temp_path,
            writer: Some(BufWriter::new(file)),
        })
    }

    pub fn final_path(&self) -> &Path {
        &self.final_path
    }

    pub fn temp_path(&self) -> &Path {
        &self.temp_path
    }

    fn remove_temp(&self) {
        if let Err(e) = std::fs::remove_file(&self.temp_path) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!(path = %self.temp_path.display(), error = %e, "Unable to remove temporary file");
            }
        }
    }
}

impl StillSink for PendingFile {
    fn write_payload(&mut self, data: &[u8]) -> io::Result<usize> {
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| io::Error::other("output already closed"))?;
        writer.write_all(data)?;
        Ok(data.len())
    }

    fn commit(mut self: Box<Self>) -> io::Result<()> {
        let Some(writer) = self.writer.take() else {
            return Err(io::Error::other("output already closed"));
        };
        let result = writer
            .into_inner()
            .map_err(|e| e.into_error())
            .and_then(|file| file.sync_all())
            .and_then(|()| std::fs::rename(&self.temp_path, &self.final_path));
        if let Err(e) = result {
            self.remove_temp();
            return Err(e);
        }
        debug!(path = %self.final_path.display(), "Still saved");
        Ok(())
    }

    fn discard(mut self: Box<Self>) {
        drop(self.writer.take());
        self.remove_temp();
    }
}

impl Drop for PendingFile {
    fn drop(&mut self) {
        if self.writer.take().is_some() {
            self.remove_temp();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Local;

    #[test]
    fn test_photo_filename_is_unpadded() {
        let time = Local.with_ymd_and_hms(2024, 3, 5, 7, 8, 9).unwrap();
        assert_eq!(photo_filename(&time), "532024_789.jpg");

        let time = Local.with_ymd_and_hms(2024, 12, 25, 18, 30, 45).unwrap();
        assert_eq!(photo_filename(&time), "25122024_183045.jpg");
    }

    #[test]
    fn test_commit_renames_into_place() {
        let dir = tempfile::tempdir().unwrap();
        let final_path = dir.path().join("shot.jpg");
        let mut file = Box::new(PendingFile::create(&final_path).unwrap());

        file.write_payload(b"\xFF\xD8jpeg").unwrap();
        assert!(file.temp_path().exists());
        assert!(!final_path.exists());

        file.commit().unwrap();
        assert_eq!(std::fs::read(&final_path).unwrap(), b"\xFF\xD8jpeg");
        assert!(!temp_path(&final_path).exists());
    }

    #[test]
    fn test_discard_removes_temp() {
        let dir = tempfile::tempdir().unwrap();
        let final_path = dir.path().join("shot.jpg");
        let mut file = Box::new(PendingFile::create(&final_path).unwrap());
        file.write_payload(b"partial").unwrap();

        file.discard();
        assert!(!final_path.exists());
        assert!(!temp_path(&final_path).exists());
    }

    #[test]
    fn test_drop_removes_temp() {
        let dir = tempfile::tempdir().unwrap();
        let final_path = dir.path().join("shot.jpg");
        drop(PendingFile::create(&final_path).unwrap());
        assert!(!temp_path(&final_path).exists());
    }
}
