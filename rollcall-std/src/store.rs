//! File-backed calibration store: one small file per key under the state dir.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use rollcall::calibration::CalibrationStore;
use rollcall::Error;

pub struct FileCalibrationStore {
    dir: PathBuf,
}

impl FileCalibrationStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path(&self, key: &str) -> PathBuf {
        self.dir.join(key)
    }
}

impl CalibrationStore for FileCalibrationStore {
    fn load(&self, key: &str) -> rollcall::Result<Option<i8>> {
        let path = self.path(key);
        let text = match fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                log::error!("reading {}: {}", path.display(), e);
                return Err(Error::CalibrationStore);
            }
        };
        text.trim().parse().map(Some).map_err(|e| {
            log::error!("corrupt calibration in {}: {}", path.display(), e);
            Error::CalibrationStore
        })
    }

    fn save(&mut self, key: &str, value: i8) -> rollcall::Result<()> {
        let path = self.path(key);
        write_atomic(&path, &format!("{value}\n")).map_err(|e| {
            log::error!("writing {}: {}", path.display(), e);
            Error::CalibrationStore
        })
    }
}

/// Write via a sibling temp file so a crash never leaves a torn value.
fn write_atomic(path: &Path, contents: &str) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, contents)?;
    fs::rename(&tmp, path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rollcall::calibration::load_profile;
    use rollcall::defaults::CALIBRATION_KEY;

    #[test]
    fn missing_file_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCalibrationStore::new(dir.path());
        assert_eq!(store.load(CALIBRATION_KEY), Ok(None));
        assert_eq!(load_profile(&store).reference, -59);
    }

    #[test]
    fn save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = FileCalibrationStore::new(dir.path().join("state"));
        store.save(CALIBRATION_KEY, -63).unwrap();
        assert_eq!(store.load(CALIBRATION_KEY), Ok(Some(-63)));

        let reopened = FileCalibrationStore::new(dir.path().join("state"));
        assert_eq!(load_profile(&reopened).reference, -63);
    }

    #[test]
    fn corrupt_value_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(CALIBRATION_KEY), "loud").unwrap();
        let store = FileCalibrationStore::new(dir.path());
        assert_eq!(store.load(CALIBRATION_KEY), Err(Error::CalibrationStore));
        assert_eq!(load_profile(&store).reference, -59);
    }
}
