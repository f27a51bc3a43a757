use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use envreport_logging::report_debug;

use super::{check_dir, check_name, DirEntry, DirStatus, FileStore, StoreError};
use crate::persist::{ensure_dir, AtomicFileWriter, PersistError};

/// [`FileStore`] over a directory on the local filesystem.
///
/// Operations are plain blocking calls; the pipeline handles one file at a
/// time so nothing else waits on them.
#[derive(Debug, Clone)]
pub struct LocalDirectoryStore {
    root: PathBuf,
}

impl LocalDirectoryStore {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    fn dir_path(&self, dir: &str) -> Result<PathBuf, StoreError> {
        check_dir(dir)?;
        Ok(dir
            .split('/')
            .filter(|segment| !segment.is_empty())
            .fold(self.root.clone(), |path, segment| path.join(segment)))
    }

    fn file_path(&self, dir: &str, name: &str) -> Result<PathBuf, StoreError> {
        check_name(name)?;
        Ok(self.dir_path(dir)?.join(name))
    }
}

fn io_error(op: &'static str, path: &Path, source: io::Error) -> StoreError {
    StoreError::Io {
        op,
        path: path.to_path_buf(),
        source,
    }
}

fn persist_error(op: &'static str, path: &Path, err: PersistError) -> StoreError {
    let source = match err {
        PersistError::Io(source) => source,
        PersistError::Dir(message) => io::Error::other(message),
    };
    io_error(op, path, source)
}

#[async_trait::async_trait]
impl FileStore for LocalDirectoryStore {
    async fn list(&self, dir: &str) -> Result<Vec<DirEntry>, StoreError> {
        let path = self.dir_path(dir)?;
        let mut entries = Vec::new();
        for entry in fs::read_dir(&path).map_err(|e| io_error("list", &path, e))? {
            let entry = entry.map_err(|e| io_error("list", &path, e))?;
            let file_type = entry.file_type().map_err(|e| io_error("list", &path, e))?;
            // Non-UTF-8 names cannot be addressed through the string API.
            let Ok(name) = entry.file_name().into_string() else {
                continue;
            };
            entries.push(DirEntry {
                name,
                is_dir: file_type.is_dir(),
            });
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    async fn read(&self, dir: &str, name: &str) -> Result<Vec<u8>, StoreError> {
        let path = self.file_path(dir, name)?;
        fs::read(&path).map_err(|e| io_error("read", &path, e))
    }

    async fn write(&self, dir: &str, name: &str, content: &[u8]) -> Result<(), StoreError> {
        check_name(name)?;
        let dir_path = self.dir_path(dir)?;
        AtomicFileWriter::new(dir_path.clone())
            .write(name, content)
            .map_err(|e| persist_error("write", &dir_path.join(name), e))?;
        Ok(())
    }

    async fn delete(&self, dir: &str, name: &str) -> Result<(), StoreError> {
        let path = self.file_path(dir, name)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                report_debug!("delete of missing file {} ignored", path.display());
                Ok(())
            }
            Err(err) => Err(io_error("delete", &path, err)),
        }
    }

    async fn create_dir(&self, dir: &str) -> Result<DirStatus, StoreError> {
        let path = self.dir_path(dir)?;
        match ensure_dir(&path) {
            Ok(true) => Ok(DirStatus::Created),
            Ok(false) => Ok(DirStatus::AlreadyExisted),
            Err(err) => Err(persist_error("create_dir", &path, err)),
        }
    }
}
