use std::fs::File;
use std::io::{BufWriter, ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::{RandomReadFile, StorageBackend, StoreError, WriteFile};

/// Storage back-end over a local directory tree.
#[derive(Debug, Clone)]
pub struct PosixStorage {
    root: PathBuf,
}

impl PosixStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &str) -> PathBuf {
        self.root.join(path)
    }
}

fn classify(path: &Path, err: std::io::Error) -> StoreError {
    let path = path.display().to_string();
    match err.kind() {
        ErrorKind::NotFound => StoreError::NotFound(path),
        ErrorKind::Interrupted | ErrorKind::TimedOut | ErrorKind::WouldBlock => {
            StoreError::Transient {
                path,
                msg: err.to_string(),
            }
        }
        _ => StoreError::Permanent {
            path,
            msg: err.to_string(),
        },
    }
}

fn poisoned(path: &Path) -> StoreError {
    StoreError::Permanent {
        path: path.display().to_string(),
        msg: "file mutex poisoned".to_string(),
    }
}

#[derive(Debug)]
struct PosixReadFile {
    path: PathBuf,
    file: Mutex<File>,
}

impl RandomReadFile for PosixReadFile {
    fn size(&self) -> Result<u64, StoreError> {
        let file = self.file.lock().map_err(|_| poisoned(&self.path))?;
        let meta = file.metadata().map_err(|e| classify(&self.path, e))?;
        Ok(meta.len())
    }

    fn read_at(&self, pos: u64, dst: &mut [u8]) -> Result<(), StoreError> {
        let mut file = self.file.lock().map_err(|_| poisoned(&self.path))?;
        file.seek(SeekFrom::Start(pos))
            .map_err(|e| classify(&self.path, e))?;
        file.read_exact(dst).map_err(|e| classify(&self.path, e))
    }
}

struct PosixWriteFile {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl WriteFile for PosixWriteFile {
    fn append(&mut self, bytes: &[u8]) -> Result<(), StoreError> {
        self.writer
            .write_all(bytes)
            .map_err(|e| classify(&self.path, e))
    }

    fn save(&mut self) -> Result<(), StoreError> {
        self.writer.flush().map_err(|e| classify(&self.path, e))?;
        self.writer
            .get_ref()
            .sync_all()
            .map_err(|e| classify(&self.path, e))
    }
}

impl StorageBackend for PosixStorage {
    fn make_random_read_file(&self, path: &str) -> Result<Box<dyn RandomReadFile>, StoreError> {
        let resolved = self.resolve(path);
        let file = File::open(&resolved).map_err(|e| classify(&resolved, e))?;
        Ok(Box::new(PosixReadFile {
            path: resolved,
            file: Mutex::new(file),
        }))
    }

    fn make_write_file(&self, path: &str) -> Result<Box<dyn WriteFile>, StoreError> {
        let resolved = self.resolve(path);
        if let Some(parent) = resolved.parent() {
            std::fs::create_dir_all(parent).map_err(|e| classify(&resolved, e))?;
        }
        let file = File::create(&resolved).map_err(|e| classify(&resolved, e))?;
        Ok(Box::new(PosixWriteFile {
            path: resolved,
            writer: BufWriter::new(file),
        }))
    }

    fn exists(&self, path: &str) -> Result<bool, StoreError> {
        let resolved = self.resolve(path);
        match std::fs::metadata(&resolved) {
            Ok(_) => Ok(true),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
            Err(err) => Err(classify(&resolved, err)),
        }
    }

    fn delete(&self, path: &str) -> Result<(), StoreError> {
        let resolved = self.resolve(path);
        match std::fs::remove_file(&resolved) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(classify(&resolved, err)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_root(test_name: &str) -> anyhow::Result<PathBuf> {
        let mut root = std::env::temp_dir();
        let suffix = format!(
            "vidmill-store-{}-{}-{}",
            test_name,
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_millis()
        );
        root.push(suffix);
        std::fs::create_dir_all(&root)?;
        Ok(root)
    }

    #[test]
    fn write_then_read_back() -> anyhow::Result<()> {
        let storage = PosixStorage::new(temp_root("roundtrip")?);

        let mut file = storage.make_write_file("tables/0/0/0")?;
        file.append(b"hello ")?;
        file.append(b"world")?;
        file.save()?;

        let read = storage.make_random_read_file("tables/0/0/0")?;
        assert_eq!(read.size()?, 11);
        let mut buf = vec![0u8; 5];
        read.read_at(6, &mut buf)?;
        assert_eq!(&buf, b"world");
        Ok(())
    }

    #[test]
    fn missing_file_is_not_found() -> anyhow::Result<()> {
        let storage = PosixStorage::new(temp_root("missing")?);
        let err = storage.make_random_read_file("nope").unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
        assert!(!storage.exists("nope")?);
        Ok(())
    }

    #[test]
    fn delete_is_idempotent() -> anyhow::Result<()> {
        let storage = PosixStorage::new(temp_root("delete")?);
        let mut file = storage.make_write_file("jobs/1/descriptor")?;
        file.append(b"x")?;
        file.save()?;

        storage.delete("jobs/1/descriptor")?;
        storage.delete("jobs/1/descriptor")?;
        assert!(!storage.exists("jobs/1/descriptor")?);
        Ok(())
    }
}
