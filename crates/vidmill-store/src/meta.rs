//! Descriptor read/write over a storage back-end.
//!
//! Descriptors are serialized prost messages; every I/O site goes through the
//! bounded-retry wrapper, and wire→core decode failures surface as
//! `StoreError::Corrupt`.

use prost::Message;

use vidmill_core::types::{DatabaseMetadata, JobId, JobMetadata, TableId, TableMetadata, VideoMetadata};
use vidmill_proto::v1 as proto;
use vidmill_wire::{ToCore, ToWire, TryToCore};

use crate::{paths, read_bytes, retry, StorageBackend, StoreError};

fn read_message<M: Message + Default>(
    storage: &dyn StorageBackend,
    path: &str,
) -> Result<M, StoreError> {
    let file = retry::with_backoff(|| storage.make_random_read_file(path))?;
    let size = retry::with_backoff(|| file.size())?;
    let bytes = read_bytes(file.as_ref(), 0, size as usize)?;
    M::decode(bytes.as_slice()).map_err(|err| StoreError::Corrupt {
        path: path.to_string(),
        msg: err.to_string(),
    })
}

fn write_message<M: Message>(
    storage: &dyn StorageBackend,
    path: &str,
    message: &M,
) -> Result<(), StoreError> {
    let bytes = message.encode_to_vec();
    // Write files truncate on creation, so retrying the whole sequence is
    // safe for descriptors.
    retry::with_backoff(|| {
        let mut file = storage.make_write_file(path)?;
        file.append(&bytes)?;
        file.save()
    })
}

fn corrupt(path: String, err: vidmill_wire::ConvertError) -> StoreError {
    StoreError::Corrupt {
        path,
        msg: err.to_string(),
    }
}

pub fn read_database_metadata(
    storage: &dyn StorageBackend,
) -> Result<DatabaseMetadata, StoreError> {
    let path = paths::database_metadata_path();
    let descriptor: proto::DatabaseDescriptor = read_message(storage, &path)?;
    Ok(descriptor.to_core())
}

/// Like [`read_database_metadata`] but treats a missing `database.meta` as an
/// empty database, so a fresh root needs no separate init step.
pub fn read_or_init_database_metadata(
    storage: &dyn StorageBackend,
) -> Result<DatabaseMetadata, StoreError> {
    match read_database_metadata(storage) {
        Ok(meta) => Ok(meta),
        Err(StoreError::NotFound(_)) => Ok(DatabaseMetadata::default()),
        Err(err) => Err(err),
    }
}

pub fn write_database_metadata(
    storage: &dyn StorageBackend,
    meta: &DatabaseMetadata,
) -> Result<(), StoreError> {
    write_message(storage, &paths::database_metadata_path(), &meta.to_wire())
}

pub fn read_table_metadata(
    storage: &dyn StorageBackend,
    table_id: TableId,
) -> Result<TableMetadata, StoreError> {
    let path = paths::table_descriptor_path(table_id);
    let descriptor: proto::TableDescriptor = read_message(storage, &path)?;
    descriptor.try_to_core().map_err(|err| corrupt(path, err))
}

pub fn write_table_metadata(
    storage: &dyn StorageBackend,
    meta: &TableMetadata,
) -> Result<(), StoreError> {
    write_message(storage, &paths::table_descriptor_path(meta.id), &meta.to_wire())
}

pub fn delete_table_metadata(
    storage: &dyn StorageBackend,
    table_id: TableId,
) -> Result<(), StoreError> {
    storage.delete(&paths::table_descriptor_path(table_id))
}

pub fn read_job_metadata(
    storage: &dyn StorageBackend,
    job_id: JobId,
) -> Result<JobMetadata, StoreError> {
    let path = paths::job_descriptor_path(job_id);
    let descriptor: proto::JobDescriptor = read_message(storage, &path)?;
    descriptor.try_to_core().map_err(|err| corrupt(path, err))
}

pub fn write_job_metadata(
    storage: &dyn StorageBackend,
    meta: &JobMetadata,
) -> Result<(), StoreError> {
    write_message(storage, &paths::job_descriptor_path(meta.id), &meta.to_wire())
}

pub fn delete_job_metadata(
    storage: &dyn StorageBackend,
    job_id: JobId,
) -> Result<(), StoreError> {
    storage.delete(&paths::job_descriptor_path(job_id))
}

pub fn read_video_metadata(
    storage: &dyn StorageBackend,
    table_id: TableId,
    column_id: i32,
    item_id: i32,
) -> Result<VideoMetadata, StoreError> {
    let path = paths::video_descriptor_path(table_id, column_id, item_id);
    let descriptor: proto::VideoDescriptor = read_message(storage, &path)?;
    Ok(descriptor.to_core())
}

pub fn write_video_metadata(
    storage: &dyn StorageBackend,
    meta: &VideoMetadata,
) -> Result<(), StoreError> {
    write_message(
        storage,
        &paths::video_descriptor_path(meta.table_id, meta.column_id, meta.item_id),
        &meta.to_wire(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::PosixStorage;
    use std::path::PathBuf;

    fn temp_storage(test_name: &str) -> anyhow::Result<PosixStorage> {
        let mut root = std::env::temp_dir();
        root.push(format!(
            "vidmill-meta-{}-{}-{}",
            test_name,
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_millis()
        ));
        std::fs::create_dir_all(&root)?;
        Ok(PosixStorage::new(PathBuf::from(root)))
    }

    #[test]
    fn database_metadata_roundtrip() -> anyhow::Result<()> {
        let storage = temp_storage("db-meta")?;
        let mut meta = DatabaseMetadata::default();
        meta.add_table("clips").unwrap();
        meta.add_job("edge-detect");

        write_database_metadata(&storage, &meta)?;
        let read = read_database_metadata(&storage)?;
        assert_eq!(read, meta);
        Ok(())
    }

    #[test]
    fn fresh_root_reads_as_empty_database() -> anyhow::Result<()> {
        let storage = temp_storage("db-init")?;
        let meta = read_or_init_database_metadata(&storage)?;
        assert_eq!(meta, DatabaseMetadata::default());
        assert!(matches!(
            read_database_metadata(&storage),
            Err(StoreError::NotFound(_))
        ));
        Ok(())
    }

    #[test]
    fn job_descriptor_roundtrip() -> anyhow::Result<()> {
        let storage = temp_storage("job-meta")?;
        let job = JobMetadata {
            id: JobId(3),
            name: "edge-detect".to_string(),
            io_item_size: 8,
            work_item_size: 4,
            num_nodes: 2,
            tasks: vec![],
            columns: vec![],
        };
        write_job_metadata(&storage, &job)?;
        assert_eq!(read_job_metadata(&storage, JobId(3))?, job);
        Ok(())
    }

    #[test]
    fn video_descriptor_roundtrip() -> anyhow::Result<()> {
        let storage = temp_storage("video-meta")?;
        let meta = VideoMetadata {
            table_id: TableId(2),
            column_id: 0,
            item_id: 1,
            width: 1920,
            height: 1080,
            frames: 100,
            keyframe_positions: vec![0, 30, 60, 90],
            keyframe_byte_offsets: vec![0, 4_000, 9_000, 15_000],
        };
        write_video_metadata(&storage, &meta)?;
        let read = read_video_metadata(&storage, TableId(2), 0, 1)?;
        assert_eq!(read, meta);
        Ok(())
    }
}
