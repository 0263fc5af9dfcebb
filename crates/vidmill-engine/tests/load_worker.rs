use std::path::PathBuf;
use std::sync::Arc;

use prost::Message;

use vidmill_core::types::{
    Column, ColumnType, IoItem, LoadSampleRows, TableId, TableMetadata, VideoMetadata, WorkUnit,
};
use vidmill_engine::eval::{EvalWorkEntry, PipelineMetrics};
use vidmill_engine::load::LoadWorker;
use vidmill_proto::v1::{DecodeArgs, FrameInfo};
use vidmill_store::fs::PosixStorage;
use vidmill_store::{meta, paths, StorageBackend};

fn temp_root(test_name: &str) -> anyhow::Result<PathBuf> {
    let mut root = std::env::temp_dir();
    root.push(format!(
        "vidmill-load-{}-{}-{}",
        test_name,
        std::process::id(),
        vidmill_observe::time::unix_time_ms()
    ));
    std::fs::create_dir_all(&root)?;
    Ok(root)
}

/// Encoded-video stand-in with a recognizable byte pattern.
fn patterned_bytes(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

fn write_raw(storage: &PosixStorage, path: &str, bytes: &[u8]) -> anyhow::Result<()> {
    let mut file = storage.make_write_file(path)?;
    file.append(bytes)?;
    file.save()?;
    Ok(())
}

fn write_row_item(
    storage: &PosixStorage,
    path: &str,
    rows: &[Vec<u8>],
) -> anyhow::Result<()> {
    let mut file = storage.make_write_file(path)?;
    file.append(&(rows.len() as u64).to_le_bytes())?;
    for row in rows {
        file.append(&(row.len() as i64).to_le_bytes())?;
    }
    for row in rows {
        file.append(row)?;
    }
    file.save()?;
    Ok(())
}

/// Video table: 100 frames in one item, keyframes every 30 frames, plus a
/// frame-info side column.
fn setup_video_table(storage: &PosixStorage) -> anyhow::Result<TableId> {
    let table_id = TableId(1);
    let table = TableMetadata {
        id: table_id,
        name: "clips".to_string(),
        job_id: None,
        timestamp: 0,
        end_rows: vec![100],
        columns: vec![
            Column {
                id: 0,
                name: "frame".to_string(),
                column_type: ColumnType::Video,
            },
            Column {
                id: 1,
                name: "frame_info".to_string(),
                column_type: ColumnType::Other,
            },
        ],
    };
    meta::write_table_metadata(storage, &table)?;
    meta::write_video_metadata(
        storage,
        &VideoMetadata {
            table_id,
            column_id: 0,
            item_id: 0,
            width: 1920,
            height: 1080,
            frames: 100,
            keyframe_positions: vec![0, 30, 60, 90],
            keyframe_byte_offsets: vec![0, 4_000, 9_000, 15_000],
        },
    )?;
    write_raw(
        storage,
        &paths::table_item_path(table_id, 0, 0),
        &patterned_bytes(22_000),
    )?;
    Ok(table_id)
}

fn run_one_unit(root: &PathBuf, unit: WorkUnit) -> anyhow::Result<(IoItem, EvalWorkEntry)> {
    let (work_tx, work_rx) = crossbeam::channel::bounded::<(u64, WorkUnit)>(4);
    let (eval_tx, eval_rx) =
        crossbeam::channel::bounded::<(u64, IoItem, EvalWorkEntry)>(4);

    work_tx.send((0, unit))?;
    work_tx.send((1, WorkUnit::sentinel()))?;
    drop(work_tx);

    let storage = Box::new(PosixStorage::new(root.clone()));
    let pipeline = Arc::new(PipelineMetrics::default());
    LoadWorker::new(0, 0, storage, pipeline).run(work_rx, eval_tx)?;

    let (_, io_item, entry) = eval_rx.recv()?;
    assert!(eval_rx.recv().is_err(), "expected exactly one entry");
    Ok((io_item, entry))
}

fn single_sample_unit(table_id: TableId, rows: Vec<i64>, column_ids: Vec<i32>) -> WorkUnit {
    WorkUnit {
        io_item: IoItem {
            item_id: 0,
            table_id: TableId(9),
            start_row: 0,
            end_row: rows.len() as i64,
        },
        samples: vec![LoadSampleRows {
            table_id,
            column_ids,
            warmup_rows: vec![],
            rows,
        }],
    }
}

#[test]
fn strided_video_read_is_one_byte_range() -> anyhow::Result<()> {
    let root = temp_root("strided-video")?;
    let storage = PosixStorage::new(root.clone());
    let table_id = setup_video_table(&storage)?;

    let (_, entry) = run_one_unit(&root, single_sample_unit(table_id, vec![0, 10, 40, 80], vec![0]))?;

    assert_eq!(entry.column_types, vec![ColumnType::Video]);
    assert_eq!(entry.columns.len(), 1);
    // Frames 0/10/40/80 leave no keyframe run unused, so one decode payload.
    assert_eq!(entry.columns[0].len(), 1);

    let args = DecodeArgs::decode(entry.columns[0][0].as_slice())?;
    assert_eq!((args.width, args.height), (1920, 1080));
    assert_eq!(args.start_keyframe, 0);
    assert_eq!(args.end_keyframe, 90);
    assert_eq!(args.keyframes, vec![0, 30, 60, 90]);
    assert_eq!(args.keyframe_byte_offsets, vec![0, 4_000, 9_000, 15_000]);
    assert_eq!(args.valid_frames, vec![0, 10, 40, 80]);
    assert_eq!(args.encoded_video, patterned_bytes(22_000)[..15_000]);
    Ok(())
}

#[test]
fn gapped_video_read_splits_into_two_ranges() -> anyhow::Result<()> {
    let root = temp_root("gapped-video")?;
    let storage = PosixStorage::new(root.clone());
    let table_id = setup_video_table(&storage)?;

    let (_, entry) = run_one_unit(&root, single_sample_unit(table_id, vec![0, 80], vec![0]))?;
    let column = &entry.columns[0];
    assert_eq!(column.len(), 2);

    let first = DecodeArgs::decode(column[0].as_slice())?;
    assert_eq!((first.start_keyframe, first.end_keyframe), (0, 30));
    assert_eq!(first.valid_frames, vec![0]);
    assert_eq!(first.encoded_video.len(), 4_000);
    assert_eq!(first.encoded_video, patterned_bytes(22_000)[..4_000]);

    let second = DecodeArgs::decode(column[1].as_slice())?;
    assert_eq!((second.start_keyframe, second.end_keyframe), (60, 90));
    assert_eq!(second.valid_frames, vec![80]);
    // Byte offsets inside the payload are relative to the range start.
    assert_eq!(second.keyframe_byte_offsets, vec![0, 6_000]);
    assert_eq!(second.encoded_video, patterned_bytes(22_000)[9_000..15_000]);
    Ok(())
}

#[test]
fn tail_frames_read_through_to_file_end() -> anyhow::Result<()> {
    let root = temp_root("tail-video")?;
    let storage = PosixStorage::new(root.clone());
    let table_id = setup_video_table(&storage)?;

    let (_, entry) = run_one_unit(&root, single_sample_unit(table_id, vec![95], vec![0]))?;
    let args = DecodeArgs::decode(entry.columns[0][0].as_slice())?;
    // The terminating keyframe is the frame-count sentinel, whose byte
    // offset is the file size.
    assert_eq!((args.start_keyframe, args.end_keyframe), (90, 100));
    assert_eq!(args.encoded_video, patterned_bytes(22_000)[15_000..22_000]);
    Ok(())
}

#[test]
fn frame_info_column_serializes_dimensions_per_row() -> anyhow::Result<()> {
    let root = temp_root("frame-info")?;
    let storage = PosixStorage::new(root.clone());
    let table_id = setup_video_table(&storage)?;

    let (_, entry) = run_one_unit(&root, single_sample_unit(table_id, vec![0, 1, 2], vec![1]))?;
    assert_eq!(entry.column_types, vec![ColumnType::Other]);
    let column = &entry.columns[0];
    assert_eq!(column.len(), 3);
    for row in column {
        let info = FrameInfo::decode(row.as_slice())?;
        assert_eq!((info.width, info.height), (1920, 1080));
    }
    assert_eq!(column[0], column[1]);
    assert_eq!(column[1], column[2]);
    Ok(())
}

#[test]
fn other_column_slices_requested_rows_across_items() -> anyhow::Result<()> {
    let root = temp_root("other-column")?;
    let storage = PosixStorage::new(root.clone());

    let table_id = TableId(2);
    meta::write_table_metadata(
        &storage,
        &TableMetadata {
            id: table_id,
            name: "labels".to_string(),
            job_id: None,
            timestamp: 0,
            end_rows: vec![3, 7],
            columns: vec![Column {
                id: 0,
                name: "label".to_string(),
                column_type: ColumnType::Other,
            }],
        },
    )?;
    write_row_item(
        &storage,
        &paths::table_item_path(table_id, 0, 0),
        &[b"aaaa".to_vec(), b"bbbb".to_vec(), b"cccc".to_vec()],
    )?;
    write_row_item(
        &storage,
        &paths::table_item_path(table_id, 0, 1),
        &[
            b"dddddddd".to_vec(),
            b"eeeeeeee".to_vec(),
            b"ffffffff".to_vec(),
            b"gggggggg".to_vec(),
        ],
    )?;

    let (_, entry) = run_one_unit(&root, single_sample_unit(table_id, vec![1, 2, 5], vec![0]))?;
    // Item 0 contributes offsets 1 and 2, item 1 contributes offset 2.
    assert_eq!(
        entry.columns[0],
        vec![b"bbbb".to_vec(), b"cccc".to_vec(), b"ffffffff".to_vec()]
    );
    Ok(())
}

#[test]
fn warmup_rows_load_ahead_of_live_rows() -> anyhow::Result<()> {
    let root = temp_root("warmup")?;
    let storage = PosixStorage::new(root.clone());

    let table_id = TableId(3);
    meta::write_table_metadata(
        &storage,
        &TableMetadata {
            id: table_id,
            name: "series".to_string(),
            job_id: None,
            timestamp: 0,
            end_rows: vec![6],
            columns: vec![Column {
                id: 0,
                name: "value".to_string(),
                column_type: ColumnType::Other,
            }],
        },
    )?;
    let rows: Vec<Vec<u8>> = (0u8..6).map(|r| vec![r; 2]).collect();
    write_row_item(&storage, &paths::table_item_path(table_id, 0, 0), &rows)?;

    let unit = WorkUnit {
        io_item: IoItem {
            item_id: 1,
            table_id: TableId(9),
            start_row: 2,
            end_row: 4,
        },
        samples: vec![LoadSampleRows {
            table_id,
            column_ids: vec![0],
            warmup_rows: vec![0, 1],
            rows: vec![2, 3],
        }],
    };
    let (_, entry) = run_one_unit(&root, unit)?;
    assert_eq!(entry.warmup_rows, 2);
    // Warmup rows arrive first, then the live rows, in enumeration order.
    assert_eq!(
        entry.columns[0],
        vec![vec![0, 0], vec![1, 1], vec![2, 2], vec![3, 3]]
    );
    Ok(())
}
