//! Load stage: fetches bytes for each work unit and assembles decode-ready
//! payloads.
//!
//! One `LoadWorker` per configured load thread, each owning its storage
//! handle, table-metadata cache, and video-index cache. Video columns read
//! one keyframe-aligned byte range per video interval; row-oriented columns
//! read two small headers plus one chunk per item.

use std::collections::hash_map::Entry;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use crossbeam::channel::{Receiver, Sender};
use prost::Message;
use tracing::debug;

use vidmill_core::sampling::{slice_into_row_intervals, slice_into_video_intervals};
use vidmill_core::types::{ColumnType, DeviceHandle, IoItem, TableId, TableMetadata, WorkUnit};
use vidmill_observe::metrics::{Counter, DurationAgg, ScopedTimer};
use vidmill_proto::v1::{DecodeArgs, FrameInfo};
use vidmill_store::{
    meta, paths, read_bytes, read_i64_slice_le, read_u64_le, retry, RandomReadFile,
    StorageBackend, StoreError,
};

use crate::error::EngineError;
use crate::eval::{EvalWorkEntry, PipelineMetrics};

const VIDEO_INDEX_CACHE_CAP: usize = 64;

/// Per-thread load counters, logged once when the thread finishes.
#[derive(Debug, Default)]
struct LoadMetrics {
    units_loaded: Counter,
    io_read_bytes: Counter,
    io_time: DurationAgg,
    unit_time: DurationAgg,
}

impl LoadMetrics {
    fn log_snapshot(&self, node_id: i32, worker_id: usize) {
        let io = self.io_time.snapshot();
        let unit = self.unit_time.snapshot();
        tracing::info!(
            target: "vidmill_metrics",
            node_id,
            worker_id,
            units_loaded = self.units_loaded.get(),
            io_reads = io.count,
            io_read_bytes = self.io_read_bytes.get(),
            io_avg_ns = io.avg_ns(),
            io_max_ns = io.max_ns,
            unit_avg_ns = unit.avg_ns(),
            "load metrics"
        );
    }
}

/// Cached per-item video index: descriptor arrays with sentinel tails plus an
/// open read handle, so repeated units against one item cost no extra opens.
struct VideoIndexEntry {
    width: i32,
    height: i32,
    file: Box<dyn RandomReadFile>,
    keyframe_positions: Vec<i64>,
    keyframe_byte_offsets: Vec<i64>,
}

/// Keyed by `(table_id, column_id, item_id)` with a size cap; entries evict
/// oldest-first and the whole cache dies with its load thread at job end.
struct VideoIndexCache {
    entries: HashMap<(TableId, i32, i32), VideoIndexEntry>,
    insertion_order: VecDeque<(TableId, i32, i32)>,
    cap: usize,
}

impl VideoIndexCache {
    fn new(cap: usize) -> Self {
        Self {
            entries: HashMap::new(),
            insertion_order: VecDeque::new(),
            cap,
        }
    }

    fn get_or_read(
        &mut self,
        storage: &dyn StorageBackend,
        key: (TableId, i32, i32),
    ) -> Result<&VideoIndexEntry, EngineError> {
        if !self.entries.contains_key(&key) {
            while self.entries.len() >= self.cap {
                match self.insertion_order.pop_front() {
                    Some(oldest) => {
                        self.entries.remove(&oldest);
                    }
                    None => break,
                }
            }
            let entry = read_video_index(storage, key)?;
            self.entries.insert(key, entry);
            self.insertion_order.push_back(key);
        }
        self.entries
            .get(&key)
            .ok_or_else(|| EngineError::Pipeline("video index cache entry vanished".to_string()))
    }
}

fn read_video_index(
    storage: &dyn StorageBackend,
    (table_id, column_id, item_id): (TableId, i32, i32),
) -> Result<VideoIndexEntry, EngineError> {
    let video_meta = meta::read_video_metadata(storage, table_id, column_id, item_id)?;
    let path = paths::table_item_path(table_id, column_id, item_id);
    let file = retry::with_backoff(|| storage.make_random_read_file(&path))?;
    let file_size = retry::with_backoff(|| file.size())?;

    let mut keyframe_positions = video_meta.keyframe_positions;
    let mut keyframe_byte_offsets = video_meta.keyframe_byte_offsets;
    // Sentinel tails: total frames and file size, so interval arithmetic
    // needs no edge cases at the end of the item.
    keyframe_positions.push(video_meta.frames);
    keyframe_byte_offsets.push(file_size as i64);

    Ok(VideoIndexEntry {
        width: video_meta.width,
        height: video_meta.height,
        file,
        keyframe_positions,
        keyframe_byte_offsets,
    })
}

pub struct LoadWorker {
    node_id: i32,
    worker_id: usize,
    storage: Box<dyn StorageBackend>,
    table_metas: HashMap<TableId, TableMetadata>,
    video_index: VideoIndexCache,
    pipeline: Arc<PipelineMetrics>,
    metrics: Arc<LoadMetrics>,
}

impl LoadWorker {
    pub fn new(
        node_id: i32,
        worker_id: usize,
        storage: Box<dyn StorageBackend>,
        pipeline: Arc<PipelineMetrics>,
    ) -> Self {
        Self {
            node_id,
            worker_id,
            storage,
            table_metas: HashMap::new(),
            video_index: VideoIndexCache::new(VIDEO_INDEX_CACHE_CAP),
            pipeline,
            metrics: Arc::new(LoadMetrics::default()),
        }
    }

    /// Pops units until the sentinel, pushing one `EvalWorkEntry` per unit.
    pub fn run(
        mut self,
        work: Receiver<(u64, WorkUnit)>,
        eval: Sender<(u64, IoItem, EvalWorkEntry)>,
    ) -> Result<(), EngineError> {
        let metrics = Arc::clone(&self.metrics);
        let pipeline = Arc::clone(&self.pipeline);
        while let Ok((seq, unit)) = work.recv() {
            if unit.is_sentinel() {
                break;
            }
            debug!(
                node_id = self.node_id,
                worker_id = self.worker_id,
                io_item_index = unit.io_item.item_id,
                "processing item"
            );
            let entry = {
                let _timer = ScopedTimer::new(&metrics.unit_time);
                self.load_unit(&unit)?
            };
            metrics.units_loaded.inc();
            pipeline.on_loaded(entry.payload_bytes());
            eval.send((seq, unit.io_item, entry))
                .map_err(|_| EngineError::Disconnected)?;
        }
        self.metrics.log_snapshot(self.node_id, self.worker_id);
        debug!(
            node_id = self.node_id,
            worker_id = self.worker_id,
            "load worker finished"
        );
        Ok(())
    }

    fn table_meta(&mut self, table_id: TableId) -> Result<TableMetadata, EngineError> {
        match self.table_metas.entry(table_id) {
            Entry::Occupied(occupied) => Ok(occupied.get().clone()),
            Entry::Vacant(vacant) => {
                let meta = meta::read_table_metadata(self.storage.as_ref(), table_id)?;
                Ok(vacant.insert(meta).clone())
            }
        }
    }

    fn load_unit(&mut self, unit: &WorkUnit) -> Result<EvalWorkEntry, EngineError> {
        let mut entry = EvalWorkEntry {
            io_item_index: unit.io_item.item_id,
            warmup_rows: unit
                .samples
                .first()
                .map(|sample| sample.warmup_rows.len())
                .unwrap_or(0),
            ..EvalWorkEntry::default()
        };

        for sample in &unit.samples {
            let table_meta = self.table_meta(sample.table_id)?;

            let mut rows = sample.warmup_rows.clone();
            rows.extend_from_slice(&sample.rows);
            let intervals = slice_into_row_intervals(&table_meta, &rows)?;

            for &column_id in &sample.column_ids {
                let column_type = table_meta
                    .column_type(column_id)
                    .unwrap_or(ColumnType::Other);
                let mut row_list: Vec<Vec<u8>> = Vec::new();

                if column_type == ColumnType::Video {
                    for (k, &item_id) in intervals.item_ids.iter().enumerate() {
                        self.read_video_column(
                            sample.table_id,
                            column_id,
                            item_id,
                            &intervals.valid_offsets[k],
                            &mut row_list,
                        )?;
                    }
                } else if column_id > 0
                    && table_meta.column_type(column_id - 1) == Some(ColumnType::Video)
                {
                    // Frame-info side column: dimensions come from the
                    // predecessor video column's index.
                    let index = self.video_index.get_or_read(
                        self.storage.as_ref(),
                        (sample.table_id, column_id - 1, 0),
                    )?;
                    let info = FrameInfo {
                        width: index.width,
                        height: index.height,
                    }
                    .encode_to_vec();
                    for valid in &intervals.valid_offsets {
                        for _ in valid {
                            row_list.push(info.clone());
                        }
                    }
                } else {
                    for (k, &item_id) in intervals.item_ids.iter().enumerate() {
                        self.read_other_column(
                            sample.table_id,
                            column_id,
                            item_id,
                            intervals.item_intervals[k],
                            &intervals.valid_offsets[k],
                            &mut row_list,
                        )?;
                    }
                }

                entry.columns.push(row_list);
                entry.column_types.push(column_type);
                entry.column_handles.push(DeviceHandle::CPU);
            }
        }
        Ok(entry)
    }

    /// One byte-range read and one `DecodeArgs` row per video interval.
    fn read_video_column(
        &mut self,
        table_id: TableId,
        column_id: i32,
        item_id: i32,
        rows: &[i64],
        out: &mut Vec<Vec<u8>>,
    ) -> Result<(), EngineError> {
        let index = self
            .video_index
            .get_or_read(self.storage.as_ref(), (table_id, column_id, item_id))?;
        let intervals = slice_into_video_intervals(&index.keyframe_positions, rows)?;

        for (k, &(start_kf, end_kf)) in intervals.keyframe_index_intervals.iter().enumerate() {
            let start_byte = index.keyframe_byte_offsets[start_kf];
            let end_byte = index.keyframe_byte_offsets[end_kf];
            let encoded = {
                let _timer = ScopedTimer::new(&self.metrics.io_time);
                read_bytes(
                    index.file.as_ref(),
                    start_byte as u64,
                    (end_byte - start_byte) as usize,
                )?
            };
            self.metrics.io_read_bytes.inc_by(encoded.len() as u64);

            let decode_args = DecodeArgs {
                width: index.width,
                height: index.height,
                start_keyframe: index.keyframe_positions[start_kf],
                end_keyframe: index.keyframe_positions[end_kf],
                keyframes: index.keyframe_positions[start_kf..=end_kf].to_vec(),
                keyframe_byte_offsets: index.keyframe_byte_offsets[start_kf..=end_kf]
                    .iter()
                    .map(|&offset| offset - start_byte)
                    .collect(),
                valid_frames: intervals.valid_frames[k].clone(),
                encoded_video: encoded,
            };
            out.push(decode_args.encode_to_vec());
        }
        Ok(())
    }

    /// Two header reads plus one chunk read, then slices the chunk down to
    /// the requested offsets.
    fn read_other_column(
        &mut self,
        table_id: TableId,
        column_id: i32,
        item_id: i32,
        (item_start, item_end): (i64, i64),
        valid_offsets: &[i64],
        out: &mut Vec<Vec<u8>>,
    ) -> Result<(), EngineError> {
        let path = paths::table_item_path(table_id, column_id, item_id);
        let file = retry::with_backoff(|| self.storage.make_random_read_file(&path))?;

        let num_rows = read_u64_le(file.as_ref(), 0)? as i64;
        if item_end > num_rows {
            return Err(StoreError::Corrupt {
                path,
                msg: format!("interval end {item_end} exceeds {num_rows} rows"),
            }
            .into());
        }
        let row_sizes = read_i64_slice_le(file.as_ref(), 8, num_rows as usize)?;
        if row_sizes.iter().any(|&size| size < 0) {
            return Err(StoreError::Corrupt {
                path,
                msg: "negative row size".to_string(),
            }
            .into());
        }

        let header_len = 8 + 8 * num_rows as u64;
        let start_offset: i64 = row_sizes[..item_start as usize].iter().sum();
        let span: i64 = row_sizes[item_start as usize..item_end as usize].iter().sum();
        let chunk = {
            let _timer = ScopedTimer::new(&self.metrics.io_time);
            read_bytes(file.as_ref(), header_len + start_offset as u64, span as usize)?
        };
        self.metrics.io_read_bytes.inc_by(chunk.len() as u64);

        let mut offset = 0usize;
        let mut valid = valid_offsets.iter().peekable();
        for (i, &size) in row_sizes[item_start as usize..item_end as usize]
            .iter()
            .enumerate()
        {
            let row = item_start + i as i64;
            let size = size as usize;
            if valid.peek() == Some(&&row) {
                out.push(chunk[offset..offset + size].to_vec());
                valid.next();
            }
            offset += size;
        }
        Ok(())
    }
}
