//! Interval decompositions for work partitioning.
//!
//! A requested row list over a table is decomposed twice: first into
//! row-intervals (which items, and which contiguous offset range within each
//! item, the load worker must read), then for video columns into
//! video-intervals (which keyframe runs cover the requested frames, since an
//! encoded byte range is only independently decodable from a keyframe).

use thiserror::Error;

use crate::types::TableMetadata;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RowIntervals {
    pub item_ids: Vec<i32>,
    /// Half-open contiguous read range within the item; may exceed the set of
    /// rows actually requested.
    pub item_intervals: Vec<(i64, i64)>,
    /// Exact per-item row offsets the caller asked for, a subset of the
    /// matching `item_intervals` entry.
    pub valid_offsets: Vec<Vec<i64>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VideoIntervals {
    /// `(start_kf_index, end_kf_index)` pairs; the byte range of run `k` is
    /// `[keyframe_byte_offsets[start], keyframe_byte_offsets[end])`.
    pub keyframe_index_intervals: Vec<(usize, usize)>,
    /// Requested absolute frame indices served by each run.
    pub valid_frames: Vec<Vec<i64>>,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SamplingError {
    #[error("row list must be non-empty")]
    EmptyRows,
    #[error("row {row} is out of range for table with {num_rows} rows")]
    RowOutOfRange { row: i64, num_rows: i64 },
    #[error("rows must be ascending (saw {prev} then {next})")]
    NonAscendingRows { prev: i64, next: i64 },
    #[error("need at least two keyframe positions (including the sentinel), got {0}")]
    TooFewKeyframes(usize),
    #[error("frame {frame} precedes the first keyframe at {first}")]
    FrameBeforeFirstKeyframe { frame: i64, first: i64 },
    #[error("frame {frame} is at or past the frame-count sentinel {sentinel}")]
    FrameOutOfRange { frame: i64, sentinel: i64 },
}

/// Decomposes an ascending row list into per-item runs.
///
/// Produces one entry per contiguous run of rows sharing the same item. Item
/// lookup is a linear scan over `end_rows`; tables are small in item count.
pub fn slice_into_row_intervals(
    table: &TableMetadata,
    rows: &[i64],
) -> Result<RowIntervals, SamplingError> {
    let Some(&first_row) = rows.first() else {
        return Err(SamplingError::EmptyRows);
    };
    let end_rows = table.end_rows.as_slice();
    let num_rows = table.num_rows();

    let mut prev = first_row;
    for &row in rows {
        if row < prev {
            return Err(SamplingError::NonAscendingRows { prev, next: row });
        }
        if row < 0 || row >= num_rows {
            return Err(SamplingError::RowOutOfRange { row, num_rows });
        }
        prev = row;
    }

    // Every row is < end_rows.last() here, so the scan always terminates.
    let item_of = |row: i64| -> usize {
        let mut item = 0;
        while end_rows[item] <= row {
            item += 1;
        }
        item
    };
    let offset_of = |row: i64, item: usize| -> i64 {
        if item == 0 {
            row
        } else {
            row - end_rows[item - 1]
        }
    };

    let mut info = RowIntervals::default();
    let mut current_item = item_of(first_row);
    let mut item_start = offset_of(first_row, current_item);
    let mut item_end = item_start + 1;
    let mut valid: Vec<i64> = Vec::new();
    for &row in rows {
        let item = item_of(row);
        let offset = offset_of(row, item);
        if item != current_item {
            info.item_ids.push(current_item as i32);
            info.item_intervals.push((item_start, item_end));
            info.valid_offsets.push(std::mem::take(&mut valid));
            current_item = item;
            item_start = offset;
        }
        valid.push(offset);
        item_end = offset + 1;
    }
    info.item_ids.push(current_item as i32);
    info.item_intervals.push((item_start, item_end));
    info.valid_offsets.push(valid);
    Ok(info)
}

/// Computes the minimum set of contiguous keyframe runs covering `rows`.
///
/// `keyframe_positions` must carry the frame-count sentinel as its last entry
/// (the video-index reader appends it), so every valid frame falls in some
/// `[k_i, k_{i+1})`. A new run opens whenever a requested row skips at least
/// one whole keyframe run; the final run ends at the first keyframe strictly
/// greater than the last row, giving the decoder a trailing terminator.
pub fn slice_into_video_intervals(
    keyframe_positions: &[i64],
    rows: &[i64],
) -> Result<VideoIntervals, SamplingError> {
    if keyframe_positions.len() < 2 {
        return Err(SamplingError::TooFewKeyframes(keyframe_positions.len()));
    }
    let Some(&first_row) = rows.first() else {
        return Err(SamplingError::EmptyRows);
    };
    let first_keyframe = keyframe_positions[0];
    let sentinel = keyframe_positions[keyframe_positions.len() - 1];

    let mut prev = first_row;
    for &row in rows {
        if row < prev {
            return Err(SamplingError::NonAscendingRows { prev, next: row });
        }
        if row < first_keyframe {
            return Err(SamplingError::FrameBeforeFirstKeyframe {
                frame: row,
                first: first_keyframe,
            });
        }
        if row >= sentinel {
            return Err(SamplingError::FrameOutOfRange {
                frame: row,
                sentinel,
            });
        }
        prev = row;
    }

    let mut info = VideoIntervals::default();
    let mut start_keyframe_index = 0usize;
    let mut end_keyframe_index = 1usize;
    let mut next_keyframe = keyframe_positions[end_keyframe_index];
    let mut valid_frames: Vec<i64> = Vec::new();
    for &row in rows {
        if row >= next_keyframe {
            // The row validation above guarantees the index never runs off
            // the sentinel tail.
            end_keyframe_index += 1;
            next_keyframe = keyframe_positions[end_keyframe_index];
            if row >= next_keyframe {
                // Skipped a whole keyframe run; emit the current one.
                if !valid_frames.is_empty() {
                    info.keyframe_index_intervals
                        .push((start_keyframe_index, end_keyframe_index - 1));
                    info.valid_frames.push(std::mem::take(&mut valid_frames));
                }

                while row >= keyframe_positions[end_keyframe_index] {
                    end_keyframe_index += 1;
                }
                valid_frames.clear();
                start_keyframe_index = end_keyframe_index - 1;
                next_keyframe = keyframe_positions[end_keyframe_index];
            }
        }
        valid_frames.push(row);
    }
    info.keyframe_index_intervals
        .push((start_keyframe_index, end_keyframe_index));
    info.valid_frames.push(valid_frames);
    Ok(info)
}
