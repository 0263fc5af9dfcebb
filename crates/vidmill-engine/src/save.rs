//! Save stage: restores sampling order and writes output item files.
//!
//! Entries arrive in completion order because load/eval threads race; a
//! min-heap keyed by the puller's dense per-worker sequence number releases a
//! unit only when all its predecessors have been released. The master hands
//! units out in `io_item_index` order, so releasing in pull order emits rows
//! in sampling order regardless of which thread finished first. Each
//! released unit becomes one row-oriented item file per output column.

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;

use crossbeam::channel::Receiver;
use tracing::debug;

use vidmill_core::types::{IoItem, TableId};
use vidmill_store::{paths, retry, StorageBackend};

use crate::error::EngineError;

struct PendingUnit {
    seq: u64,
    table_id: TableId,
    item_id: i64,
    columns: Vec<Vec<Vec<u8>>>,
}

impl PartialEq for PendingUnit {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}

impl Eq for PendingUnit {}

impl PartialOrd for PendingUnit {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PendingUnit {
    fn cmp(&self, other: &Self) -> Ordering {
        self.seq.cmp(&other.seq)
    }
}

pub struct SaveWorker {
    node_id: i32,
    storage: Box<dyn StorageBackend>,
    pending: BinaryHeap<Reverse<PendingUnit>>,
    next_seq: u64,
}

impl SaveWorker {
    pub fn new(node_id: i32, storage: Box<dyn StorageBackend>) -> Self {
        Self {
            node_id,
            storage,
            pending: BinaryHeap::new(),
            next_seq: 0,
        }
    }

    pub fn run(
        mut self,
        work: Receiver<(u64, IoItem, Vec<Vec<Vec<u8>>>)>,
    ) -> Result<(), EngineError> {
        while let Ok((seq, io_item, columns)) = work.recv() {
            self.pending.push(Reverse(PendingUnit {
                seq,
                table_id: io_item.table_id,
                item_id: io_item.item_id,
                columns,
            }));
            self.release_ready()?;
        }
        if !self.pending.is_empty() {
            return Err(EngineError::Pipeline(format!(
                "save stage ended with {} unreleased units",
                self.pending.len()
            )));
        }
        debug!(node_id = self.node_id, "save worker finished");
        Ok(())
    }

    fn release_ready(&mut self) -> Result<(), EngineError> {
        while let Some(Reverse(top)) = self.pending.peek() {
            if top.seq != self.next_seq {
                break;
            }
            let Some(Reverse(unit)) = self.pending.pop() else {
                break;
            };
            self.write_item(&unit)?;
            self.next_seq += 1;
        }
        Ok(())
    }

    fn write_item(&self, unit: &PendingUnit) -> Result<(), EngineError> {
        debug!(
            node_id = self.node_id,
            table_id = unit.table_id.0,
            io_item_index = unit.item_id,
            "writing item"
        );
        for (column_id, rows) in unit.columns.iter().enumerate() {
            let path = paths::table_item_path(unit.table_id, column_id as i32, unit.item_id as i32);
            // Write files truncate on creation, so the whole sequence retries
            // as a unit.
            retry::with_backoff(|| {
                let mut file = self.storage.make_write_file(&path)?;
                file.append(&(rows.len() as u64).to_le_bytes())?;
                for row in rows {
                    file.append(&(row.len() as i64).to_le_bytes())?;
                }
                for row in rows {
                    file.append(row)?;
                }
                file.save()
            })?;
        }
        Ok(())
    }
}
