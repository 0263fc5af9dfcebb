use std::collections::HashMap;

use vidmill_core::task_sampler::TaskSampler;
use vidmill_core::types::{
    Column, ColumnType, SamplingFunction, TableId, TableMetadata, TableSample, Task, WorkUnit,
};

fn metas() -> HashMap<String, TableMetadata> {
    let mut m = HashMap::new();
    m.insert(
        "clips".to_string(),
        TableMetadata {
            id: TableId(1),
            name: "clips".to_string(),
            job_id: None,
            timestamp: 0,
            end_rows: vec![40, 100],
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
        },
    );
    m
}

fn strided_task(stride: i64) -> Task {
    Task {
        output_table_name: "edges".to_string(),
        samples: vec![TableSample {
            table_name: "clips".to_string(),
            column_names: vec!["frame".to_string(), "frame_info".to_string()],
            sampling: SamplingFunction::Strided { stride },
        }],
    }
}

fn drain(mut sampler: TaskSampler) -> Vec<WorkUnit> {
    let mut units = Vec::new();
    while let Some(unit) = sampler.next_work().unwrap() {
        units.push(unit);
    }
    units
}

#[test]
fn identical_inputs_yield_identical_unit_sequences() {
    let metas = metas();
    let task = strided_task(3);
    let a = drain(TaskSampler::new(&metas, &task, TableId(7), 8, 2));
    let b = drain(TaskSampler::new(&metas, &task, TableId(7), 8, 2));
    assert_eq!(a, b);
    assert!(!a.is_empty());
}

#[test]
fn unit_count_matches_total_samples() {
    let metas = metas();
    let task = strided_task(3);
    let sampler = TaskSampler::new(&metas, &task, TableId(7), 8, 0);
    let total = sampler.total_samples();
    let units = drain(sampler.clone());
    assert_eq!(units.len() as i64, total);

    // After exhaustion every further call keeps returning no work.
    let mut sampler = sampler;
    for _ in 0..total {
        assert!(sampler.next_work().unwrap().is_some());
    }
    for _ in 0..3 {
        assert_eq!(sampler.next_work().unwrap(), None);
    }
}

#[test]
fn units_cover_the_enumeration_in_order_without_duplicates() {
    let metas = metas();
    let task = strided_task(7);
    let units = drain(TaskSampler::new(&metas, &task, TableId(7), 4, 0));

    let expected: Vec<i64> = (0..100).step_by(7).collect();
    let mut seen = Vec::new();
    let mut next_start = 0;
    for (i, unit) in units.iter().enumerate() {
        assert_eq!(unit.io_item.item_id, i as i64);
        assert_eq!(unit.io_item.start_row, next_start);
        assert!(unit.io_item.num_rows() <= 4);
        next_start = unit.io_item.end_row;
        seen.extend(unit.samples[0].rows.iter().copied());
    }
    assert_eq!(seen, expected);
}

#[test]
fn output_row_numbering_is_enumeration_indexed() {
    let metas = metas();
    let task = strided_task(10);
    let units = drain(TaskSampler::new(&metas, &task, TableId(7), 4, 0));
    // 10 enumerated rows in units of 4 -> output end_rows 4, 8, 10.
    let end_rows: Vec<i64> = units.iter().map(|u| u.io_item.end_row).collect();
    assert_eq!(end_rows, vec![4, 8, 10]);
}
