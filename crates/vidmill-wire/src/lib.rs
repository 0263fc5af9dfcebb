#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::expect_used, clippy::unwrap_used))]

//! Lossless conversions between `vidmill-core` values and `vidmill-proto`
//! wire messages. Wire→core goes through `TryToCore` because the wire side
//! can carry missing fields, unknown enum values, and undecodable sampling
//! args.

use prost::Message;

use vidmill_core::types as core;
use vidmill_proto::v1 as wire;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConvertError {
    #[error("{field} must be non-empty")]
    EmptyField { field: &'static str },
    #[error("{field} is required")]
    MissingField { field: &'static str },
    #[error("{field} carries unknown enum value {value}")]
    UnknownEnumValue { field: &'static str, value: i32 },
    #[error("unknown sampling function {0}")]
    UnknownSamplingFunction(String),
    #[error("sampling args for {function} failed to decode: {source}")]
    BadSamplingArgs {
        function: String,
        #[source]
        source: prost::DecodeError,
    },
}

fn non_empty(field: &'static str, value: &str) -> Result<(), ConvertError> {
    if value.trim().is_empty() {
        return Err(ConvertError::EmptyField { field });
    }
    Ok(())
}

pub trait ToWire<T> {
    fn to_wire(&self) -> T;
}

pub trait ToCore<T> {
    fn to_core(&self) -> T;
}

pub trait TryToCore<T> {
    type Error;
    fn try_to_core(&self) -> Result<T, Self::Error>;
}

impl ToWire<i32> for core::ColumnType {
    fn to_wire(&self) -> i32 {
        match self {
            core::ColumnType::Other => wire::ColumnType::Other as i32,
            core::ColumnType::Video => wire::ColumnType::Video as i32,
        }
    }
}

fn column_type_to_core(value: i32) -> Result<core::ColumnType, ConvertError> {
    match wire::ColumnType::try_from(value) {
        Ok(wire::ColumnType::Other) => Ok(core::ColumnType::Other),
        Ok(wire::ColumnType::Video) => Ok(core::ColumnType::Video),
        Err(_) => Err(ConvertError::UnknownEnumValue {
            field: "column_type",
            value,
        }),
    }
}

impl ToWire<i32> for core::DeviceType {
    fn to_wire(&self) -> i32 {
        match self {
            core::DeviceType::Cpu => wire::DeviceType::Cpu as i32,
            core::DeviceType::Gpu => wire::DeviceType::Gpu as i32,
        }
    }
}

fn device_type_to_core(value: i32) -> Result<core::DeviceType, ConvertError> {
    match wire::DeviceType::try_from(value) {
        Ok(wire::DeviceType::Cpu) => Ok(core::DeviceType::Cpu),
        Ok(wire::DeviceType::Gpu) => Ok(core::DeviceType::Gpu),
        Err(_) => Err(ConvertError::UnknownEnumValue {
            field: "device_type",
            value,
        }),
    }
}

impl ToWire<wire::Column> for core::Column {
    fn to_wire(&self) -> wire::Column {
        wire::Column {
            id: self.id,
            name: self.name.clone(),
            column_type: self.column_type.to_wire(),
        }
    }
}

impl TryToCore<core::Column> for wire::Column {
    type Error = ConvertError;

    fn try_to_core(&self) -> Result<core::Column, Self::Error> {
        Ok(core::Column {
            id: self.id,
            name: self.name.clone(),
            column_type: column_type_to_core(self.column_type)?,
        })
    }
}

/// Encodes a sampling function into the `(name, args)` pair carried on the
/// wire. "All" has no args payload.
pub fn sampling_to_wire(sampling: &core::SamplingFunction) -> (String, Vec<u8>) {
    let name = sampling.name().to_string();
    let args = match sampling {
        core::SamplingFunction::All => Vec::new(),
        core::SamplingFunction::Strided { stride } => {
            wire::StridedArgs { stride: *stride }.encode_to_vec()
        }
        core::SamplingFunction::Range { start, end } => wire::RangeArgs {
            start: *start,
            end: *end,
        }
        .encode_to_vec(),
        core::SamplingFunction::Gather { rows } => {
            wire::GatherArgs { rows: rows.clone() }.encode_to_vec()
        }
    };
    (name, args)
}

pub fn sampling_to_core(
    function: &str,
    args: &[u8],
) -> Result<core::SamplingFunction, ConvertError> {
    let bad_args = |source| ConvertError::BadSamplingArgs {
        function: function.to_string(),
        source,
    };
    match function {
        "All" => Ok(core::SamplingFunction::All),
        "Strided" => {
            let decoded = wire::StridedArgs::decode(args).map_err(bad_args)?;
            Ok(core::SamplingFunction::Strided {
                stride: decoded.stride,
            })
        }
        "Range" => {
            let decoded = wire::RangeArgs::decode(args).map_err(bad_args)?;
            Ok(core::SamplingFunction::Range {
                start: decoded.start,
                end: decoded.end,
            })
        }
        "Gather" => {
            let decoded = wire::GatherArgs::decode(args).map_err(bad_args)?;
            Ok(core::SamplingFunction::Gather { rows: decoded.rows })
        }
        other => Err(ConvertError::UnknownSamplingFunction(other.to_string())),
    }
}

impl ToWire<wire::TableSample> for core::TableSample {
    fn to_wire(&self) -> wire::TableSample {
        let (sampling_function, sampling_args) = sampling_to_wire(&self.sampling);
        wire::TableSample {
            table_name: self.table_name.clone(),
            column_names: self.column_names.clone(),
            sampling_function,
            sampling_args,
        }
    }
}

impl TryToCore<core::TableSample> for wire::TableSample {
    type Error = ConvertError;

    fn try_to_core(&self) -> Result<core::TableSample, Self::Error> {
        non_empty("table_name", &self.table_name)?;
        Ok(core::TableSample {
            table_name: self.table_name.clone(),
            column_names: self.column_names.clone(),
            sampling: sampling_to_core(&self.sampling_function, &self.sampling_args)?,
        })
    }
}

impl ToWire<wire::Task> for core::Task {
    fn to_wire(&self) -> wire::Task {
        wire::Task {
            output_table_name: self.output_table_name.clone(),
            samples: self.samples.iter().map(ToWire::to_wire).collect(),
        }
    }
}

impl TryToCore<core::Task> for wire::Task {
    type Error = ConvertError;

    fn try_to_core(&self) -> Result<core::Task, Self::Error> {
        Ok(core::Task {
            output_table_name: self.output_table_name.clone(),
            samples: self
                .samples
                .iter()
                .map(TryToCore::try_to_core)
                .collect::<Result<_, _>>()?,
        })
    }
}

impl ToWire<wire::Op> for core::OpNode {
    fn to_wire(&self) -> wire::Op {
        wire::Op {
            name: self.name.clone(),
            inputs: self
                .inputs
                .iter()
                .map(|input| wire::OpInput {
                    op_index: input.op_index,
                    columns: input.columns.clone(),
                })
                .collect(),
            device_type: self.device.to_wire(),
        }
    }
}

impl TryToCore<core::OpNode> for wire::Op {
    type Error = ConvertError;

    fn try_to_core(&self) -> Result<core::OpNode, Self::Error> {
        non_empty("op.name", &self.name)?;
        Ok(core::OpNode {
            name: self.name.clone(),
            device: device_type_to_core(self.device_type)?,
            inputs: self
                .inputs
                .iter()
                .map(|input| core::OpInput {
                    op_index: input.op_index,
                    columns: input.columns.clone(),
                })
                .collect(),
        })
    }
}

impl ToWire<wire::TaskSet> for core::TaskSet {
    fn to_wire(&self) -> wire::TaskSet {
        wire::TaskSet {
            tasks: self.tasks.iter().map(ToWire::to_wire).collect(),
            ops: self.ops.iter().map(ToWire::to_wire).collect(),
        }
    }
}

impl TryToCore<core::TaskSet> for wire::TaskSet {
    type Error = ConvertError;

    fn try_to_core(&self) -> Result<core::TaskSet, Self::Error> {
        Ok(core::TaskSet {
            tasks: self
                .tasks
                .iter()
                .map(TryToCore::try_to_core)
                .collect::<Result<_, _>>()?,
            ops: self
                .ops
                .iter()
                .map(TryToCore::try_to_core)
                .collect::<Result<_, _>>()?,
        })
    }
}

impl ToWire<wire::IoItem> for core::IoItem {
    fn to_wire(&self) -> wire::IoItem {
        wire::IoItem {
            item_id: self.item_id,
            table_id: self.table_id.0,
            start_row: self.start_row,
            end_row: self.end_row,
        }
    }
}

impl ToCore<core::IoItem> for wire::IoItem {
    fn to_core(&self) -> core::IoItem {
        core::IoItem {
            item_id: self.item_id,
            table_id: core::TableId(self.table_id),
            start_row: self.start_row,
            end_row: self.end_row,
        }
    }
}

impl ToWire<wire::LoadSample> for core::LoadSampleRows {
    fn to_wire(&self) -> wire::LoadSample {
        wire::LoadSample {
            table_id: self.table_id.0,
            column_ids: self.column_ids.clone(),
            warmup_rows: self.warmup_rows.clone(),
            rows: self.rows.clone(),
        }
    }
}

impl ToCore<core::LoadSampleRows> for wire::LoadSample {
    fn to_core(&self) -> core::LoadSampleRows {
        core::LoadSampleRows {
            table_id: core::TableId(self.table_id),
            column_ids: self.column_ids.clone(),
            warmup_rows: self.warmup_rows.clone(),
            rows: self.rows.clone(),
        }
    }
}

impl ToWire<wire::NewWork> for core::WorkUnit {
    fn to_wire(&self) -> wire::NewWork {
        wire::NewWork {
            io_item: Some(self.io_item.to_wire()),
            load_work: Some(wire::LoadWorkEntry {
                io_item_index: self.io_item.item_id,
                samples: self.samples.iter().map(ToWire::to_wire).collect(),
            }),
        }
    }
}

impl TryToCore<core::WorkUnit> for wire::NewWork {
    type Error = ConvertError;

    fn try_to_core(&self) -> Result<core::WorkUnit, Self::Error> {
        let io_item = self
            .io_item
            .as_ref()
            .ok_or(ConvertError::MissingField { field: "io_item" })?;
        let samples = self
            .load_work
            .as_ref()
            .map(|work| work.samples.iter().map(ToCore::to_core).collect())
            .unwrap_or_default();
        Ok(core::WorkUnit {
            io_item: io_item.to_core(),
            samples,
        })
    }
}

impl ToWire<wire::TableDescriptor> for core::TableMetadata {
    fn to_wire(&self) -> wire::TableDescriptor {
        wire::TableDescriptor {
            id: self.id.0,
            name: self.name.clone(),
            job_id: self.job_id.map(|id| id.0),
            timestamp: self.timestamp,
            end_rows: self.end_rows.clone(),
            columns: self.columns.iter().map(ToWire::to_wire).collect(),
        }
    }
}

impl TryToCore<core::TableMetadata> for wire::TableDescriptor {
    type Error = ConvertError;

    fn try_to_core(&self) -> Result<core::TableMetadata, Self::Error> {
        non_empty("table.name", &self.name)?;
        Ok(core::TableMetadata {
            id: core::TableId(self.id),
            name: self.name.clone(),
            job_id: self.job_id.map(core::JobId),
            timestamp: self.timestamp,
            end_rows: self.end_rows.clone(),
            columns: self
                .columns
                .iter()
                .map(TryToCore::try_to_core)
                .collect::<Result<_, _>>()?,
        })
    }
}

impl ToWire<wire::DatabaseDescriptor> for core::DatabaseMetadata {
    fn to_wire(&self) -> wire::DatabaseDescriptor {
        wire::DatabaseDescriptor {
            next_table_id: self.next_table_id,
            next_job_id: self.next_job_id,
            table_ids: self
                .table_ids
                .iter()
                .map(|(name, id)| (name.clone(), id.0))
                .collect(),
            job_names: self.job_names.iter().cloned().collect(),
        }
    }
}

impl ToCore<core::DatabaseMetadata> for wire::DatabaseDescriptor {
    fn to_core(&self) -> core::DatabaseMetadata {
        core::DatabaseMetadata {
            next_table_id: self.next_table_id,
            next_job_id: self.next_job_id,
            table_ids: self
                .table_ids
                .iter()
                .map(|(name, id)| (name.clone(), core::TableId(*id)))
                .collect(),
            job_names: self.job_names.iter().cloned().collect(),
        }
    }
}

impl ToWire<wire::VideoDescriptor> for core::VideoMetadata {
    fn to_wire(&self) -> wire::VideoDescriptor {
        wire::VideoDescriptor {
            table_id: self.table_id.0,
            column_id: self.column_id,
            item_id: self.item_id,
            width: self.width,
            height: self.height,
            frames: self.frames,
            keyframe_positions: self.keyframe_positions.clone(),
            keyframe_byte_offsets: self.keyframe_byte_offsets.clone(),
        }
    }
}

impl ToCore<core::VideoMetadata> for wire::VideoDescriptor {
    fn to_core(&self) -> core::VideoMetadata {
        core::VideoMetadata {
            table_id: core::TableId(self.table_id),
            column_id: self.column_id,
            item_id: self.item_id,
            width: self.width,
            height: self.height,
            frames: self.frames,
            keyframe_positions: self.keyframe_positions.clone(),
            keyframe_byte_offsets: self.keyframe_byte_offsets.clone(),
        }
    }
}

impl ToWire<wire::JobDescriptor> for core::JobMetadata {
    fn to_wire(&self) -> wire::JobDescriptor {
        wire::JobDescriptor {
            id: self.id.0,
            name: self.name.clone(),
            io_item_size: self.io_item_size,
            work_item_size: self.work_item_size,
            num_nodes: self.num_nodes,
            tasks: self.tasks.iter().map(ToWire::to_wire).collect(),
            columns: self.columns.iter().map(ToWire::to_wire).collect(),
        }
    }
}

impl TryToCore<core::JobMetadata> for wire::JobDescriptor {
    type Error = ConvertError;

    fn try_to_core(&self) -> Result<core::JobMetadata, Self::Error> {
        non_empty("job.name", &self.name)?;
        Ok(core::JobMetadata {
            id: core::JobId(self.id),
            name: self.name.clone(),
            io_item_size: self.io_item_size,
            work_item_size: self.work_item_size,
            num_nodes: self.num_nodes,
            tasks: self
                .tasks
                .iter()
                .map(TryToCore::try_to_core)
                .collect::<Result<_, _>>()?,
            columns: self
                .columns
                .iter()
                .map(TryToCore::try_to_core)
                .collect::<Result<_, _>>()?,
        })
    }
}
