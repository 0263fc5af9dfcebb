//! Contract with the external video-ingest subsystem. The master only
//! forwards the request and reports per-path failures; transcoding and
//! keyframe indexing happen behind this trait.

use crate::error::EngineError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedVideo {
    pub path: String,
    pub message: String,
}

pub trait VideoIngest: Send + Sync {
    fn ingest(
        &self,
        table_names: &[String],
        video_paths: &[String],
    ) -> Result<Vec<FailedVideo>, EngineError>;
}

/// Stand-in when no ingest subsystem is wired up: every path fails.
pub struct DisabledIngest;

impl VideoIngest for DisabledIngest {
    fn ingest(
        &self,
        _table_names: &[String],
        video_paths: &[String],
    ) -> Result<Vec<FailedVideo>, EngineError> {
        Ok(video_paths
            .iter()
            .map(|path| FailedVideo {
                path: path.clone(),
                message: "video ingest is not configured on this master".to_string(),
            })
            .collect())
    }
}
