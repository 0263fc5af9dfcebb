//! Path layout under the database root:
//!
//! ```text
//! database.meta                      database metadata
//! tables/<id>/descriptor            table metadata
//! tables/<id>/<col>/<item>          item file (video or row-oriented)
//! tables/<id>/<col>/<item>.video    video descriptor for a video item
//! jobs/<id>/descriptor              job descriptor
//! ```

use vidmill_core::types::{JobId, TableId};

pub fn database_metadata_path() -> String {
    "database.meta".to_string()
}

pub fn table_descriptor_path(table_id: TableId) -> String {
    format!("tables/{}/descriptor", table_id.0)
}

pub fn table_item_path(table_id: TableId, column_id: i32, item_id: i32) -> String {
    format!("tables/{}/{}/{}", table_id.0, column_id, item_id)
}

pub fn video_descriptor_path(table_id: TableId, column_id: i32, item_id: i32) -> String {
    format!("tables/{}/{}/{}.video", table_id.0, column_id, item_id)
}

pub fn job_descriptor_path(job_id: JobId) -> String {
    format!("jobs/{}/descriptor", job_id.0)
}
