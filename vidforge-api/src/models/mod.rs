pub mod common;
pub mod space;
pub mod task;
pub mod upload;

pub use common::SimpleResponse;
pub use space::{
    CheckSpaceRequest, CheckSpaceResponse, CleanupResult, DiskSpaceConfig, DiskUsage,
};
pub use task::{TaskListPage, TaskSnapshot, TaskStatus};
pub use upload::{
    ChunkUploadResponse, CompleteUploadResponse, ConversionParams, InitUploadRequest,
    InitUploadResponse, UploadStatusResponse,
};
