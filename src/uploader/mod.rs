pub mod batch;
pub mod engine;

pub use batch::{BatchOptions, BatchResult, BatchUploader, FailedUpload, UploadedFile};
pub use engine::{guess_mime, UploadEngine, UploadOptions, UploadSource};
