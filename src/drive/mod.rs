// 远程存储 API 模块

pub mod client;
pub mod file_id;
pub mod transport;
pub mod types;

pub use client::DriveClient;
pub use file_id::extract_remote_id;
pub use transport::{
    BodyStream, ByteStream, HttpRequest, HttpResponse, HttpTransport, RequestBody,
    ReqwestTransport,
};
pub use types::{
    ApiErrorBody, DriveFile, FileList, FileMetadata, ListParams, Permission, TokenResponse,
    DEFAULT_EXPORT_MIME, FOLDER_MIME_TYPE,
};
