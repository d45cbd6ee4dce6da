pub mod engine;

pub use engine::{DownloadEngine, DownloadOutput, DownloadTarget};
