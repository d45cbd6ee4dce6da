pub mod resolver;

pub use resolver::{resolution_for_tag, MediaResolver, StreamVariant, VideoInfo};
