pub mod access_log;
pub mod backend_directory;
pub mod upstream;

pub use access_log::{AccessLogSink, MemoryAccessLog};
pub use backend_directory::{BackendDirectory, DirectoryError, ResolveError, SniRow};
pub use upstream::{UpstreamClient, UpstreamError, UpstreamResult, UpstreamTarget};
