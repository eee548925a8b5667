pub mod access_log;
pub mod backend;
pub mod context;
pub mod dispatcher;
pub mod health;
pub mod response;

pub use access_log::AccessLogRecord;
pub use backend::{BackendMeta, BackendRecord, BackendUrl};
pub use context::{ClientConnection, ConnectionStats, RequestContext, RequestTimer};
pub use dispatcher::{DispatchConfig, Dispatcher};
pub use response::{ResponseWrapper, SynthesizedError};
