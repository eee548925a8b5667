pub mod access_log_file;
pub mod connection;
pub mod file_directory;
pub mod http_client;
pub mod ipc;
pub mod tls;
pub mod websocket;

pub use access_log_file::AccessLogFile;
pub use connection::{ConnectionHandle, ConnectionSupervisor, SupervisedStream};
pub use file_directory::FileDirectory;
pub use http_client::HttpClientAdapter;
pub use ipc::{IpcChannel, WorkerMessage};
pub use tls::TlsContextRegistry;
pub use websocket::UpgradeProxy;
