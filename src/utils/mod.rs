pub mod shutdown;

pub use shutdown::{MasterSignal, MasterSignals, ignore_worker_signals};
