//! Parallel block-header synchronisation engine for Dash SPV clients.

pub mod backoff;
pub mod constants;
pub mod header_sync;
pub mod logging;
pub mod settings;
pub mod spv;
pub mod transport;
pub mod tx_sync;
pub mod types;
