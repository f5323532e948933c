//! Model downloads
//!
//! Module structure:
//! - types.rs: DownloadKey, DownloadTask, DownloadProgress
//! - transport.rs: Transport trait and the reqwest-backed HttpTransport
//! - coordinator.rs: DownloadCoordinator (per-key dedup, cancel, cleanup)

pub mod types;
pub mod transport;
pub mod coordinator;

pub use types::{DownloadKey, DownloadProgress, DownloadSnapshot, DownloadStatus, DownloadTask};
pub use transport::{ByteStream, HttpTransport, Transport, TransferBody};
pub use coordinator::{DownloadCoordinator, DownloadHandle};
