//! Model catalog
//!
//! Module structure:
//! - types.rs: ModelDescriptor, Provenance, remote search types
//! - id.rs: stable ids derived from (repo, file)
//! - registry.rs: curated model table including the bundled model
//! - remote.rs: RemoteCatalog trait and the HuggingFace Hub client
//! - manager.rs: ModelCatalog (disk scan, lookup, recommendation)

pub mod types;
pub mod id;
pub mod registry;
pub mod remote;
pub mod manager;

pub use types::{ModelDescriptor, Provenance, RecommendationTiers, RemoteFile, RemoteModel, RemoteSource};
pub use id::{derive_model_id, local_file_name};
pub use registry::{known_models, BUNDLED_MODEL_ID};
pub use remote::{HuggingFaceCatalog, RemoteCatalog, DEFAULT_REMOTE_BASE_URL};
pub use manager::ModelCatalog;
