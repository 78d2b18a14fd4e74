//! Network collaborators for bucketpub: Cloud Storage, plain HTTP sources and
//! an HTTP push bus, all sharing one client and runtime.

pub mod gcs;
pub mod http_bus;
pub mod http_source;
pub mod stream;

pub use gcs::{CloudStorage, CloudStorageMetadata, CloudStorageSource};
pub use http_bus::HttpBus;
pub use http_source::HttpSource;
pub use stream::{HttpConfig, SHARED_RUNTIME, StreamError, http_client, http_config, set_http_config};
