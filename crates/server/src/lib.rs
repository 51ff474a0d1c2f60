pub mod proxy;
pub mod registry;
pub mod service;

pub use proxy::{ProxyContext, ProxyServer};
pub use registry::{StreamEntry, StreamRegistry};
pub use service::{AnimeService, ServiceError, StreamHandle};
