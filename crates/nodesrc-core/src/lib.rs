pub mod cache;
pub mod error;
pub mod fetch;
pub mod manifest;
pub mod metadata;
pub mod node_headers;
pub mod paths;
pub mod providers;
pub mod reporter;
pub mod scheduler;
pub mod special;

pub use cache::{Cache, FilesystemCache, NullCache};
pub use error::{CacheError, FetchError, GenerateError, ManifestError, ParseError};
pub use fetch::{Fetcher, HttpFetcher, StubFetcher};
pub use manifest::ManifestGenerator;
pub use paths::*;
pub use reporter::{NullReporter, Reporter};
pub use scheduler::{GenerationSummary, Scheduler};

/// User Agent string for registry and mirror requests
pub const USER_AGENT: &str = concat!("nodesrc/", env!("CARGO_PKG_VERSION"));
