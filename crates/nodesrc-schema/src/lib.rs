pub mod arch;
pub mod integrity;
pub mod package;
pub mod source;

// Re-exports
pub use arch::*;
pub use integrity::{HashAlgorithm, Integrity, IntegrityBuilder, IntegrityError};
pub use package::*;
pub use source::*;
