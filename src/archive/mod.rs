//! Package archives: assembling `.tar.gz` bundles and unpacking fetched ones.

mod builder;
mod extract;

pub use builder::{ArchiveBuilder, ArchiveEntry, BuiltArchive};
pub use extract::{PathPolicy, TarGzExtractor};
