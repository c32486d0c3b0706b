pub mod error;
pub mod package;

pub use error::{Error, Result};
pub use package::{Change, Package};
pub use package::compression::CompressionKind;
pub use package::header::PackageHeader;
pub use package::index::{IndexEntry, IndexLayout, PackageIndex, ResourceKey};
pub use package::options::{CancelToken, Limits, OpenOptions};
pub use package::resource::{GenericResource, NameMapEntry, NameMapResource, Resource, ResourceRegistry};
