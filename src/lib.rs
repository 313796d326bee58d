pub mod archive;
pub mod deadline;
pub mod manager;
pub mod package;
pub mod remote;
pub mod resolver;
pub mod runtime;
pub mod settings;
pub mod transfer;

pub use manager::{PackageManager, PublishReport};
pub use settings::ServerSettings;
