mod blob;
mod dtype;
mod error;

pub use blob::Blob;
pub use dtype::{from_type_name, sizeof, type_name};
pub use error::{functions::*, CommError, CommErrorKind};
