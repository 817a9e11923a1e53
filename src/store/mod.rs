//! Static configuration: the data model and the validated registry.
pub mod functions;
pub mod registry;
pub mod types;

#[cfg(test)]
pub(crate) mod test_support;

pub use functions::FunctionTable;
pub use registry::{Registry, RegistryDocument};
pub use types::*;
