mod registry;

pub use registry::{ModelCatalog, ModelSpec};
