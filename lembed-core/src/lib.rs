// lembed-core: model registry and embedding engine behind the lembed SQL functions.

pub mod chunks;
pub mod config;
pub mod embedding;
pub mod model;
pub mod options;
pub mod registry;

// Test utilities - always available for use by lembed-sqlite and tests
pub mod testutil;

pub use embedding::{EmbedError, Embedding, engine::embed};
pub use model::{Model, ModelSource};
pub use options::{ModelOptions, PoolingType};
pub use registry::ModelRegistry;
