//! kiln-core: shared types for the Kiln build service.
//!
//! Holds the build request/response model, request validation, the
//! tsuru.yaml schema, the label and annotation keys written onto worker
//! pods and statefulsets, the progress `OutputWriter`, and the traits
//! behind which the remote build engine lives.

pub mod config;
pub mod engine;
pub mod error;
pub mod metadata;
pub mod output;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod tsuru_yaml;
pub mod types;
pub mod validation;

pub use config::{KilnConfig, parse_duration};
pub use engine::{
    BuildEngine, EngineConnector, EngineError, Export, ImageInspector, PruneFilters,
    SecretSource, SolveOptions, SolveResponse, engine_address,
};
pub use error::Code;
pub use output::OutputWriter;
pub use tsuru_yaml::TsuruYamlData;
pub use types::*;
pub use validation::{ValidationError, validate_build_request};
