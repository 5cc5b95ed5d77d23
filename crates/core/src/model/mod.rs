//! Model files, engines, and the catalog that names them.

pub mod backend;
pub mod conv;
pub mod descriptor;
pub mod onnx;
pub mod registry;
pub mod store;

pub use backend::InferenceBackend;
pub use conv::ConvStack;
pub use descriptor::{LayerDescriptor, ModelDescriptor};
pub use onnx::OnnxEngine;
pub use registry::{ModelEntry, ModelFormat, ModelKind, ModelRegistry, ModelSource};
pub use store::{ModelStore, StoreConfig};
