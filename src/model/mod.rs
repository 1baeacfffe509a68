pub mod class_indices;
pub mod config;
pub mod model_metadata;
pub mod model_storage;

pub use class_indices::{class_indices_path, format_label, is_fresh_label, ClassIndexMapping, UNKNOWN_LABEL};
pub use config::{AppConfig, DeviceType, ModelSettings, ServerSettings, TrainingSettings};
pub use model_metadata::{ModelMetadata, StopReason};
pub use model_storage::{load_metadata, load_model_with_metadata, model_artifact_path, save_model_with_metadata};
