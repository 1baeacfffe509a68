pub mod augmentation;
pub mod class_weights;
pub mod dataset;
pub mod evaluation;
pub mod inference;
pub mod ml_model;
pub mod preprocess;
pub mod training;

pub use augmentation::{AugmentationConfig, AugmentationPreset, Augmenter};
pub use class_weights::compute_class_weights;
pub use dataset::{DatasetSplits, FreshBatch, FreshBatcher, FreshDataset, ImageSample};
pub use evaluation::{evaluate_dataset, evaluate_saved_model, EvaluationReport, SamplePrediction};
pub use inference::{load_classifier, InferenceEngine, InferenceService, Prediction};
pub use ml_model::{FreshnessClassifier, ModelConfig};
pub use preprocess::{decode_image, prepare_image, ImageTensor, IMAGE_SIZE};
pub use training::{train_model, EarlyStopping, Trainer, TrainerState, TrainingOptions, TrainingReport};
