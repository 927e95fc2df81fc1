//! Speaker-embedding training harness
//!
//! Reads a YAML training config, resolves every pluggable component through
//! string-keyed registries and drives the training loop.

pub mod builder;
pub mod data;
pub mod env;
pub mod exp_manager;
pub mod observe;
pub mod pipeline;
pub mod registry;
pub mod supported;

pub use builder::{ComponentBuilder, SplitLoaders};
pub use data::{
    get_eval_loader, get_train_loader, DataError, EvalLoader, LoaderKind, MlsrDataset, Subset,
    TrainLoader,
};
pub use env::setup_env_vars;
pub use exp_manager::{exp_manager, ExperimentDirs};
pub use observe::{BuildEvent, BuildObserver, Outcome, RecordingObserver, TracingObserver};
pub use pipeline::{run, train};
pub use registry::Registry;
pub use supported::{Registries, MODEL_CHECKPOINT};
