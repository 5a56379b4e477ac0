//! Restore a trained image classifier from a checkpoint once, then run
//! repeated batched top-k predictions over it.

pub mod checkpoint;
pub mod config;
pub mod discovery;
pub mod error;
pub mod model;
pub mod ops;
pub mod predictor;
pub mod session;

pub use checkpoint::{load_checkpoint, save_checkpoint, Activation, Checkpoint, GraphDef, LayerDef};
pub use config::PredictorConfig;
pub use discovery::get_all_models;
pub use error::{Error, Result};
pub use model::{ClassifierNet, GraphBuilder};
pub use ops::TopK;
pub use predictor::CnnPredictor;
pub use session::Session;
