//! Execution-trace recording for keyword-driven automation runs, and the
//! instruction-history builder that turns recorded traces into training
//! examples for an action-prediction model.

pub mod actions;
pub mod bbox;
pub mod classify;
pub mod config;
pub mod dataset;
pub mod error;
pub mod history;
pub mod inference;
pub mod observation;
pub mod persist;
pub mod recorder;
pub mod session;
pub mod stack;
pub mod step;
pub mod surface;

pub use actions::RobotAction;
pub use bbox::BBox;
pub use classify::KeywordEvent;
pub use config::RecorderConfig;
pub use dataset::{FlattenOptions, TrainingExample, build_dataset, flatten_examples};
pub use error::{Result, TraceError};
pub use history::{PromptStep, build_history, history_for};
pub use inference::{AgentCommand, InferenceClient, parse_action};
pub use observation::Observation;
pub use persist::{load_trace, save_trace};
pub use recorder::TraceRecorder;
pub use session::{SessionRecorder, SessionRegistry};
pub use stack::ExecutionStack;
pub use step::{ActionArgs, Context, SaveStatus, Step};
pub use surface::{NullSurface, Surface, Viewport};
