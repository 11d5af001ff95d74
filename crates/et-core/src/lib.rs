//! Core domain logic for expression-time accounting.
//!
//! This crate contains the fundamental types and logic for:
//! - Categories: the closed set of engagement labels
//! - Timeline: crediting elapsed time to the previously detected category
//! - Lifecycle: opening, feeding and finalizing per-login sessions
//! - Classifier: mapping model scores to a category
//! - Tracker: wiring clock, classifier, sessions and log sink together

pub mod category;
pub mod classifier;
pub mod clock;
pub mod lifecycle;
pub mod sink;
pub mod timeline;
pub mod tracker;
pub mod types;

pub use category::{Category, UnknownCategory};
pub use classifier::{ClassifierAdapter, ClassifyError, ExpressionModel, Frame};
pub use clock::{Clock, ManualClock, SystemClock};
pub use lifecycle::{EventOutcome, LifecycleError, OpenedSession, ReloginPolicy, SessionManager};
pub use sink::{EndReason, LogSink, SessionRecord};
pub use timeline::{
    AccountingConfig, Accumulator, ClassificationEvent, Credit, Durations, EventError,
    FirstIntervalPolicy, Session,
};
pub use tracker::{Detection, Tracker, TrackerError};
pub use types::{SessionId, UserId, ValidationError};
