//! Event-serving facade.
//!
//! A [`Tracker`] is assembled from explicit collaborators (clock, classifier
//! adapter, session manager and log sink) at startup and torn down with
//! [`Tracker::shutdown`]. Nothing here is global.

use std::sync::Arc;

use thiserror::Error;

use crate::category::Category;
use crate::classifier::{ClassifierAdapter, ClassifyError, Frame};
use crate::clock::Clock;
use crate::lifecycle::{EventOutcome, LifecycleError, SessionManager};
use crate::sink::{LogSink, SessionRecord};
use crate::timeline::ClassificationEvent;
use crate::types::{SessionId, UserId};

/// Tracker failures, generic over the sink's error type.
#[derive(Debug, Error)]
pub enum TrackerError<E>
where
    E: std::error::Error + 'static,
{
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),

    /// The session was finalized but could not be persisted. The record is
    /// returned so the caller can retry with [`Tracker::retry_write`].
    #[error("failed to write session {} to the log sink", .record.session_id)]
    SinkWrite {
        record: Box<SessionRecord>,
        #[source]
        source: E,
    },
}

/// Result of observing one frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Detection {
    Detected {
        category: Category,
        outcome: EventOutcome,
    },
    /// The classifier could not produce a category; no event was generated.
    Unavailable(ClassifyError),
}

/// Serves classification events for many sessions.
pub struct Tracker<S: LogSink> {
    clock: Arc<dyn Clock>,
    classifier: ClassifierAdapter,
    manager: SessionManager,
    sink: S,
}

impl<S: LogSink> Tracker<S> {
    pub fn new(
        clock: Arc<dyn Clock>,
        classifier: ClassifierAdapter,
        manager: SessionManager,
        sink: S,
    ) -> Self {
        Self {
            clock,
            classifier,
            manager,
            sink,
        }
    }

    /// Opens a session. A session replaced by this login is persisted first.
    ///
    /// If that write fails no new session is opened; the error carries the
    /// replaced record and the login can simply be repeated after a retry.
    pub fn login(&mut self, user_id: UserId) -> Result<SessionId, TrackerError<S::Error>> {
        if let Some(replaced) = self.manager.retire_open_session(&user_id)? {
            self.persist(replaced)?;
        }
        let opened = self.manager.open(user_id, self.clock.now())?;
        Ok(opened.session_id)
    }

    /// Classifies a frame and applies the result to the session.
    pub fn observe_frame(
        &mut self,
        session_id: &SessionId,
        frame: &Frame,
    ) -> Result<Detection, TrackerError<S::Error>> {
        let now = self.clock.now();
        let category = match self.classifier.classify(frame) {
            Ok(category) => category,
            Err(err) => {
                tracing::warn!(session = %session_id, error = %err, "frame not classified");
                return Ok(Detection::Unavailable(err));
            }
        };
        let event = ClassificationEvent::new(category, now);
        let outcome = self.manager.apply(session_id, &event)?;
        Ok(Detection::Detected { category, outcome })
    }

    /// Applies an already classified label.
    pub fn observe_label(
        &mut self,
        session_id: &SessionId,
        label: &str,
    ) -> Result<EventOutcome, TrackerError<S::Error>> {
        let now = self.clock.now();
        Ok(self.manager.apply_label(session_id, label, now)?)
    }

    /// Closes the session on logout and persists its record.
    pub fn logout(
        &mut self,
        session_id: &SessionId,
    ) -> Result<SessionRecord, TrackerError<S::Error>> {
        let record = self.manager.close(session_id)?;
        self.persist(record)
    }

    /// Force-terminates the session and persists its record.
    pub fn terminate(
        &mut self,
        session_id: &SessionId,
    ) -> Result<SessionRecord, TrackerError<S::Error>> {
        let record = self.manager.force_terminate(session_id)?;
        self.persist(record)
    }

    /// Writes a record that previously failed to persist.
    pub fn retry_write(&mut self, record: &SessionRecord) -> Result<(), S::Error> {
        self.sink.write(record)
    }

    /// Force-terminates every open session and persists each record.
    ///
    /// Returns the records that could not be written, with their errors.
    pub fn shutdown(&mut self) -> Vec<(SessionRecord, S::Error)> {
        let records = self.manager.shutdown();
        tracing::info!(sessions = records.len(), "shutting down tracker");
        records
            .into_iter()
            .filter_map(|record| match self.sink.write(&record) {
                Ok(()) => None,
                Err(err) => {
                    tracing::error!(session = %record.session_id, error = %err, "failed to persist on shutdown");
                    Some((record, err))
                }
            })
            .collect()
    }

    pub const fn manager(&self) -> &SessionManager {
        &self.manager
    }

    /// Mutable access to the classifier, e.g. to load a model after startup.
    pub fn classifier_mut(&mut self) -> &mut ClassifierAdapter {
        &mut self.classifier
    }

    pub const fn sink(&self) -> &S {
        &self.sink
    }

    fn persist(&mut self, record: SessionRecord) -> Result<SessionRecord, TrackerError<S::Error>> {
        match self.sink.write(&record) {
            Ok(()) => {
                tracing::debug!(session = %record.session_id, "session record persisted");
                Ok(record)
            }
            Err(source) => Err(TrackerError::SinkWrite {
                record: Box::new(record),
                source,
            }),
        }
    }
}
