//! Session lifecycle management.
//!
//! The [`SessionManager`] exclusively owns every live [`Session`], keyed by
//! [`SessionId`]. Callers drive it through `open` → `apply` → `close`; a
//! closed session can no longer receive events.

use std::collections::{HashMap, HashSet, VecDeque};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::sink::{EndReason, SessionRecord};
use crate::timeline::{Accumulator, ClassificationEvent, Credit, EventError, Session};
use crate::types::{SessionId, UserId};

/// What happens when a user logs in while a session is still open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReloginPolicy {
    /// Finalize the stale session as `Replaced` and open a fresh one.
    #[default]
    Replace,
    /// Refuse the login with [`LifecycleError::AlreadyOpen`].
    Reject,
}

/// Lifecycle misuse. Surfaced to the caller, never recovered internally.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LifecycleError {
    #[error("user {user_id} already has open session {session_id}")]
    AlreadyOpen {
        user_id: UserId,
        session_id: SessionId,
    },

    #[error("session {0} is already closed")]
    AlreadyClosed(SessionId),

    #[error("session {0} not found")]
    NotFound(SessionId),
}

/// Result of a successful `open`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenedSession {
    pub session_id: SessionId,
    /// The user's previous session, finalized because of this login.
    pub replaced: Option<SessionRecord>,
}

/// What became of one event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventOutcome {
    Applied(Credit),
    /// The event was discarded; the session carries on unchanged.
    Dropped(EventError),
}

impl EventOutcome {
    pub const fn is_applied(&self) -> bool {
        matches!(self, Self::Applied(_))
    }
}

/// Number of finalized session ids remembered for `AlreadyClosed` detection.
const CLOSED_HISTORY: usize = 4096;

/// Recently finalized session ids, oldest evicted first.
#[derive(Debug)]
struct ClosedIds {
    order: VecDeque<SessionId>,
    ids: HashSet<SessionId>,
    capacity: usize,
}

impl ClosedIds {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            order: VecDeque::with_capacity(capacity),
            ids: HashSet::with_capacity(capacity),
            capacity,
        }
    }

    fn contains(&self, session_id: &SessionId) -> bool {
        self.ids.contains(session_id)
    }

    fn insert(&mut self, session_id: SessionId) {
        if self.capacity == 0 || !self.ids.insert(session_id.clone()) {
            return;
        }
        self.order.push_back(session_id);
        if self.order.len() > self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.ids.remove(&evicted);
            }
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.order.len()
    }
}

impl Default for ClosedIds {
    fn default() -> Self {
        Self::with_capacity(CLOSED_HISTORY)
    }
}

/// Owns live sessions and routes events to them.
///
/// Only the most recent finalized ids are remembered; events for an older
/// closed session report `NotFound` rather than `AlreadyClosed`.
#[derive(Debug, Default)]
pub struct SessionManager {
    accumulator: Accumulator,
    relogin: ReloginPolicy,
    sessions: HashMap<SessionId, Session>,
    by_user: HashMap<UserId, SessionId>,
    closed: ClosedIds,
}

impl SessionManager {
    pub fn new(accumulator: Accumulator, relogin: ReloginPolicy) -> Self {
        Self {
            accumulator,
            relogin,
            ..Self::default()
        }
    }

    /// Opens a session for `user_id` starting at `now`.
    pub fn open(
        &mut self,
        user_id: UserId,
        now: DateTime<Utc>,
    ) -> Result<OpenedSession, LifecycleError> {
        let replaced = self.retire_open_session(&user_id)?;

        let session_id = SessionId::generate();
        let session = Session::new(session_id.clone(), user_id.clone(), now);
        tracing::info!(user = %user_id, session = %session_id, start = %now, "session opened");
        self.by_user.insert(user_id, session_id.clone());
        self.sessions.insert(session_id.clone(), session);

        Ok(OpenedSession {
            session_id,
            replaced,
        })
    }

    /// Clears the way for a login by `user_id`.
    ///
    /// Under [`ReloginPolicy::Replace`] the user's open session is finalized
    /// as `Replaced` and returned; under `Reject` it yields `AlreadyOpen`.
    /// Nothing happens when the user has no open session.
    pub fn retire_open_session(
        &mut self,
        user_id: &UserId,
    ) -> Result<Option<SessionRecord>, LifecycleError> {
        let Some(session_id) = self.by_user.get(user_id).cloned() else {
            return Ok(None);
        };
        match self.relogin {
            ReloginPolicy::Reject => Err(LifecycleError::AlreadyOpen {
                user_id: user_id.clone(),
                session_id,
            }),
            ReloginPolicy::Replace => {
                tracing::warn!(user = %user_id, session = %session_id, "re-login, discarding open session");
                self.finalize(&session_id, EndReason::Replaced).map(Some)
            }
        }
    }

    /// Applies a classification event to an open session.
    ///
    /// Stale events are dropped and logged; only lifecycle misuse is an error.
    pub fn apply(
        &mut self,
        session_id: &SessionId,
        event: &ClassificationEvent,
    ) -> Result<EventOutcome, LifecycleError> {
        let accumulator = self.accumulator;
        let session = self.session_mut(session_id)?;
        match accumulator.apply(session, event) {
            Ok(credit) => {
                tracing::debug!(session = %session_id, category = %event.category, %credit, "event applied");
                Ok(EventOutcome::Applied(credit))
            }
            Err(err) => Ok(Self::drop_event(session, err)),
        }
    }

    /// Parses a raw classifier label and applies it.
    pub fn apply_label(
        &mut self,
        session_id: &SessionId,
        label: &str,
        now: DateTime<Utc>,
    ) -> Result<EventOutcome, LifecycleError> {
        match ClassificationEvent::from_label(label, now) {
            Ok(event) => self.apply(session_id, &event),
            Err(err) => {
                let session = self.session_mut(session_id)?;
                Ok(Self::drop_event(session, err.into()))
            }
        }
    }

    /// Finalizes a session on logout.
    pub fn close(&mut self, session_id: &SessionId) -> Result<SessionRecord, LifecycleError> {
        self.finalize(session_id, EndReason::Logout)
    }

    /// Finalizes a session on an external termination signal.
    pub fn force_terminate(
        &mut self,
        session_id: &SessionId,
    ) -> Result<SessionRecord, LifecycleError> {
        self.finalize(session_id, EndReason::ForceTerminated)
    }

    /// Force-terminates every open session, oldest first.
    pub fn shutdown(&mut self) -> Vec<SessionRecord> {
        let mut open: Vec<_> = self
            .sessions
            .values()
            .map(|s| (s.start_time(), s.id().clone()))
            .collect();
        open.sort();

        open.into_iter()
            .filter_map(|(_, id)| self.force_terminate(&id).ok())
            .collect()
    }

    pub fn get(&self, session_id: &SessionId) -> Option<&Session> {
        self.sessions.get(session_id)
    }

    /// The user's open session, if any.
    pub fn session_for_user(&self, user_id: &UserId) -> Option<&SessionId> {
        self.by_user.get(user_id)
    }

    pub fn open_sessions(&self) -> usize {
        self.sessions.len()
    }

    fn session_mut(&mut self, session_id: &SessionId) -> Result<&mut Session, LifecycleError> {
        if self.closed.contains(session_id) {
            return Err(LifecycleError::AlreadyClosed(session_id.clone()));
        }
        self.sessions
            .get_mut(session_id)
            .ok_or_else(|| LifecycleError::NotFound(session_id.clone()))
    }

    fn drop_event(session: &mut Session, err: EventError) -> EventOutcome {
        session.record_drop();
        tracing::warn!(session = %session.id(), error = %err, "dropping event");
        EventOutcome::Dropped(err)
    }

    fn finalize(
        &mut self,
        session_id: &SessionId,
        reason: EndReason,
    ) -> Result<SessionRecord, LifecycleError> {
        if self.closed.contains(session_id) {
            return Err(LifecycleError::AlreadyClosed(session_id.clone()));
        }
        let session = self
            .sessions
            .remove(session_id)
            .ok_or_else(|| LifecycleError::NotFound(session_id.clone()))?;

        if self.by_user.get(session.user_id()) == Some(session_id) {
            self.by_user.remove(session.user_id());
        }
        self.closed.insert(session_id.clone());

        tracing::info!(
            session = %session_id,
            user = %session.user_id(),
            reason = %reason,
            applied = session.events_applied(),
            dropped = session.events_dropped(),
            total_secs = session.durations().total(),
            "session finalized"
        );
        Ok(SessionRecord::finalize(session, reason))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::category::Category;
    use crate::timeline::Durations;

    fn ts(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_735_689_600 + secs, 0).unwrap()
    }

    fn user(name: &str) -> UserId {
        UserId::new(name).unwrap()
    }

    fn event(category: Category, secs: i64) -> ClassificationEvent {
        ClassificationEvent::new(category, ts(secs))
    }

    #[test]
    fn test_open_apply_close_produces_record() {
        let mut manager = SessionManager::default();
        let opened = manager.open(user("alice"), ts(0)).unwrap();
        assert!(opened.replaced.is_none());
        let id = opened.session_id;

        manager.apply(&id, &event(Category::Confused, 0)).unwrap();
        manager
            .apply(&id, &event(Category::EngagedLikesTopic, 5))
            .unwrap();
        manager.apply(&id, &event(Category::Confused, 8)).unwrap();

        let record = manager.close(&id).unwrap();
        assert_eq!(record.user_id, user("alice"));
        assert_eq!(record.start_time, ts(0));
        assert_eq!(record.end_time, ts(8));
        assert_eq!(record.end_reason, EndReason::Logout);
        assert_eq!(record.durations, Durations::from_array([5, 3, 0, 0, 0]));
        assert_eq!(manager.open_sessions(), 0);
        assert!(manager.session_for_user(&user("alice")).is_none());
    }

    #[test]
    fn test_close_without_events_is_all_zero() {
        let mut manager = SessionManager::default();
        let id = manager.open(user("bob"), ts(100)).unwrap().session_id;

        let record = manager.close(&id).unwrap();
        assert_eq!(record.durations.total(), 0);
        assert_eq!(record.start_time, record.end_time);
    }

    #[test]
    fn test_closing_twice_is_already_closed() {
        let mut manager = SessionManager::default();
        let id = manager.open(user("bob"), ts(0)).unwrap().session_id;
        manager.close(&id).unwrap();

        assert_eq!(
            manager.close(&id),
            Err(LifecycleError::AlreadyClosed(id.clone()))
        );
        assert_eq!(
            manager.force_terminate(&id),
            Err(LifecycleError::AlreadyClosed(id.clone()))
        );
    }

    #[test]
    fn test_apply_after_close_is_rejected() {
        let mut manager = SessionManager::default();
        let id = manager.open(user("bob"), ts(0)).unwrap().session_id;
        manager.close(&id).unwrap();

        assert_eq!(
            manager.apply(&id, &event(Category::Confused, 3)),
            Err(LifecycleError::AlreadyClosed(id.clone()))
        );
        assert_eq!(
            manager.apply_label(&id, "Confused", ts(3)),
            Err(LifecycleError::AlreadyClosed(id))
        );
    }

    #[test]
    fn test_unknown_session_is_not_found() {
        let mut manager = SessionManager::default();
        let id = SessionId::new("missing").unwrap();
        assert_eq!(
            manager.apply(&id, &event(Category::Confused, 0)),
            Err(LifecycleError::NotFound(id.clone()))
        );
        assert_eq!(manager.close(&id), Err(LifecycleError::NotFound(id)));
    }

    #[test]
    fn test_stale_event_is_dropped_not_propagated() {
        let mut manager = SessionManager::default();
        let id = manager.open(user("alice"), ts(0)).unwrap().session_id;
        manager.apply(&id, &event(Category::Confused, 10)).unwrap();
        let before = *manager.get(&id).unwrap().durations();

        let outcome = manager
            .apply(&id, &event(Category::EngagedLikesTopic, 4))
            .unwrap();
        assert!(matches!(
            outcome,
            EventOutcome::Dropped(EventError::StaleEvent { .. })
        ));

        let session = manager.get(&id).unwrap();
        assert_eq!(*session.durations(), before);
        assert_eq!(session.last_event_time(), ts(10));
        assert_eq!(session.current(), Some(Category::Confused));
        assert_eq!(session.events_dropped(), 1);
    }

    #[test]
    fn test_unknown_label_is_dropped() {
        let mut manager = SessionManager::default();
        let id = manager.open(user("alice"), ts(0)).unwrap().session_id;
        manager.apply_label(&id, "Confused", ts(1)).unwrap();

        let outcome = manager.apply_label(&id, "Unrecognized", ts(6)).unwrap();
        assert!(matches!(
            outcome,
            EventOutcome::Dropped(EventError::UnknownCategory(_))
        ));

        let session = manager.get(&id).unwrap();
        assert_eq!(session.durations().total(), 0);
        assert_eq!(session.last_event_time(), ts(1));

        let outcome = manager
            .apply_label(&id, "Not_Engaged_Chatting", ts(9))
            .unwrap();
        assert!(outcome.is_applied());
        assert_eq!(
            manager.get(&id).unwrap().durations().get(Category::Confused),
            8
        );
    }

    #[test]
    fn test_relogin_replaces_open_session_by_default() {
        let mut manager = SessionManager::default();
        let first = manager.open(user("alice"), ts(0)).unwrap().session_id;
        manager.apply(&first, &event(Category::Confused, 0)).unwrap();
        manager
            .apply(&first, &event(Category::NotEngagedChatting, 7))
            .unwrap();

        let opened = manager.open(user("alice"), ts(20)).unwrap();
        let replaced = opened.replaced.expect("stale session handed back");
        assert_eq!(replaced.session_id, first);
        assert_eq!(replaced.end_reason, EndReason::Replaced);
        assert_eq!(replaced.durations.get(Category::Confused), 7);

        let fresh = manager.get(&opened.session_id).unwrap();
        assert_eq!(fresh.durations().total(), 0);
        assert_eq!(fresh.start_time(), ts(20));
        assert_eq!(manager.session_for_user(&user("alice")), Some(&opened.session_id));
        assert_eq!(
            manager.apply(&first, &event(Category::Confused, 30)),
            Err(LifecycleError::AlreadyClosed(first))
        );
    }

    #[test]
    fn test_relogin_rejected_under_reject_policy() {
        let mut manager = SessionManager::new(Accumulator::default(), ReloginPolicy::Reject);
        let first = manager.open(user("alice"), ts(0)).unwrap().session_id;

        let err = manager.open(user("alice"), ts(5)).unwrap_err();
        assert_eq!(
            err,
            LifecycleError::AlreadyOpen {
                user_id: user("alice"),
                session_id: first.clone(),
            }
        );
        assert!(manager.get(&first).is_some());
        assert_eq!(manager.open_sessions(), 1);
    }

    #[test]
    fn test_sessions_for_different_users_are_independent() {
        let mut manager = SessionManager::default();
        let a = manager.open(user("alice"), ts(0)).unwrap().session_id;
        let b = manager.open(user("bob"), ts(0)).unwrap().session_id;

        manager.apply(&a, &event(Category::Confused, 0)).unwrap();
        manager.apply(&b, &event(Category::NotEngagedNotLiked, 2)).unwrap();
        manager.apply(&a, &event(Category::Confused, 10)).unwrap();
        manager.apply(&b, &event(Category::Confused, 4)).unwrap();

        let ra = manager.close(&a).unwrap();
        let rb = manager.close(&b).unwrap();
        assert_eq!(ra.durations, Durations::from_array([10, 0, 0, 0, 0]));
        assert_eq!(rb.durations, Durations::from_array([0, 0, 0, 0, 2]));
    }

    #[test]
    fn test_shutdown_force_terminates_all_open_sessions() {
        let mut manager = SessionManager::default();
        let late = manager.open(user("bob"), ts(50)).unwrap().session_id;
        let early = manager.open(user("alice"), ts(10)).unwrap().session_id;
        manager.apply(&early, &event(Category::Confused, 10)).unwrap();
        manager.apply(&early, &event(Category::Confused, 40)).unwrap();

        let records = manager.shutdown();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].session_id, early);
        assert_eq!(records[1].session_id, late);
        assert!(records
            .iter()
            .all(|r| r.end_reason == EndReason::ForceTerminated));
        assert_eq!(records[0].durations.get(Category::Confused), 30);
        assert_eq!(manager.open_sessions(), 0);
        assert!(manager.shutdown().is_empty());
    }

    #[test]
    fn test_closed_history_is_bounded() {
        let mut manager = SessionManager {
            closed: ClosedIds::with_capacity(2),
            ..SessionManager::default()
        };
        let ids: Vec<SessionId> = ["a", "b", "c"]
            .into_iter()
            .map(|name| {
                let id = manager.open(user(name), ts(0)).unwrap().session_id;
                manager.close(&id).unwrap();
                id
            })
            .collect();

        assert_eq!(manager.closed.len(), 2);
        assert_eq!(
            manager.close(&ids[0]),
            Err(LifecycleError::NotFound(ids[0].clone()))
        );
        for id in &ids[1..] {
            assert_eq!(
                manager.close(id),
                Err(LifecycleError::AlreadyClosed(id.clone()))
            );
        }
    }

    #[test]
    fn test_retire_open_session_follows_relogin_policy() {
        let mut manager = SessionManager::default();
        assert_eq!(manager.retire_open_session(&user("alice")), Ok(None));

        let id = manager.open(user("alice"), ts(0)).unwrap().session_id;
        let record = manager.retire_open_session(&user("alice")).unwrap().unwrap();
        assert_eq!(record.session_id, id);
        assert_eq!(record.end_reason, EndReason::Replaced);
        assert_eq!(manager.open_sessions(), 0);

        let mut strict = SessionManager::new(Accumulator::default(), ReloginPolicy::Reject);
        let id = strict.open(user("bob"), ts(0)).unwrap().session_id;
        assert_eq!(
            strict.retire_open_session(&user("bob")),
            Err(LifecycleError::AlreadyOpen {
                user_id: user("bob"),
                session_id: id,
            })
        );
        assert_eq!(strict.open_sessions(), 1);
    }
}
