//! Expression timeline accounting.
//!
//! Each classification event closes the interval that started at the
//! previous event and credits it to the category that was in effect during
//! that interval, i.e. the *previous* classification.
//!
//! # Algorithm Summary
//!
//! 1. Reject events stamped before the session's last event (`StaleEvent`)
//! 2. Elapsed = difference between the two stamps floored to whole seconds,
//!    capped by the optional idle cap
//! 3. Credit the previous category; the first event of a session has no
//!    previous category and follows [`FirstIntervalPolicy`]
//! 4. Move `last_event_time` forward and remember the new category

use std::fmt;

use chrono::{DateTime, Utc};
use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::category::{Category, UnknownCategory};
use crate::types::{SessionId, UserId};

/// How the interval between session open and the first event is credited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FirstIntervalPolicy {
    /// Credit nothing until a second event arrives.
    #[default]
    Discard,
    /// Credit the open-to-first-event interval to the first observed category.
    CreditFirstCategory,
}

/// Configuration for the accumulator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AccountingConfig {
    /// Policy for the interval before the first event.
    #[serde(default)]
    pub first_interval: FirstIntervalPolicy,

    /// Upper bound on the seconds credited for a single interval.
    /// `None` credits gaps of any length in full.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idle_cap_secs: Option<u64>,
}

/// Accumulated whole seconds per category. Every category is always present.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Durations([u64; Category::COUNT]);

impl Durations {
    /// Builds durations from seconds listed in [`Category::ALL`] order.
    #[must_use]
    pub const fn from_array(secs: [u64; Category::COUNT]) -> Self {
        Self(secs)
    }

    #[must_use]
    pub const fn get(&self, category: Category) -> u64 {
        self.0[category.index()]
    }

    /// Adds seconds to a category, saturating at `u64::MAX`.
    pub fn credit(&mut self, category: Category, secs: u64) {
        let slot = &mut self.0[category.index()];
        *slot = slot.saturating_add(secs);
    }

    /// Sum over all categories.
    #[must_use]
    pub fn total(&self) -> u64 {
        self.0.iter().fold(0, |acc, secs| acc.saturating_add(*secs))
    }

    /// Iterates `(category, seconds)` in category order.
    pub fn iter(&self) -> impl Iterator<Item = (Category, u64)> + '_ {
        Category::ALL.into_iter().zip(self.0.iter().copied())
    }
}

impl Serialize for Durations {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let mut map = serializer.serialize_map(Some(Category::COUNT))?;
        for (category, secs) in self.iter() {
            map.serialize_entry(category.label(), &secs)?;
        }
        map.end()
    }
}

/// A single timestamped classification, consumed immediately by the accumulator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClassificationEvent {
    pub category: Category,
    /// Arrival time assigned by the session clock.
    pub observed_at: DateTime<Utc>,
}

impl ClassificationEvent {
    pub const fn new(category: Category, observed_at: DateTime<Utc>) -> Self {
        Self {
            category,
            observed_at,
        }
    }

    /// Builds an event from a raw classifier label.
    pub fn from_label(label: &str, observed_at: DateTime<Utc>) -> Result<Self, UnknownCategory> {
        Ok(Self::new(label.parse()?, observed_at))
    }
}

/// Per-event rejection. The event is dropped; the session is unaffected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EventError {
    /// The event is stamped before the last applied event.
    #[error("stale event at {observed_at}, last event at {last_event_time}")]
    StaleEvent {
        observed_at: DateTime<Utc>,
        last_event_time: DateTime<Utc>,
    },

    /// The classification is not a member of the category enumeration.
    #[error(transparent)]
    UnknownCategory(#[from] UnknownCategory),
}

/// Time credited by one accepted event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Credit {
    /// Category that received the interval, `None` if nothing was credited.
    pub category: Option<Category>,
    pub seconds: u64,
}

impl Credit {
    const NONE: Self = Self {
        category: None,
        seconds: 0,
    };
}

impl fmt::Display for Credit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.category {
            Some(category) => write!(f, "+{}s {category}", self.seconds),
            None => f.write_str("no credit"),
        }
    }
}

/// One user's live interaction window.
///
/// Only the accumulator mutates a session; the lifecycle manager owns it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    id: SessionId,
    user_id: UserId,
    start_time: DateTime<Utc>,
    last_event_time: DateTime<Utc>,
    current: Option<Category>,
    durations: Durations,
    events_applied: u64,
    events_dropped: u64,
}

impl Session {
    /// Creates a session with zeroed durations and no prior category.
    pub fn new(id: SessionId, user_id: UserId, start_time: DateTime<Utc>) -> Self {
        Self {
            id,
            user_id,
            start_time,
            last_event_time: start_time,
            current: None,
            durations: Durations::default(),
            events_applied: 0,
            events_dropped: 0,
        }
    }

    pub const fn id(&self) -> &SessionId {
        &self.id
    }

    pub const fn user_id(&self) -> &UserId {
        &self.user_id
    }

    pub const fn start_time(&self) -> DateTime<Utc> {
        self.start_time
    }

    pub const fn last_event_time(&self) -> DateTime<Utc> {
        self.last_event_time
    }

    /// Category detected by the most recent accepted event.
    pub const fn current(&self) -> Option<Category> {
        self.current
    }

    pub const fn durations(&self) -> &Durations {
        &self.durations
    }

    pub const fn events_applied(&self) -> u64 {
        self.events_applied
    }

    pub const fn events_dropped(&self) -> u64 {
        self.events_dropped
    }

    pub(crate) fn record_drop(&mut self) {
        self.events_dropped += 1;
    }

    /// Consumes the session, yielding the finalized parts.
    pub(crate) fn into_parts(self) -> (SessionId, UserId, DateTime<Utc>, DateTime<Utc>, Durations) {
        (
            self.id,
            self.user_id,
            self.start_time,
            self.last_event_time,
            self.durations,
        )
    }
}

/// Applies classification events to sessions.
#[derive(Debug, Clone, Copy, Default)]
pub struct Accumulator {
    config: AccountingConfig,
}

impl Accumulator {
    pub const fn new(config: AccountingConfig) -> Self {
        Self { config }
    }

    /// Applies one event to a session.
    ///
    /// On error the session is left exactly as it was.
    pub fn apply(
        &self,
        session: &mut Session,
        event: &ClassificationEvent,
    ) -> Result<Credit, EventError> {
        if event.observed_at < session.last_event_time {
            return Err(EventError::StaleEvent {
                observed_at: event.observed_at,
                last_event_time: session.last_event_time,
            });
        }

        let elapsed = self.elapsed_secs(session.last_event_time, event.observed_at);
        let credited = session.current.or(match self.config.first_interval {
            FirstIntervalPolicy::Discard => None,
            FirstIntervalPolicy::CreditFirstCategory => Some(event.category),
        });

        let credit = credited.map_or(Credit::NONE, |category| Credit {
            category: Some(category),
            seconds: elapsed,
        });
        if let Some(category) = credit.category {
            session.durations.credit(category, credit.seconds);
        }

        session.last_event_time = event.observed_at;
        session.current = Some(event.category);
        session.events_applied += 1;
        Ok(credit)
    }

    /// Whole seconds between two instants, floored, then capped by the idle cap.
    ///
    /// Flooring each interval keeps the accounted total at or below the
    /// session's wall-clock span.
    fn elapsed_secs(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> u64 {
        let raw = u64::try_from((to - from).num_seconds()).unwrap_or(0);
        self.config.idle_cap_secs.map_or(raw, |cap| raw.min(cap))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::category::Category::{Confused as A, EngagedLikesTopic as B, NotEngagedChatting as C};

    fn ts(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_735_689_600 + secs, 0).unwrap()
    }

    fn ts_ms(ms: i64) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(1_735_689_600_000 + ms).unwrap()
    }

    fn session_at(start: DateTime<Utc>) -> Session {
        Session::new(
            SessionId::new("sess-1").unwrap(),
            UserId::new("alice").unwrap(),
            start,
        )
    }

    fn event(category: Category, at: DateTime<Utc>) -> ClassificationEvent {
        ClassificationEvent::new(category, at)
    }

    #[test]
    fn test_scenario_credits_previous_category() {
        let acc = Accumulator::default();
        let mut session = session_at(ts(0));

        let credit = acc.apply(&mut session, &event(A, ts(0))).unwrap();
        assert_eq!(credit, Credit::NONE);
        assert_eq!(session.last_event_time(), ts(0));

        let credit = acc.apply(&mut session, &event(B, ts(5))).unwrap();
        assert_eq!(credit.category, Some(A));
        assert_eq!(credit.seconds, 5);
        assert_eq!(session.last_event_time(), ts(5));

        acc.apply(&mut session, &event(A, ts(8))).unwrap();

        let durations = session.durations();
        assert_eq!(durations.get(A), 5);
        assert_eq!(durations.get(B), 3);
        assert_eq!(durations.get(C), 0);
        assert_eq!(durations.total(), 8);
        assert_eq!(session.events_applied(), 3);
    }

    #[test]
    fn test_first_event_after_open_discards_gap_by_default() {
        let acc = Accumulator::default();
        let mut session = session_at(ts(0));

        acc.apply(&mut session, &event(A, ts(30))).unwrap();
        assert_eq!(session.durations().total(), 0);
        assert_eq!(session.current(), Some(A));
        assert_eq!(session.last_event_time(), ts(30));
    }

    #[test]
    fn test_credit_first_category_policy() {
        let acc = Accumulator::new(AccountingConfig {
            first_interval: FirstIntervalPolicy::CreditFirstCategory,
            idle_cap_secs: None,
        });
        let mut session = session_at(ts(0));

        let credit = acc.apply(&mut session, &event(B, ts(12))).unwrap();
        assert_eq!(credit.category, Some(B));
        assert_eq!(session.durations().get(B), 12);

        acc.apply(&mut session, &event(A, ts(20))).unwrap();
        assert_eq!(session.durations().get(B), 20);
        assert_eq!(session.durations().total(), 20);
    }

    #[test]
    fn test_stale_event_leaves_session_unchanged() {
        let acc = Accumulator::default();
        let mut session = session_at(ts(0));
        acc.apply(&mut session, &event(A, ts(10))).unwrap();
        let before = session.clone();

        let err = acc.apply(&mut session, &event(B, ts(4))).unwrap_err();
        assert_eq!(
            err,
            EventError::StaleEvent {
                observed_at: ts(4),
                last_event_time: ts(10),
            }
        );
        assert_eq!(session, before);
    }

    #[test]
    fn test_unknown_label_rejected_before_apply() {
        let err = ClassificationEvent::from_label("Unrecognized", ts(0)).unwrap_err();
        assert_eq!(err, UnknownCategory("Unrecognized".to_string()));
        let err: EventError = err.into();
        assert_eq!(err.to_string(), "unknown category: Unrecognized");
    }

    #[test]
    fn test_equal_timestamps_credit_zero() {
        let acc = Accumulator::default();
        let mut session = session_at(ts(0));
        acc.apply(&mut session, &event(A, ts(3))).unwrap();
        let credit = acc.apply(&mut session, &event(B, ts(3))).unwrap();
        assert_eq!(credit.category, Some(A));
        assert_eq!(credit.seconds, 0);
        assert_eq!(session.current(), Some(B));
    }

    #[test]
    fn test_sub_second_interval_across_second_boundary_credits_zero() {
        let acc = Accumulator::default();
        let mut session = session_at(ts_ms(900));
        acc.apply(&mut session, &event(A, ts_ms(900))).unwrap();
        let credit = acc.apply(&mut session, &event(B, ts_ms(1_100))).unwrap();

        assert_eq!(credit.seconds, 0);
        assert_eq!(session.durations().total(), 0);
    }

    #[test]
    fn test_sub_second_stamps_never_exceed_wall_clock() {
        let acc = Accumulator::default();
        let start = ts_ms(0);
        let mut session = session_at(start);
        for (i, ms) in [400, 1_300, 1_900, 2_600, 4_100, 4_999, 6_001].into_iter().enumerate() {
            let category = if i % 2 == 0 { A } else { B };
            acc.apply(&mut session, &event(category, ts_ms(ms))).unwrap();

            let wall_ms = (session.last_event_time() - start).num_milliseconds();
            let total_ms = i64::try_from(session.durations().total()).unwrap() * 1000;
            assert!(total_ms <= wall_ms, "accounted {total_ms}ms > wall {wall_ms}ms");
        }
        // Floored intervals after the first: 0.9, 0.6, 0.7, 1.5, 0.899, 1.002
        assert_eq!(session.durations().total(), 2);
    }

    #[test]
    fn test_large_gap_credited_in_full_without_cap() {
        let acc = Accumulator::default();
        let mut session = session_at(ts(0));
        acc.apply(&mut session, &event(C, ts(0))).unwrap();
        acc.apply(&mut session, &event(A, ts(8 * 3600))).unwrap();
        assert_eq!(session.durations().get(C), 8 * 3600);
    }

    #[test]
    fn test_idle_cap_truncates_single_interval() {
        let acc = Accumulator::new(AccountingConfig {
            first_interval: FirstIntervalPolicy::Discard,
            idle_cap_secs: Some(60),
        });
        let mut session = session_at(ts(0));
        acc.apply(&mut session, &event(C, ts(0))).unwrap();
        let credit = acc.apply(&mut session, &event(A, ts(3600))).unwrap();
        assert_eq!(credit.seconds, 60);
        acc.apply(&mut session, &event(B, ts(3630))).unwrap();
        assert_eq!(session.durations().get(C), 60);
        assert_eq!(session.durations().get(A), 30);
        assert_eq!(session.last_event_time(), ts(3630));
    }

    #[test]
    fn test_conservation_monotonicity_and_non_negativity() {
        let acc = Accumulator::default();
        let mut session = session_at(ts(0));
        let stamps = [0, 2, 2, 7, 19, 20, 45, 46, 90, 300];
        let categories = [A, B, C, A, A, C, B, B, A, C];

        let mut expected = 0;
        let mut prev_stamp: Option<i64> = None;
        for (stamp, category) in stamps.into_iter().zip(categories) {
            let before = *session.durations();
            acc.apply(&mut session, &event(category, ts(stamp))).unwrap();
            let after = *session.durations();

            for (c, secs) in before.iter() {
                assert!(after.get(c) >= secs, "{c} decreased");
            }
            if let Some(prev) = prev_stamp {
                expected += u64::try_from(stamp - prev).unwrap();
            }
            prev_stamp = Some(stamp);
            assert_eq!(after.total(), expected);
        }

        let wall = session.last_event_time() - session.start_time();
        assert!(session.durations().total() <= u64::try_from(wall.num_seconds()).unwrap());
    }

    #[test]
    fn test_rejected_events_interleaved_do_not_disturb_accounting() {
        let acc = Accumulator::default();
        let mut session = session_at(ts(0));
        acc.apply(&mut session, &event(A, ts(5))).unwrap();
        assert!(acc.apply(&mut session, &event(B, ts(1))).is_err());
        acc.apply(&mut session, &event(B, ts(9))).unwrap();
        assert_eq!(session.durations().get(A), 4);
        assert_eq!(session.durations().get(B), 0);
    }

    #[test]
    fn test_durations_serialize_as_label_map() {
        let mut durations = Durations::default();
        durations.credit(B, 42);
        let json = serde_json::to_value(durations).unwrap();
        assert_eq!(json["Engaged_Likes_Topic"], 42);
        assert_eq!(json["Confused"], 0);
        assert_eq!(json.as_object().unwrap().len(), Category::COUNT);
    }

    #[test]
    fn test_durations_credit_saturates() {
        let mut durations = Durations::from_array([u64::MAX - 1, 0, 0, 0, 0]);
        durations.credit(A, 10);
        assert_eq!(durations.get(A), u64::MAX);
        assert_eq!(durations.total(), u64::MAX);
    }

    #[test]
    fn test_credit_display() {
        let credit = Credit {
            category: Some(A),
            seconds: 5,
        };
        assert_eq!(credit.to_string(), "+5s Confused");
        assert_eq!(Credit::NONE.to_string(), "no credit");
    }
}
