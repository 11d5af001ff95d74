//! Engagement categories as the single source of truth for label strings.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Engagement categories produced by the expression classifier.
///
/// The declaration order is the classifier's output order: index `i` of a
/// prediction vector scores `Category::ALL[i]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Category {
    Confused,
    EngagedLikesTopic,
    EngagedMakingInvolvement,
    NotEngagedChatting,
    NotEngagedNotLiked,
}

impl Category {
    /// Every category, in classifier output order.
    pub const ALL: [Self; 5] = [
        Self::Confused,
        Self::EngagedLikesTopic,
        Self::EngagedMakingInvolvement,
        Self::NotEngagedChatting,
        Self::NotEngagedNotLiked,
    ];

    /// Number of categories. Must equal the classifier's output dimension.
    pub const COUNT: usize = Self::ALL.len();

    /// Label emitted by the classifier and used on the wire.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Confused => "Confused",
            Self::EngagedLikesTopic => "Engaged_Likes_Topic",
            Self::EngagedMakingInvolvement => "Engaged_Making_Involvement",
            Self::NotEngagedChatting => "Not_Engaged_Chatting",
            Self::NotEngagedNotLiked => "Not_Engaged_Not_Liked",
        }
    }

    /// Column name for SQL storage.
    #[must_use]
    pub const fn column(self) -> &'static str {
        match self {
            Self::Confused => "confused",
            Self::EngagedLikesTopic => "engaged_likes_topic",
            Self::EngagedMakingInvolvement => "engaged_making_involvement",
            Self::NotEngagedChatting => "not_engaged_chatting",
            Self::NotEngagedNotLiked => "not_engaged_not_liked",
        }
    }

    /// Position in [`Category::ALL`].
    #[must_use]
    pub const fn index(self) -> usize {
        self as usize
    }

    /// Category at the given classifier output index.
    #[must_use]
    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for Category {
    type Err = UnknownCategory;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|category| category.label() == s)
            .ok_or_else(|| UnknownCategory(s.to_string()))
    }
}

impl Serialize for Category {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(self.label())
    }
}

impl<'de> Deserialize<'de> for Category {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Error type for labels outside the category enumeration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown category: {0}")]
pub struct UnknownCategory(pub String);
