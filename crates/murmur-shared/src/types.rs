use serde::{Deserialize, Serialize};

use crate::constants::TEMP_ID_DIGITS;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct ConversationId(pub i64);

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct UserId(pub i64);

/// Server-assigned durable message id (`mid` on download events).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct MessageId(pub i64);

/// Client-generated provisional id, valid until the server confirms the message.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct TempId(pub u64);

impl TempId {
    /// Smallest value with exactly `TEMP_ID_DIGITS` digits.
    pub const MIN: u64 = 10u64.pow(TEMP_ID_DIGITS - 1);
    /// One past the largest value with exactly `TEMP_ID_DIGITS` digits.
    pub const MAX_EXCLUSIVE: u64 = 10u64.pow(TEMP_ID_DIGITS);

    pub fn is_well_formed(&self) -> bool {
        (Self::MIN..Self::MAX_EXCLUSIVE).contains(&self.0)
    }
}

macro_rules! display_inner {
    ($($ty:ty),*) => {
        $(impl std::fmt::Display for $ty {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        })*
    };
}

display_inner!(ConversationId, UserId, MessageId, TempId);

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ConversationKind {
    Direct,
    Group,
    Channel,
}
