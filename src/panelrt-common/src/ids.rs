//! Suspension id generation (§9: "use 128-bit random ids to avoid
//! coordination").

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SuspensionId(Uuid);

impl SuspensionId {
    /// Generates a fresh, globally-unique id. Collision probability over a
    /// 128-bit random space is negligible over realistic process lifetimes.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SuspensionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SuspensionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
