use serde::{Deserialize, Serialize};

/// Subscription identifier.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubscriptionId(pub uuid::Uuid);

impl SubscriptionId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for SubscriptionId {
    fn default() -> Self {
        Self::new()
    }
}

/// WAL integrity report.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntegrityReport {
    pub total_events: u64,
    pub verified_events: u64,
    pub corrupted_events: u64,
    pub corrupted_offsets: Vec<u64>,
    pub segments_checked: u32,
}

impl IntegrityReport {
    pub fn is_clean(&self) -> bool {
        self.corrupted_events == 0
    }
}
