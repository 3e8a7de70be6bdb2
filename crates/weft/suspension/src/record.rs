use serde::{Deserialize, Serialize};
use serde_json::Value;
use weft_types::{Event, EventId, EventType};
use weft_workflow::{InstanceId, NodeId};

/// A human response an instance is waiting for.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AwaitedResponse {
    pub node: NodeId,
    /// Id of the `hil.request` event; responses cite it as `request_id`.
    pub request_id: EventId,
    pub response_type: EventType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    /// The response that answered this request, once one has.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_by: Option<EventId>,
}

impl AwaitedResponse {
    pub fn is_resolved(&self) -> bool {
        self.resolved_by.is_some()
    }

    pub fn is_due(&self, now_ms: u64) -> bool {
        !self.is_resolved() && self.deadline_ms.is_some_and(|d| d <= now_ms)
    }
}

/// Outcome of matching a response against a suspension record.
#[derive(Clone, Debug, PartialEq)]
pub enum Resolution {
    /// First matching response: the entry is now resolved by it.
    Resolved(AwaitedResponse),
    /// The request was already answered; nothing changes.
    AlreadyResolved(AwaitedResponse),
    /// The response does not answer any awaited request.
    Mismatch(String),
}

/// Everything needed to resume a suspended instance.
///
/// Together with the log prefix up to `context_version` this is the whole
/// resumable state; nothing else about the instance survives a restart.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SuspensionRecord {
    pub instance: InstanceId,
    pub workflow: String,
    pub workflow_version: u32,
    pub trigger_id: EventId,
    /// Log version at the moment of suspension.
    pub context_version: u64,
    pub suspended_at_ms: u64,
    pub awaiting: Vec<AwaitedResponse>,
}

impl SuspensionRecord {
    pub fn pending(&self) -> impl Iterator<Item = &AwaitedResponse> {
        self.awaiting.iter().filter(|a| !a.is_resolved())
    }

    pub fn is_pending(&self) -> bool {
        self.pending().next().is_some()
    }

    pub fn due(&self, now_ms: u64) -> Vec<&AwaitedResponse> {
        self.awaiting.iter().filter(|a| a.is_due(now_ms)).collect()
    }

    pub fn awaits(&self, request_id: &EventId) -> bool {
        self.pending().any(|a| &a.request_id == request_id)
    }

    /// Match `response` against the awaited entries and mark the entry resolved.
    pub fn resolve(&mut self, response: &Event) -> Resolution {
        let Some(request_id) = response
            .get_str("request_id")
            .and_then(|raw| EventId::parse(raw).ok())
        else {
            return Resolution::Mismatch("response carries no valid request_id".into());
        };
        let Some(entry) = self.awaiting.iter_mut().find(|a| a.request_id == request_id) else {
            return Resolution::Mismatch(format!(
                "instance {} is not waiting for request {request_id}",
                self.instance
            ));
        };
        if entry.response_type != response.event_type {
            return Resolution::Mismatch(format!(
                "request {request_id} expects {}, got {}",
                entry.response_type, response.event_type
            ));
        }
        if entry.is_resolved() {
            return Resolution::AlreadyResolved(entry.clone());
        }
        entry.resolved_by = Some(response.id);
        Resolution::Resolved(entry.clone())
    }
}
