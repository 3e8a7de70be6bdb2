//! Error types for workflow definitions

use crate::NodeId;

/// Structural problems found when a workflow definition is validated.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum WorkflowError {
    #[error("Workflow has no nodes")]
    Empty,

    #[error("Duplicate node ID: {0}")]
    DuplicateNodeId(NodeId),

    #[error("Node ID is reserved: {0}")]
    ReservedNodeId(NodeId),

    #[error("Node {node} references unknown node or binding '{reference}'")]
    UnknownReference { node: NodeId, reference: String },

    #[error("Branch target {target} of {branch} must need the branch")]
    DetachedBranchTarget { branch: NodeId, target: NodeId },

    #[error("Fallback {fallback} of {node} must need the node")]
    DetachedFallback { node: NodeId, fallback: NodeId },

    #[error("Parallel member {member} of {block} is invalid: {reason}")]
    InvalidParallelMember {
        block: NodeId,
        member: NodeId,
        reason: String,
    },

    #[error("Loop {0} must allow at least one iteration")]
    ZeroIterationLoop(NodeId),

    #[error("Workflow has more than one return node")]
    MultipleReturns,

    #[error("Cycle detected in workflow graph through: {0:?}")]
    CycleDetected(Vec<NodeId>),

    #[error("Workflow validation error: {0}")]
    ValidationError(String),
}

/// Result type alias for workflow operations
pub type WorkflowResult<T> = Result<T, WorkflowError>;
