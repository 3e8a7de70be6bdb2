use tracing::debug;
use weft_projector::Projector;
use weft_types::{CandidateEvent, Context};

use crate::policy::{OnViolation, Policy};
use crate::stages::{pipeline, CheckInput, Rejection, StageResult, Subject};

/// Outcome of checking a candidate.
#[derive(Clone, Debug, PartialEq)]
pub enum Verdict {
    Admit,
    Reject(Rejection),
}

impl Verdict {
    pub fn is_admit(&self) -> bool {
        matches!(self, Verdict::Admit)
    }
}

/// Check one policy. Pure: depends only on its arguments.
pub fn check(policy: &Policy, candidate: &CandidateEvent, context: &Context) -> Verdict {
    check_with(policy, candidate, context, None)
}

pub(crate) fn check_with(
    policy: &Policy,
    candidate: &CandidateEvent,
    context: &Context,
    projector: Option<&Projector>,
) -> Verdict {
    let input = CheckInput {
        policy,
        candidate,
        context,
        subject: Subject::of(candidate),
        projector,
    };

    for stage in pipeline() {
        match stage.evaluate(&input) {
            StageResult::Pass => {}
            StageResult::Reject(rejection) => {
                debug!(
                    policy = %policy.name,
                    stage = stage.stage_name(),
                    number = stage.stage_number(),
                    rule = %rejection.rule,
                    "Stage rejected candidate"
                );
                return Verdict::Reject(rejection);
            }
        }
    }
    Verdict::Admit
}

/// Check every policy in order; the first rejection wins.
///
/// Returns the rejecting policy's `on_violation` alongside the rejection.
pub fn check_all(
    policies: &[Policy],
    candidate: &CandidateEvent,
    context: &Context,
) -> Result<(), (Rejection, OnViolation)> {
    check_all_with(policies, candidate, context, None)
}

pub(crate) fn check_all_with(
    policies: &[Policy],
    candidate: &CandidateEvent,
    context: &Context,
    projector: Option<&Projector>,
) -> Result<(), (Rejection, OnViolation)> {
    for policy in policies {
        if let Verdict::Reject(rejection) = check_with(policy, candidate, context, projector) {
            return Err((rejection, policy.on_violation));
        }
    }
    Ok(())
}
