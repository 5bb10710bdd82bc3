use crate::replay::ReplayFile;
use crate::sim::{GameSimulation, LevelCatalog};

/// Outcome of judging one submitted replay. A rejection is server-visible only: the
/// client is never told why (or that) a submission was discarded, so the detection
/// threshold stays opaque.
#[derive(Debug, PartialEq)]
pub enum ReplayVerdict {
    /// The replay checks out; persist this score value.
    Accepted(f64),
    Rejected(RejectReason),
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum RejectReason {
    UnknownLevel,
    UnscoredLevel,
    ValidatorMismatch,
    ExecutionFailed,
    ToleranceExceeded,
}

impl RejectReason {
    pub fn as_str(self) -> &'static str {
        match self {
            RejectReason::UnknownLevel => "unknown pack/level",
            RejectReason::UnscoredLevel => "level is not scored",
            RejectReason::ValidatorMismatch => "replay does not match the announced level",
            RejectReason::ExecutionFailed => "replay could not be executed",
            RejectReason::ToleranceExceeded => "score outside wall clock tolerance",
        }
    }
}

/// True when the re-executed score agrees with the wall clock within the tolerance.
/// The boundary is inclusive: a difference of exactly the tolerance is accepted.
#[inline]
pub fn within_tolerance(replay_score: f64, wall_elapsed_secs: f64, tolerance_secs: f64) -> bool {
    (replay_score - wall_elapsed_secs).abs() <= tolerance_secs
}

/// Judges one replay submission against the `StartedGame` baseline. The declared
/// pack/level must exist and award scores, the replay must compete under the level
/// key announced by `StartedGame`, and its deterministic re-execution must land
/// within `tolerance_secs` of the wall clock elapsed since that announcement.
///
/// Pauses or non-deterministic level scripting can fail honest runs here; this is a
/// heuristic filter, not a proof.
pub fn judge_replay(
    sim: &dyn GameSimulation,
    catalog: &dyn LevelCatalog,
    replay: &ReplayFile,
    announced_validator: &str,
    wall_elapsed_secs: f64,
    tolerance_secs: f64,
) -> ReplayVerdict {
    if !catalog.level_exists(&replay.pack_id, &replay.level_id) {
        return ReplayVerdict::Rejected(RejectReason::UnknownLevel);
    }

    if !catalog.level_scored(&replay.pack_id, &replay.level_id) {
        return ReplayVerdict::Rejected(RejectReason::UnscoredLevel);
    }

    if replay.level_validator() != announced_validator {
        return ReplayVerdict::Rejected(RejectReason::ValidatorMismatch);
    }

    let replay_score = match sim.execute_replay(replay) {
        Some(score) => score,
        None => return ReplayVerdict::Rejected(RejectReason::ExecutionFailed),
    };

    if !within_tolerance(replay_score, wall_elapsed_secs, tolerance_secs) {
        return ReplayVerdict::Rejected(RejectReason::ToleranceExceeded);
    }

    ReplayVerdict::Accepted(replay_score)
}
