// Replay passes and the plans that sequence them

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Forward,
    Backward,
}

/// One replay pass and the analytical purpose of its handler set
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Forward replay detecting late senders and collective wait states
    Main,
    /// Backward replay detecting late receivers and sender-side synchpoints
    BackwardWaitStates,
    /// Forward replay completing synchpoints and filling the timemap cache
    ForwardSynchpoints,
    /// Backward replay attributing wait states to root causes
    BackwardDelay,
    /// Forward replay handing indirect-wait shares to waiters
    ForwardPropagation,
}

impl Stage {
    pub const COUNT: usize = 5;

    pub const ALL: [Stage; Stage::COUNT] = [
        Stage::Main,
        Stage::BackwardWaitStates,
        Stage::ForwardSynchpoints,
        Stage::BackwardDelay,
        Stage::ForwardPropagation,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn direction(self) -> Direction {
        match self {
            Stage::Main | Stage::ForwardSynchpoints | Stage::ForwardPropagation => Direction::Forward,
            Stage::BackwardWaitStates | Stage::BackwardDelay => Direction::Backward,
        }
    }

    pub fn is_backward(self) -> bool {
        self.direction() == Direction::Backward
    }

    pub fn name(self) -> &'static str {
        match self {
            Stage::Main => "main",
            Stage::BackwardWaitStates => "bws",
            Stage::ForwardSynchpoints => "fws",
            Stage::BackwardDelay => "bwc",
            Stage::ForwardPropagation => "fwc",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Which passes a job runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PassPlan {
    /// Main pass only
    Single,
    /// Main pass and backward wait-state detection
    Basic,
    /// All five passes, required by delay and critical-path analysis
    Full,
}

impl PassPlan {
    pub fn stages(self) -> &'static [Stage] {
        match self {
            PassPlan::Single => &Stage::ALL[..1],
            PassPlan::Basic => &Stage::ALL[..2],
            PassPlan::Full => &Stage::ALL,
        }
    }
}
