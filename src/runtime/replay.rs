use std::sync::Arc;

use crate::runtime::OrchestrationHandler;
use crate::{Event, TurnResult};

/// Output of a replayed turn: the handler's result once it returned.
pub type TurnOutcome = TurnResult<Result<String, String>>;

pub trait ReplayEngine: Send + Sync {
    /// Replay one turn of `handler` over `history`. Events at or past
    /// `replay_frontier` count as new for replay-safe logging.
    fn replay(
        &self,
        history: Vec<Event>,
        turn_index: u64,
        replay_frontier: usize,
        handler: Arc<dyn OrchestrationHandler>,
        input: String,
    ) -> TurnOutcome;
}

pub struct DefaultReplayEngine;

impl Default for DefaultReplayEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl DefaultReplayEngine {
    pub fn new() -> Self {
        Self
    }
}

impl ReplayEngine for DefaultReplayEngine {
    fn replay(
        &self,
        history: Vec<Event>,
        turn_index: u64,
        replay_frontier: usize,
        handler: Arc<dyn OrchestrationHandler>,
        input: String,
    ) -> TurnOutcome {
        let orchestrator = |ctx: crate::OrchestrationContext| {
            let h = handler.clone();
            let inp = input.clone();
            async move { h.invoke(ctx, inp).await }
        };
        crate::run_turn_with(history, turn_index, replay_frontier, orchestrator)
    }
}
