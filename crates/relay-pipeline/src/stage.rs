use std::fmt;

use relay_types::node::RankTopology;
use tracing::trace;

use crate::error::{PipelineError, Result};

// ── Stage State Machine ──────────────────────────────────────────────────────

/// Receive → Embed → Layers → Head → Send → Done
///
/// A rank walks the subset that applies to it: only rank 0 embeds, only the
/// last rank applies the head, every rank but the last sends and every rank
/// but the first receives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageState {
    /// Waiting for the previous rank's hidden state.
    Receive,
    /// Turning token ids into the first hidden state.
    Embed,
    /// Running this rank's slice of the layer stack.
    Layers,
    /// Output projection, final norm and head.
    Head,
    /// Handing the hidden state to the next rank.
    Send,
    Done,
}

impl fmt::Display for StageState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Receive => write!(f, "Receive"),
            Self::Embed   => write!(f, "Embed"),
            Self::Layers  => write!(f, "Layers"),
            Self::Head    => write!(f, "Head"),
            Self::Send    => write!(f, "Send"),
            Self::Done    => write!(f, "Done"),
        }
    }
}

// ── Stage Progress ───────────────────────────────────────────────────────────

/// Tracks one rank through a single forward pass.
#[derive(Debug, Clone)]
pub struct StageProgress {
    topology: RankTopology,
    path: Vec<StageState>,
    position: usize,
}

impl StageProgress {
    pub fn new(topology: RankTopology) -> Self {
        Self {
            topology,
            path: Self::path_for(topology),
            position: 0,
        }
    }

    /// The states a rank passes through, in order.
    pub fn path_for(topology: RankTopology) -> Vec<StageState> {
        let mut path = Vec::with_capacity(5);
        if topology.is_first() {
            path.push(StageState::Embed);
        } else {
            path.push(StageState::Receive);
        }
        path.push(StageState::Layers);
        if topology.is_last() {
            path.push(StageState::Head);
        } else {
            path.push(StageState::Send);
        }
        path.push(StageState::Done);
        path
    }

    pub fn state(&self) -> StageState {
        self.path[self.position]
    }

    pub fn is_done(&self) -> bool {
        self.state() == StageState::Done
    }

    /// Move to `to`, which must be the next state on this rank's path.
    pub fn advance(&mut self, to: StageState) -> Result<()> {
        let from = self.state();
        match self.path.get(self.position + 1) {
            Some(next) if *next == to => {
                self.position += 1;
                trace!(topology = %self.topology, %from, %to, "stage transition");
                Ok(())
            }
            _ => Err(PipelineError::InvalidTransition {
                from: from.to_string(),
                to: to.to_string(),
            }),
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use StageState::*;

    fn topo(rank: u32, ws: u32) -> RankTopology {
        RankTopology::new(rank, ws).unwrap()
    }

    #[test]
    fn paths_per_position() {
        assert_eq!(StageProgress::path_for(topo(0, 1)), vec![Embed, Layers, Head, Done]);
        assert_eq!(StageProgress::path_for(topo(0, 3)), vec![Embed, Layers, Send, Done]);
        assert_eq!(StageProgress::path_for(topo(1, 3)), vec![Receive, Layers, Send, Done]);
        assert_eq!(StageProgress::path_for(topo(2, 3)), vec![Receive, Layers, Head, Done]);
    }

    #[test]
    fn happy_path_for_middle_rank() {
        let mut p = StageProgress::new(topo(1, 3));
        assert_eq!(p.state(), Receive);
        p.advance(Layers).unwrap();
        p.advance(Send).unwrap();
        assert!(!p.is_done());
        p.advance(Done).unwrap();
        assert!(p.is_done());
    }

    #[test]
    fn skipping_a_state_is_rejected() {
        let mut p = StageProgress::new(topo(0, 2));
        let err = p.advance(Send).unwrap_err();
        assert!(matches!(
            err,
            PipelineError::InvalidTransition { ref from, ref to } if from == "Embed" && to == "Send"
        ));
        // State unchanged after a rejected transition.
        assert_eq!(p.state(), Embed);
    }

    #[test]
    fn states_outside_the_path_are_rejected() {
        let mut p = StageProgress::new(topo(1, 2));
        assert!(p.advance(Embed).is_err());
        p.advance(Layers).unwrap();
        assert!(p.advance(Send).is_err());
        p.advance(Head).unwrap();
    }

    #[test]
    fn nothing_follows_done() {
        let t = topo(0, 1);
        let mut p = StageProgress::new(t);
        for state in StageProgress::path_for(t).into_iter().skip(1) {
            p.advance(state).unwrap();
        }
        assert!(p.is_done());
        assert!(p.advance(Done).is_err());
        assert!(p.advance(Receive).is_err());
    }
}
