//! Commit position advancement of a leader

use super::{ConditionRegistration, ControllerEvent, RaftContext};
use crate::{raft::Raft, Position, POSITION_NULL};
use tracing::info;

/// Highest position held by at least `quorum` of the given positions
///
/// `matches` are the follower match positions; the leader's own append
/// position counts as one more. The positions are sorted ascending and the
/// quorum-th largest is selected.
pub fn quorum_position(matches: &[Position], leader_position: Position, quorum: usize) -> Position {
    let mut positions = Vec::with_capacity(matches.len() + 1);
    positions.extend_from_slice(matches);
    positions.push(leader_position);
    positions.sort_unstable();

    if quorum == 0 || quorum > positions.len() {
        return POSITION_NULL;
    }
    positions[positions.len() - quorum]
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitPhase {
    Closed,
    Open,
}

#[derive(Debug)]
pub struct AdvanceCommitController {
    phase: CommitPhase,
    appended: Option<ConditionRegistration>,
}

impl AdvanceCommitController {
    pub fn new() -> Self {
        Self {
            phase: CommitPhase::Closed,
            appended: None,
        }
    }

    pub fn phase(&self) -> CommitPhase {
        self.phase
    }

    pub fn open(&mut self, raft: &Raft, ctx: &RaftContext) {
        if self.phase == CommitPhase::Closed {
            self.appended = Some(
                ctx.register_condition(raft.log_stream().on_append(), ControllerEvent::Appended),
            );
            self.phase = CommitPhase::Open;
        }
    }

    pub fn close(&mut self) {
        self.appended = None;
        self.phase = CommitPhase::Closed;
    }

    pub fn do_work(&mut self, raft: &Raft) -> usize {
        if self.phase == CommitPhase::Closed {
            return 0;
        }

        // nothing of an older term commits before this term's initial event
        let Some(initial_event_position) = raft.initial_event_position() else {
            return 0;
        };

        let log = raft.log_stream();
        let matches: Vec<Position> = raft.members().iter().map(|m| m.match_position()).collect();
        let candidate = quorum_position(&matches, log.current_appender_position(), raft.quorum());

        let commit_position = log.commit_position();
        if candidate <= commit_position || candidate < initial_event_position {
            return 0;
        }

        log.set_commit_position(candidate);
        if log.commit_position() == commit_position {
            return 0;
        }

        info!(
            "Partition {}: commit position {} -> {} in term {}",
            raft.partition_id(),
            commit_position,
            log.commit_position(),
            raft.term()
        );
        1
    }
}

impl Default for AdvanceCommitController {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log_stream::{EventType, LogStream};
    use crate::testing::{addr, context, raft, ScriptedTransport};
    use proptest::prelude::*;

    #[test]
    fn test_quorum_position_picks_quorum_th_largest() {
        // leader 5, A 5, B 3
        assert_eq!(quorum_position(&[5, 3], 5, 2), 5);

        assert_eq!(quorum_position(&[], 7, 1), 7);
        assert_eq!(quorum_position(&[4], 9, 2), 4);
        assert_eq!(quorum_position(&[1, 2, 3, 4], 5, 3), 3);
        assert_eq!(quorum_position(&[POSITION_NULL, POSITION_NULL], 3, 2), POSITION_NULL);
    }

    async fn leader_with_events(count: usize) -> (Raft, std::sync::Arc<crate::MemoryLogStream>) {
        let (mut raft, log) = raft(vec![addr(2), addr(3)]);
        raft.become_candidate();
        raft.become_leader();
        log.open_appender().await.unwrap();
        for _ in 0..count {
            log.append(raft.term(), EventType::Application, vec![1]).unwrap();
        }
        (raft, log)
    }

    #[tokio::test]
    async fn test_commit_follows_quorum() {
        let (mut raft, log) = leader_with_events(6).await;
        let (ctx, _events) = context(ScriptedTransport::silent());
        let mut commit = AdvanceCommitController::new();
        commit.open(&raft, &ctx);
        raft.set_initial_event_position(0);

        raft.member_mut(addr(2)).unwrap().update_match_position(5);
        raft.member_mut(addr(3)).unwrap().update_match_position(3);

        assert_eq!(commit.do_work(&raft), 1);
        assert_eq!(log.commit_position(), 5);
        assert_eq!(commit.do_work(&raft), 0);
    }

    #[tokio::test]
    async fn test_nothing_commits_before_initial_event() {
        let (mut raft, log) = leader_with_events(4).await;
        let (ctx, _events) = context(ScriptedTransport::silent());
        let mut commit = AdvanceCommitController::new();
        commit.open(&raft, &ctx);

        raft.member_mut(addr(2)).unwrap().update_match_position(2);
        assert_eq!(commit.do_work(&raft), 0);

        raft.set_initial_event_position(3);
        assert_eq!(commit.do_work(&raft), 0);
        assert_eq!(log.commit_position(), POSITION_NULL);

        raft.member_mut(addr(3)).unwrap().update_match_position(3);
        assert_eq!(commit.do_work(&raft), 1);
        assert_eq!(log.commit_position(), 3);
    }

    #[tokio::test]
    async fn test_closed_controller_does_nothing() {
        let (mut raft, log) = leader_with_events(2).await;
        let mut commit = AdvanceCommitController::new();
        raft.set_initial_event_position(0);
        raft.member_mut(addr(2)).unwrap().update_match_position(1);

        assert_eq!(commit.do_work(&raft), 0);
        assert_eq!(log.commit_position(), POSITION_NULL);
    }

    proptest! {
        #[test]
        fn prop_quorum_position_is_held_by_a_quorum(
            matches in prop::collection::vec(-1i64..100, 0..8),
            leader in 0i64..100,
        ) {
            let quorum = (matches.len() + 1) / 2 + 1;
            let position = quorum_position(&matches, leader, quorum);

            let holders = matches.iter().chain(std::iter::once(&leader))
                .filter(|&&p| p >= position)
                .count();
            prop_assert!(holders >= quorum);

            let above = matches.iter().chain(std::iter::once(&leader))
                .filter(|&&p| p > position)
                .count();
            prop_assert!(above < quorum);
        }
    }
}
