//! The keeper's finite state machine.
//!
//! The FSM is a table keyed by (current role, assigned role). Each entry
//! names the action which drives the local database toward the assigned
//! role; the action bodies live on the `Keeper`, which owns the monitor
//! client and the local resources. A transition is only recorded as reached
//! once its action succeeds; failure leaves the current role unchanged and
//! the loop retries on its next tick.

use vigil_core::NodeState;

/// The concrete operation performed by a transition.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransitionAction {
    /// Start postgres as a standalone primary and apply default settings.
    StartAsSingle,
    /// Nothing to do locally; the state is reached by reporting it.
    Confirm,
    /// Build the data directory from a base backup of the primary and start
    /// postgres as a standby.
    InitFromBackup,
    /// Rewrite the standby configuration toward the current primary,
    /// restarting postgres when it changed.
    FollowPrimary,
    /// Install the monitor's synchronous_standby_names value.
    EnableSyncRep,
    /// Clear synchronous_standby_names; the standby is gone.
    DisableSyncRep,
    /// Stop postgres.
    StopPostgres,
    /// Postgres must already be stopped; verify and report.
    ConfirmStopped,
    /// Start postgres again as a standby, after maintenance.
    RestartAsStandby,
    /// Rejoin the group as a standby after a demotion: rewind against the
    /// new primary (base backup as fallback) and start.
    RejoinAsStandby,
    /// The rest of the group is gone; start postgres and serve alone.
    ResumeAsSingle,
    /// Catch up on received WAL and checkpoint ahead of a promotion.
    CatchupAndCheckpoint,
    /// Promote, keeping the node read-only until the old primary stepped
    /// down.
    PromoteReadOnly,
    /// Promote and accept writes.
    Promote,
    /// Drop the read-only guard installed during promotion.
    MakeReadWrite,
    /// Report our last received LSN for the failover election.
    ReportLastLsn,
    /// Replay the WAL we miss from the most advanced standby.
    FastForwardWal,
    /// The monitor removed this node; stop postgres.
    DropNode,
}

/// A row of the transition table.
#[derive(Clone, Copy, Debug)]
pub struct Transition {
    pub current: NodeState,
    pub assigned: NodeState,
    pub action: TransitionAction,
}

use NodeState::*;
use TransitionAction::*;

/// The transition table. `Any` is a wildcard for the current role; exact
/// matches take precedence.
pub const TRANSITIONS: &[Transition] = &[
    Transition { current: Init, assigned: Single, action: StartAsSingle },
    Transition { current: Init, assigned: WaitStandby, action: Confirm },
    Transition { current: WaitStandby, assigned: Catchingup, action: InitFromBackup },
    Transition { current: Catchingup, assigned: Secondary, action: Confirm },
    Transition { current: Secondary, assigned: Catchingup, action: FollowPrimary },
    Transition { current: Single, assigned: WaitPrimary, action: Confirm },
    Transition { current: WaitPrimary, assigned: Single, action: DisableSyncRep },
    Transition { current: WaitPrimary, assigned: Primary, action: EnableSyncRep },
    Transition { current: Primary, assigned: WaitPrimary, action: DisableSyncRep },
    Transition { current: Primary, assigned: ApplySettings, action: EnableSyncRep },
    Transition { current: ApplySettings, assigned: Primary, action: Confirm },
    Transition { current: Primary, assigned: PrepareMaintenance, action: StopPostgres },
    Transition { current: PrepareMaintenance, assigned: Maintenance, action: ConfirmStopped },
    Transition { current: Secondary, assigned: WaitMaintenance, action: Confirm },
    Transition { current: WaitMaintenance, assigned: Maintenance, action: StopPostgres },
    Transition { current: Maintenance, assigned: Catchingup, action: RestartAsStandby },
    Transition { current: Primary, assigned: Draining, action: StopPostgres },
    Transition { current: Draining, assigned: Demoted, action: ConfirmStopped },
    Transition { current: Primary, assigned: Demoted, action: StopPostgres },
    Transition { current: Primary, assigned: DemoteTimeout, action: StopPostgres },
    Transition { current: DemoteTimeout, assigned: Demoted, action: ConfirmStopped },
    Transition { current: Demoted, assigned: Catchingup, action: RejoinAsStandby },
    Transition { current: Demoted, assigned: Single, action: ResumeAsSingle },
    Transition { current: Secondary, assigned: PreparePromotion, action: CatchupAndCheckpoint },
    Transition { current: PreparePromotion, assigned: StopReplication, action: PromoteReadOnly },
    Transition { current: PreparePromotion, assigned: WaitPrimary, action: Promote },
    Transition { current: StopReplication, assigned: WaitPrimary, action: MakeReadWrite },
    Transition { current: Secondary, assigned: ReportLsn, action: ReportLastLsn },
    Transition { current: ReportLsn, assigned: Secondary, action: FollowPrimary },
    Transition { current: ReportLsn, assigned: WaitPrimary, action: Promote },
    Transition { current: ReportLsn, assigned: FastForward, action: FastForwardWal },
    Transition { current: FastForward, assigned: PreparePromotion, action: CatchupAndCheckpoint },
    Transition { current: FastForward, assigned: Secondary, action: FollowPrimary },
    Transition { current: Any, assigned: Dropped, action: DropNode },
];

/// Look up the transition for (current, assigned), exact match first, then
/// the `Any` wildcard.
pub fn find_transition(current: NodeState, assigned: NodeState) -> Option<&'static Transition> {
    TRANSITIONS
        .iter()
        .find(|transition| transition.current == current && transition.assigned == assigned)
        .or_else(|| {
            TRANSITIONS
                .iter()
                .find(|transition| transition.current == Any && transition.assigned == assigned)
        })
}

/// Whether `ensure_current_state` should run before attempting a transition.
///
/// Around the demotion states the database is meant to be down; normalizing
/// the current state first would start it and open a split-brain hazard, so
/// the step is skipped whenever current or assigned role is one of them.
pub fn should_ensure_current_state(current: NodeState, assigned: NodeState) -> bool {
    if current == assigned {
        return false;
    }
    !current.keeps_postgres_down() && !assigned.keeps_postgres_down()
}
