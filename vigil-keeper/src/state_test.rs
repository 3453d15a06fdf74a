use anyhow::Result;

use vigil_core::protocol::AssignedNodeState;
use vigil_core::NodeState;

use super::state::{KeeperState, STATE_FILE_VERSION};

fn assigned(node_id: i64, group_id: i32, state: NodeState) -> AssignedNodeState {
    AssignedNodeState {
        node_id,
        group_id,
        state,
        candidate_priority: 50,
        replication_quorum: true,
        name: None,
    }
}

#[test]
fn missing_state_file_reads_as_none() -> Result<()> {
    let tmpdir = tempfile::tempdir_in("/tmp")?;
    let path = tmpdir.path().join("keeper.state");
    assert!(KeeperState::read(&path)?.is_none(), "a missing file must read as None");
    Ok(())
}

#[test]
fn state_round_trips_through_disk() -> Result<()> {
    let tmpdir = tempfile::tempdir_in("/tmp")?;
    let path = tmpdir.path().join("keeper.state");

    let mut state = KeeperState::default();
    state.update_from_monitor(&assigned(1, 0, NodeState::Single), true)?;
    state.check_system_identifier(7_215_967_702_690_434_019)?;
    state.write(&path)?;

    let read = KeeperState::read(&path)?.expect("the state file must exist after a write");
    assert!(read == state, "state round trip mismatch, got {:?}, expected {:?}", read, state);
    assert!(read.current_node_id == 1);
    assert!(read.assigned_role == NodeState::Single);
    assert!(read.current_role == NodeState::Init);
    Ok(())
}

#[test]
fn writes_leave_no_temp_file_behind() -> Result<()> {
    let tmpdir = tempfile::tempdir_in("/tmp")?;
    let path = tmpdir.path().join("keeper.state");
    KeeperState::default().write(&path)?;

    let leftovers: Vec<_> = std::fs::read_dir(tmpdir.path())?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_name() != "keeper.state")
        .collect();
    assert!(leftovers.is_empty(), "unexpected files next to the state file: {:?}", leftovers);
    Ok(())
}

#[test]
fn unknown_versions_are_rejected() -> Result<()> {
    let tmpdir = tempfile::tempdir_in("/tmp")?;
    let path = tmpdir.path().join("keeper.state");

    let mut state = KeeperState::default();
    state.version = STATE_FILE_VERSION + 1;
    let contents = serde_json::to_string(&state)?;
    std::fs::write(&path, contents)?;

    assert!(KeeperState::read(&path).is_err(), "a newer layout version must be rejected");
    Ok(())
}

#[test]
fn node_id_is_fixed_once_set() -> Result<()> {
    let mut state = KeeperState::default();
    state.update_from_monitor(&assigned(1, 0, NodeState::Single), true)?;

    // Same id again: idempotent.
    state.update_from_monitor(&assigned(1, 0, NodeState::Single), true)?;
    assert!(state.current_node_id == 1);

    // A different id is rejected and leaves the state untouched.
    let result = state.update_from_monitor(&assigned(2, 0, NodeState::Single), true);
    assert!(result.is_err(), "a changed node id must be rejected");
    assert!(state.current_node_id == 1);
    Ok(())
}

#[test]
fn system_identifier_is_fixed_once_nonzero() -> Result<()> {
    let mut state = KeeperState::default();
    state.check_system_identifier(42)?;
    state.check_system_identifier(42)?;
    assert!(state.system_identifier == 42);

    assert!(
        state.check_system_identifier(43).is_err(),
        "a changed system identifier must be fatal"
    );
    Ok(())
}

#[test]
fn unlink_tolerates_a_missing_file() -> Result<()> {
    let tmpdir = tempfile::tempdir_in("/tmp")?;
    let path = tmpdir.path().join("keeper.state");
    KeeperState::unlink(&path)?;

    KeeperState::default().write(&path)?;
    KeeperState::unlink(&path)?;
    assert!(!path.exists(), "the state file must be gone after unlink");
    Ok(())
}

#[test]
fn contact_timestamps_start_at_zero() {
    let state = KeeperState::default();
    assert!(state.last_monitor_contact == 0);
    assert!(state.last_secondary_contact == 0);
    assert!(state.current_node_id == -1);
}
