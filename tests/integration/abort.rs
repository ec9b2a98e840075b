//! Integration test: aborting jobs.
//!
//! Abort is cooperative. Jobs observe it at range boundaries and while
//! waiting for gate permits, then fail; ranges already admitted finish.

use std::sync::Arc;
use std::time::Duration;

use reef_integration_tests::{
    MAX_REPAIR_MEMORY_PER_RANGE, MIB, RangeScript, TaskEvent, TestShard, eventually, range,
};
use reef_repair::{RepairError, RepairJob, RepairRegistry};
use reef_types::{RepairJobId, RepairStatus};
use tokio::time::Instant;

/// Run a job whose body parks until it observes abort.
fn spawn_parked(
    registry: &Arc<RepairRegistry>,
    id: RepairJobId,
) -> tokio::task::JoinHandle<Result<(), RepairError>> {
    let registry = registry.clone();
    tokio::spawn(async move {
        registry
            .run(id, |ctx| async move {
                ctx.abort_token().cancelled().await;
                ctx.check_aborted()
            })
            .await
    })
}

/// Three running jobs; after abort each observes it and fails, and the
/// active list shrinks to nothing.
#[tokio::test]
async fn test_abort_all_running_jobs() {
    let shard = TestShard::new(256 * MIB);
    let registry = &shard.registry;
    let ids: Vec<_> = (0..3).map(|_| registry.new_id()).collect();
    let handles: Vec<_> = ids.iter().map(|id| spawn_parked(registry, *id)).collect();
    eventually("three jobs running", || registry.active().len() == 3).await;
    assert_eq!(registry.active(), vec![1, 2, 3]);

    registry.abort_all();
    for handle in handles {
        let err = handle.await.unwrap().unwrap_err();
        assert!(matches!(err, RepairError::Aborted(_)));
    }

    assert!(registry.active().is_empty());
    for id in &ids {
        assert_eq!(registry.get(id.sequence_number), RepairStatus::Failed);
        assert_eq!(
            shard.hierarchy.events_for(id.task_id()),
            vec![
                TaskEvent::Started(id.task_id()),
                TaskEvent::Aborted(id.task_id()),
                TaskEvent::Finished(id.task_id(), RepairStatus::Failed),
            ]
        );
    }
}

/// Jobs waiting on the gate fail at once; the job holding the gate keeps
/// running until its admitted range finishes.
#[tokio::test]
async fn test_abort_only_stops_unadmitted_work() {
    let shard = TestShard::new(MAX_REPAIR_MEMORY_PER_RANGE);
    shard.repairer.script(&[range(0)], RangeScript::Hold);

    let holder = shard.user_job("ks", &[range(0)]);
    let holder_seq = holder.id().sequence_number;
    let holder_handle = shard.spawn(holder);
    eventually("holder admitted", || shard.repairer.started_count() == 1).await;

    let waiting: Vec<_> = (1..3)
        .map(|i| shard.user_job("ks", &[range(i)]))
        .collect();
    let waiting_seqs: Vec<u64> = waiting.iter().map(|j| j.id().sequence_number).collect();
    let waiting_handles: Vec<_> = waiting.into_iter().map(|j| shard.spawn(j)).collect();
    eventually("all three running", || shard.registry.active().len() == 3).await;

    shard.registry.abort_all();
    for handle in waiting_handles {
        let err = handle.await.unwrap().unwrap_err();
        assert!(matches!(err, RepairError::Aborted(_)));
    }
    assert_eq!(shard.registry.active(), vec![holder_seq]);
    for seq in waiting_seqs {
        assert_eq!(shard.registry.get(seq), RepairStatus::Failed);
    }

    shard.repairer.release(1);
    holder_handle.await.unwrap().unwrap();
    assert_eq!(shard.registry.get(holder_seq), RepairStatus::Successful);
    assert_eq!(shard.repairer.started(), vec![range(0)]);
    shard.assert_gate_balanced();
}

/// A job issued before abort but started after it fails without touching
/// the gate or the data path.
#[tokio::test]
async fn test_abort_before_start() {
    let shard = TestShard::new(256 * MIB);
    let job = shard.user_job("ks", &[range(0), range(1)]);
    let task = job.id().task_id();

    shard.registry.abort_all();
    assert!(shard.registry.is_aborted(&task));

    let err = job.execute(&shard.registry).await.unwrap_err();
    assert!(matches!(err, RepairError::Aborted(_)));
    assert!(!shard.registry.is_aborted(&task));
    assert_eq!(
        shard.registry.get(job.id().sequence_number),
        RepairStatus::Failed
    );
    assert_eq!(shard.repairer.started_count(), 0);
    assert_eq!(shard.registry.gate().stats().acquired_bytes, 0);
    assert_eq!(
        shard.hierarchy.events_for(task),
        vec![
            TaskEvent::Registered(task, "user_requested".to_string()),
            TaskEvent::Started(task),
            TaskEvent::Finished(task, RepairStatus::Failed),
        ]
    );
}

/// Ids issued after an abort are unaffected by it.
#[tokio::test]
async fn test_abort_is_not_sticky() {
    let shard = TestShard::new(256 * MIB);
    shard.registry.abort_all();

    let job = shard.user_job("ks", &[range(0)]);
    assert!(!shard.registry.is_aborted(&job.id().task_id()));
    job.execute(&shard.registry).await.unwrap();
    assert_eq!(
        shard.registry.get(job.id().sequence_number),
        RepairStatus::Successful
    );
}

/// Completion waiters wake when aborted jobs fail.
#[tokio::test]
async fn test_abort_wakes_completion_waiters() {
    let shard = TestShard::new(256 * MIB);
    let id = shard.registry.new_id();
    let handle = spawn_parked(&shard.registry, id);
    eventually("job running", || shard.registry.running_count() == 1).await;

    let waiter = {
        let registry = shard.registry.clone();
        tokio::spawn(async move {
            registry
                .await_completion(id.sequence_number, Instant::now() + Duration::from_secs(5))
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    shard.registry.abort_all();
    handle.await.unwrap().unwrap_err();
    assert_eq!(waiter.await.unwrap().unwrap(), RepairStatus::Failed);
}
