//! Lease safety across independent queue store instances sharing one database,
//! the way several dispatcher processes share one queue table.

mod test_utils;

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};
use sync_engine::models::{JobStatus, TargetService};
use sync_engine::repositories::{JobFilter, QueueStore};
use test_utils::{project_job, queue_store, setup_test_db};

#[tokio::test]
async fn concurrent_dispatchers_never_lease_the_same_job() {
    let db = setup_test_db().await.unwrap();
    let seed = queue_store(&db);
    for i in 0..20 {
        seed.enqueue(project_job(&format!("p-{i}"), TargetService::Crm, 5))
            .await
            .unwrap();
    }

    let now = Utc::now() + ChronoDuration::seconds(1);
    let mut tasks = Vec::new();
    for _ in 0..4 {
        let store: Arc<dyn QueueStore> = Arc::new(queue_store(&db));
        tasks.push(tokio::spawn(async move {
            let mut leased = Vec::new();
            loop {
                let batch = store.lease_batch(3, now).await.unwrap();
                if batch.is_empty() {
                    break;
                }
                leased.extend(batch.into_iter().map(|job| job.id));
            }
            leased
        }));
    }

    let mut seen = HashSet::new();
    let mut total = 0;
    for task in tasks {
        for id in task.await.unwrap() {
            total += 1;
            assert!(seen.insert(id), "job {id} leased twice");
        }
    }

    assert_eq!(total, 20);
    let counts = seed.counts().await.unwrap();
    assert_eq!(counts.processing, 20);
    assert_eq!(counts.pending, 0);
}

#[tokio::test]
async fn lease_order_follows_priority_then_age() {
    let db = setup_test_db().await.unwrap();
    let queue = queue_store(&db);

    let low = queue
        .enqueue(project_job("low", TargetService::Fsm, 8))
        .await
        .unwrap();
    let critical = queue
        .enqueue(project_job("critical", TargetService::Fsm, 1))
        .await
        .unwrap();
    let medium_first = queue
        .enqueue(project_job("medium-a", TargetService::Fsm, 5))
        .await
        .unwrap();
    let medium_second = queue
        .enqueue(project_job("medium-b", TargetService::Fsm, 5))
        .await
        .unwrap();

    let now = Utc::now() + ChronoDuration::seconds(1);
    let first = queue.lease_batch(2, now).await.unwrap();
    let second = queue.lease_batch(2, now).await.unwrap();

    let order: Vec<i32> = first.iter().chain(second.iter()).map(|job| job.id).collect();
    assert_eq!(order, vec![critical, medium_first, medium_second, low]);
}

#[tokio::test]
async fn expired_leases_return_to_pending_for_another_dispatcher() {
    let db = setup_test_db().await.unwrap();
    let crashed = queue_store(&db);
    let survivor = queue_store(&db);

    let id = crashed
        .enqueue(project_job("p-1", TargetService::Books, 5))
        .await
        .unwrap();

    let now = Utc::now() + ChronoDuration::seconds(1);
    assert_eq!(crashed.lease_batch(1, now).await.unwrap().len(), 1);
    assert!(survivor.lease_batch(1, now).await.unwrap().is_empty());

    let after_expiry = now + ChronoDuration::seconds(301);
    assert_eq!(survivor.release_expired_leases(after_expiry).await.unwrap(), 1);

    let job = survivor.get(id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Pending);
    assert!(job.lease_owner.is_none());

    let released = survivor.lease_batch(1, after_expiry).await.unwrap();
    assert_eq!(released.len(), 1);
    assert_eq!(released[0].id, id);

    let processing = survivor
        .list(&JobFilter {
            status: Some(JobStatus::Processing),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(processing.len(), 1);
}
