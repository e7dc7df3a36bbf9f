use crawlhub::CrawlError;
use crawlhub::job::{CatalogEntry, JobStatus};
use crawlhub::job_store::{DoneOutcome, FailOutcome, JobStore, LeaseOutcome};
use std::collections::HashSet;
use std::time::Duration;

const TTL: Duration = Duration::from_secs(10);

fn granted(outcome: LeaseOutcome) -> (String, u32) {
    match outcome {
        LeaseOutcome::Granted(grant) => (grant.job.job_id, grant.attempt),
        LeaseOutcome::NoWorkAvailable => panic!("expected a lease"),
    }
}

/// Worker A leases with a 10s TTL and goes silent. After the TTL, worker B gets
/// the same job. A's late report is rejected; B's is accepted.
#[test]
fn test_expired_lease_is_reassigned_and_late_report_rejected() {
    let mut store = JobStore::new(3);
    store.load(vec![CatalogEntry::new("clinic-1")]).unwrap();

    let (job_a, attempt_a) = granted(store.lease_next_at("worker-a", TTL, 0));
    assert_eq!(attempt_a, 1);
    assert!(matches!(store.lease_next_at("worker-b", TTL, 5_000), LeaseOutcome::NoWorkAvailable));

    let (job_b, attempt_b) = granted(store.lease_next_at("worker-b", TTL, 10_001));
    assert_eq!(job_a, job_b);
    assert_eq!(attempt_b, 2);

    let late = store.mark_done_at(&job_a, "worker-a", 12_000);
    assert!(matches!(late, Err(CrawlError::LeaseMismatch { .. })));

    assert_eq!(store.mark_done_at(&job_b, "worker-b", 12_500).unwrap(), DoneOutcome::Completed);
    let job = store.get(&job_b).unwrap();
    assert_eq!(job.status, JobStatus::Done);
    assert_eq!(job.completed_by.as_deref(), Some("worker-b"));
    assert!(job.lease_owner.is_none());
}

/// With max_attempts = 2 a job that fails twice is never offered a third time and
/// ends up `failed`.
#[test]
fn test_attempt_bound_ends_in_failed() {
    let mut store = JobStore::new(2);
    store.load(vec![CatalogEntry::new("clinic-1")]).unwrap();

    let (job_id, _) = granted(store.lease_next_at("w1", TTL, 0));
    assert_eq!(
        store.mark_failed_at(&job_id, "w1", "timeout", 100).unwrap(),
        FailOutcome::Requeued { attempts_left: 1 }
    );

    let (again, attempt) = granted(store.lease_next_at("w2", TTL, 200));
    assert_eq!(again, job_id);
    assert_eq!(attempt, 2);
    assert_eq!(store.mark_failed_at(&job_id, "w2", "blocked", 300).unwrap(), FailOutcome::Failed);

    assert!(matches!(store.lease_next_at("w3", TTL, 400), LeaseOutcome::NoWorkAvailable));
    let job = store.get(&job_id).unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.attempt_count, 2);
    assert_eq!(job.last_error.as_deref(), Some("blocked"));
    assert!(store.is_complete());
}

/// A lease that expires on the last attempt becomes `failed` instead of waiting
/// for a lease that can never be granted.
#[test]
fn test_expiry_on_last_attempt_fails_job() {
    let mut store = JobStore::new(1);
    store.load(vec![CatalogEntry::new("clinic-1")]).unwrap();
    let (job_id, _) = granted(store.lease_next_at("w1", TTL, 0));

    assert_eq!(store.sweep_expired_leases_at(20_000), 1);

    let job = store.get(&job_id).unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.last_error.as_deref(), Some("lease expired"));
    assert!(store.is_complete());
}

/// Concurrent lease requests never hand the same job to two workers.
#[test]
fn test_no_double_lease() {
    let mut store = JobStore::new(3);
    let catalog: Vec<CatalogEntry> = (0..50).map(|i| CatalogEntry::new(format!("e{}", i))).collect();
    store.load(catalog).unwrap();

    let mut seen = HashSet::new();
    for i in 0..50 {
        let (job_id, _) = granted(store.lease_next_at(&format!("w{}", i), TTL, 0));
        assert!(seen.insert(job_id), "job leased twice");
    }
    assert!(matches!(store.lease_next_at("extra", TTL, 0), LeaseOutcome::NoWorkAvailable));

    let counts = store.counts();
    assert_eq!(counts.leased, 50);
    assert_eq!(counts.total(), 50);
}

/// Retries go before jobs nobody has tried yet.
#[test]
fn test_retries_are_offered_first() {
    let mut store = JobStore::new(3);
    store
        .load(vec![CatalogEntry::new("a"), CatalogEntry::new("b"), CatalogEntry::new("c")])
        .unwrap();

    granted(store.lease_next_at("w1", TTL, 0));
    let (b, _) = granted(store.lease_next_at("w2", TTL, 0));
    store.mark_failed_at(&b, "w2", "network", 10).unwrap();

    let (next, attempt) = granted(store.lease_next_at("w3", TTL, 20));
    assert_eq!(next, "b");
    assert_eq!(attempt, 2);
    let (fresh, _) = granted(store.lease_next_at("w3", TTL, 30));
    assert_eq!(fresh, "c");
}

/// Heartbeats keep a long job alive past its first deadline.
#[test]
fn test_heartbeat_extends_lease() {
    let mut store = JobStore::new(3);
    store.load(vec![CatalogEntry::new("a")]).unwrap();
    let (job_id, _) = granted(store.lease_next_at("w1", TTL, 0));

    assert_eq!(store.extend_lease_at(&job_id, "w1", TTL, 8_000).unwrap(), 18_000);
    assert_eq!(store.sweep_expired_leases_at(15_000), 0);
    assert_eq!(store.mark_done_at(&job_id, "w1", 17_000).unwrap(), DoneOutcome::Completed);

    assert!(matches!(
        store.extend_lease_at(&job_id, "w1", TTL, 17_500),
        Err(CrawlError::LeaseMismatch { .. })
    ));
}
