use rstest::{fixture, rstest};
use std::collections::HashSet;
use std::sync::Arc;

use crate::queue::{QueueStore, UPDATE_APPLIED, UPDATE_UNKNOWN_REFERENCE, in_memory::InMemoryQueueStore};
use crate::types::{MessageStatus, QueueRecord};

#[cfg(feature = "postgres-tests")]
use crate::queue::postgres::PostgresQueueStore;

/// Two recipients on plan-a and one on plan-b, all unclaimed.
fn pending_records() -> Vec<QueueRecord> {
    vec![
        QueueRecord::builder().nhs_number("9000000009").routing_plan_id("plan-a").build(),
        QueueRecord::builder().nhs_number("9000000017").routing_plan_id("plan-a").build(),
        QueueRecord::builder().nhs_number("9000000025").routing_plan_id("plan-b").build(),
    ]
}

#[fixture]
fn in_memory_store() -> InMemoryQueueStore {
    InMemoryQueueStore::with_records(pending_records())
}

#[cfg(feature = "postgres-tests")]
async fn seeded_postgres(pool: sqlx::PgPool) -> PostgresQueueStore {
    for record in pending_records() {
        sqlx::query("INSERT INTO message_queue (nhs_number, routing_plan_id) VALUES ($1, $2)")
            .bind(&record.nhs_number)
            .bind(&record.routing_plan_id)
            .execute(&pool)
            .await
            .unwrap();
    }
    PostgresQueueStore::new(pool)
}

async fn claim_and_reference<S: QueueStore>(store: &S, batch_id: &str) -> Vec<QueueRecord> {
    store.claim_next_batch(batch_id).await.unwrap().expect("claimable batch");
    let recipients = store.fetch_recipients(batch_id).await;
    for (i, record) in recipients.iter().enumerate() {
        store
            .assign_message_reference(record, &format!("{batch_id}-msg-{i}"))
            .await
            .unwrap();
    }
    store.fetch_recipients(batch_id).await
}

async fn run_test_claim_tags_cohort_sharing_a_plan<S: QueueStore>(store: &S) {
    let claimed = store.claim_next_batch("batch-1").await.unwrap().expect("claimable batch");
    assert_eq!(claimed.batch_id, "batch-1");
    assert_eq!(claimed.routing_plan_id, "plan-a");

    let recipients = store.fetch_recipients("batch-1").await;
    assert_eq!(recipients.len(), 2);
    assert!(recipients.iter().all(|r| r.routing_plan_id == "plan-a"));
    assert!(recipients.iter().all(|r| r.message_status == MessageStatus::New));

    let next = store.claim_next_batch("batch-2").await.unwrap().expect("second plan");
    assert_eq!(next.routing_plan_id, "plan-b");

    assert!(store.claim_next_batch("batch-3").await.unwrap().is_none());
    assert!(store.fetch_recipients("batch-3").await.is_empty());
}

#[rstest]
#[tokio::test]
async fn test_claim_tags_cohort_sharing_a_plan(in_memory_store: InMemoryQueueStore) {
    run_test_claim_tags_cohort_sharing_a_plan(&in_memory_store).await;
}

#[cfg(feature = "postgres-tests")]
#[sqlx::test]
async fn test_claim_tags_cohort_sharing_a_plan_postgres(pool: sqlx::PgPool) {
    let store = seeded_postgres(pool).await;
    run_test_claim_tags_cohort_sharing_a_plan(&store).await;
}

async fn run_test_concurrent_claims_never_overlap<S: QueueStore + 'static>(store: Arc<S>) {
    let a = {
        let store = store.clone();
        tokio::spawn(async move { store.claim_next_batch("batch-a").await })
    };
    let b = {
        let store = store.clone();
        tokio::spawn(async move { store.claim_next_batch("batch-b").await })
    };
    let (a, b) = (a.await.unwrap().unwrap(), b.await.unwrap().unwrap());
    assert!(a.is_some() || b.is_some());

    let batch_a = store.fetch_recipients("batch-a").await;
    let batch_b = store.fetch_recipients("batch-b").await;
    for batch in [&batch_a, &batch_b] {
        let plans: HashSet<&str> = batch.iter().map(|r| r.routing_plan_id.as_str()).collect();
        assert!(plans.len() <= 1, "a batch must not mix routing plans");
    }

    let in_a: HashSet<String> = batch_a.into_iter().map(|r| r.nhs_number).collect();
    let in_b: HashSet<String> = batch_b.into_iter().map(|r| r.nhs_number).collect();
    assert!(in_a.is_disjoint(&in_b));
}

#[rstest]
#[tokio::test]
async fn test_concurrent_claims_never_overlap(in_memory_store: InMemoryQueueStore) {
    run_test_concurrent_claims_never_overlap(Arc::new(in_memory_store)).await;
}

#[cfg(feature = "postgres-tests")]
#[sqlx::test]
async fn test_concurrent_claims_never_overlap_postgres(pool: sqlx::PgPool) {
    let store = seeded_postgres(pool).await;
    run_test_concurrent_claims_never_overlap(Arc::new(store)).await;
}

async fn run_test_message_reference_is_unique_and_immutable<S: QueueStore>(store: &S) {
    let recipients = claim_and_reference(store, "batch-1").await;
    assert!(store.message_reference_exists("batch-1-msg-0").await.unwrap());
    assert!(!store.message_reference_exists("never-issued").await.unwrap());

    // Reusing a reference on another record is rejected
    store.claim_next_batch("batch-2").await.unwrap();
    let other = store.fetch_recipients("batch-2").await.remove(0);
    assert!(store.assign_message_reference(&other, "batch-1-msg-0").await.is_err());

    // A referenced record keeps its first reference
    assert!(store.assign_message_reference(&recipients[0], "replacement").await.is_err());
    let found = store.find_by_message_reference("batch-1-msg-0").await.unwrap().unwrap();
    assert_eq!(found.nhs_number, recipients[0].nhs_number);
    assert_eq!(found.batch_id.as_deref(), Some("batch-1"));
}

#[rstest]
#[tokio::test]
async fn test_message_reference_is_unique_and_immutable(in_memory_store: InMemoryQueueStore) {
    run_test_message_reference_is_unique_and_immutable(&in_memory_store).await;
}

#[cfg(feature = "postgres-tests")]
#[sqlx::test]
async fn test_message_reference_is_unique_and_immutable_postgres(pool: sqlx::PgPool) {
    let store = seeded_postgres(pool).await;
    run_test_message_reference_is_unique_and_immutable(&store).await;
}

async fn run_test_status_only_moves_forward<S: QueueStore>(store: &S) {
    let recipients = claim_and_reference(store, "batch-1").await;
    let record = &recipients[0];

    store.set_status(record, MessageStatus::Requested).await.unwrap();
    store.set_status(record, MessageStatus::Sending).await.unwrap();
    store.set_status(record, MessageStatus::Requested).await.unwrap();

    let current = store.find_by_message_reference("batch-1-msg-0").await.unwrap().unwrap();
    assert_eq!(current.message_status, MessageStatus::Sending);

    let code = store
        .update_status_by_reference("batch-1", "batch-1-msg-0", MessageStatus::Read)
        .await
        .unwrap();
    assert_eq!(code, UPDATE_APPLIED);

    // Re-applying read is a no-op that still reports success
    let code = store
        .update_status_by_reference("batch-1", "batch-1-msg-0", MessageStatus::Read)
        .await
        .unwrap();
    assert_eq!(code, UPDATE_APPLIED);

    store.set_status(record, MessageStatus::Sending).await.unwrap();
    let current = store.find_by_message_reference("batch-1-msg-0").await.unwrap().unwrap();
    assert_eq!(current.message_status, MessageStatus::Read);

    // The sibling record was never touched
    let sibling = store.find_by_message_reference("batch-1-msg-1").await.unwrap().unwrap();
    assert_eq!(sibling.message_status, MessageStatus::New);
}

#[rstest]
#[tokio::test]
async fn test_status_only_moves_forward(in_memory_store: InMemoryQueueStore) {
    run_test_status_only_moves_forward(&in_memory_store).await;
}

#[cfg(feature = "postgres-tests")]
#[sqlx::test]
async fn test_status_only_moves_forward_postgres(pool: sqlx::PgPool) {
    let store = seeded_postgres(pool).await;
    run_test_status_only_moves_forward(&store).await;
}

async fn run_test_unknown_reference_reports_code<S: QueueStore>(store: &S) {
    claim_and_reference(store, "batch-1").await;

    let code = store
        .update_status_by_reference("batch-1", "unknown-ref", MessageStatus::Read)
        .await
        .unwrap();
    assert_eq!(code, UPDATE_UNKNOWN_REFERENCE);

    // A real reference under the wrong batch is also unknown
    let code = store
        .update_status_by_reference("batch-2", "batch-1-msg-0", MessageStatus::Read)
        .await
        .unwrap();
    assert_eq!(code, UPDATE_UNKNOWN_REFERENCE);
}

#[rstest]
#[tokio::test]
async fn test_unknown_reference_reports_code(in_memory_store: InMemoryQueueStore) {
    run_test_unknown_reference_reports_code(&in_memory_store).await;
}

#[cfg(feature = "postgres-tests")]
#[sqlx::test]
async fn test_unknown_reference_reports_code_postgres(pool: sqlx::PgPool) {
    let store = seeded_postgres(pool).await;
    run_test_unknown_reference_reports_code(&store).await;
}

async fn run_test_fetch_batch_ids_with_status<S: QueueStore>(store: &S) {
    let recipients = claim_and_reference(store, "batch-1").await;
    assert!(store.fetch_batch_ids_with_status(MessageStatus::Sending).await.is_empty());

    for record in &recipients {
        store.set_status(record, MessageStatus::Sending).await.unwrap();
    }

    assert_eq!(store.fetch_batch_ids_with_status(MessageStatus::Sending).await, vec!["batch-1".to_string()]);
    assert!(store.health_check().await.is_ok());
}

#[rstest]
#[tokio::test]
async fn test_fetch_batch_ids_with_status(in_memory_store: InMemoryQueueStore) {
    run_test_fetch_batch_ids_with_status(&in_memory_store).await;
}

#[cfg(feature = "postgres-tests")]
#[sqlx::test]
async fn test_fetch_batch_ids_with_status_postgres(pool: sqlx::PgPool) {
    let store = seeded_postgres(pool).await;
    run_test_fetch_batch_ids_with_status(&store).await;
}

async fn run_test_release_claim_returns_record_to_pool<S: QueueStore>(store: &S) {
    let recipients = claim_and_reference(store, "batch-1").await;
    store.set_status(&recipients[0], MessageStatus::Requested).await.unwrap();

    for record in &recipients {
        store.release_claim(record).await.unwrap();
    }

    // The requested record keeps its claim, the other one is claimable again without its reference
    let remaining = store.fetch_recipients("batch-1").await;
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].nhs_number, recipients[0].nhs_number);
    assert!(!store.message_reference_exists("batch-1-msg-1").await.unwrap());

    store.claim_next_batch("batch-2").await.unwrap().expect("released record is claimable");
    let reclaimed = store.fetch_recipients("batch-2").await;
    assert_eq!(reclaimed.len(), 1);
    assert_eq!(reclaimed[0].nhs_number, recipients[1].nhs_number);
    assert!(reclaimed[0].message_id.is_none());
}

#[rstest]
#[tokio::test]
async fn test_release_claim_returns_record_to_pool(in_memory_store: InMemoryQueueStore) {
    run_test_release_claim_returns_record_to_pool(&in_memory_store).await;
}

#[cfg(feature = "postgres-tests")]
#[sqlx::test]
async fn test_release_claim_returns_record_to_pool_postgres(pool: sqlx::PgPool) {
    let store = seeded_postgres(pool).await;
    run_test_release_claim_returns_record_to_pool(&store).await;
}

#[rstest]
#[tokio::test]
async fn test_unavailable_store_reads_empty_and_writes_fail(in_memory_store: InMemoryQueueStore) {
    in_memory_store.set_unavailable(true);

    assert!(in_memory_store.fetch_recipients("batch-1").await.is_empty());
    assert!(in_memory_store.fetch_batch_ids_with_status(MessageStatus::Sending).await.is_empty());

    let err = in_memory_store.claim_next_batch("batch-1").await.unwrap_err();
    assert!(err.is_connection());
    assert!(in_memory_store.health_check().await.is_err());
}
