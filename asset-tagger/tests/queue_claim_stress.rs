//! Concurrent fetchers against the SQLite-backed queue: every job is leased
//! exactly once and every lease is settled.

mod common;

use dashmap::DashSet;
use rand::random;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;

use asset_tagger::database::models::FileDbModel;
use asset_tagger::database::repositories::{FileRepository, SqlxFileRepository, SqlxJobRepository};
use asset_tagger::queue::{DbJobQueue, JobQueue};

const LEASE: Duration = Duration::from_secs(60);

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_db_queue_no_double_leases_under_contention() {
    const JOBS: usize = 200;
    const WORKERS: usize = 16;

    let (_dir, pool) = common::setup_pool().await;
    let files: Arc<dyn FileRepository> = Arc::new(SqlxFileRepository::new(pool.clone()));
    let queue = Arc::new(DbJobQueue::new(
        Arc::new(SqlxJobRepository::new(pool.clone())),
        files.clone(),
        "stress",
    ));

    for i in 0..JOBS {
        let id = format!("file-{i:03}");
        files.insert_file(&FileDbModel::new(&id, "u1")).await.unwrap();
        let outcome = queue.enqueue_unique(&id, (i % 5) as i64).await.unwrap();
        assert!(outcome.is_enqueued());
    }

    let leased = Arc::new(DashSet::<String>::new());
    let mut workers = JoinSet::new();
    for _ in 0..WORKERS {
        let queue = queue.clone();
        let leased = leased.clone();
        workers.spawn(async move {
            loop {
                match queue.fetch(LEASE).await.unwrap() {
                    Some(task) => {
                        let fresh = leased.insert(task.job_id().to_string());
                        assert!(fresh, "job {} leased twice", task.job_id());

                        if random::<u8>() % 3 == 0 {
                            tokio::task::yield_now().await;
                        } else {
                            tokio::time::sleep(Duration::from_millis(random::<u64>() % 3)).await;
                        }
                        task.ack().await.unwrap();
                    }
                    None => {
                        // Recheck so a contended empty claim does not end the worker early.
                        if queue.metrics().await.unwrap().queued == 0 {
                            break;
                        }
                        tokio::task::yield_now().await;
                    }
                }
            }
        });
    }

    let joined = tokio::time::timeout(Duration::from_secs(60), async {
        while let Some(res) = workers.join_next().await {
            res.unwrap();
        }
    })
    .await;
    assert!(joined.is_ok(), "workers timed out");

    assert_eq!(leased.len(), JOBS);
    let metrics = queue.metrics().await.unwrap();
    assert_eq!(metrics.queued, 0);
    assert_eq!(metrics.in_flight, 0);

    let (done,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM ai_job WHERE status = 'done'")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(done, JOBS as i64);
}

#[tokio::test]
async fn test_reenqueue_of_queued_file_is_not_duplicated() {
    let (_dir, pool) = common::setup_pool().await;
    let files: Arc<dyn FileRepository> = Arc::new(SqlxFileRepository::new(pool.clone()));
    let queue = DbJobQueue::new(
        Arc::new(SqlxJobRepository::new(pool.clone())),
        files.clone(),
        "dup",
    );
    files.insert_file(&FileDbModel::new("f1", "u1")).await.unwrap();

    assert!(queue.enqueue_unique("f1", 0).await.unwrap().is_enqueued());
    assert!(!queue.enqueue_unique("f1", 0).await.unwrap().is_enqueued());

    let task = queue.fetch(LEASE).await.unwrap().unwrap();
    assert_eq!(task.file_id(), "f1");
    assert!(queue.fetch(LEASE).await.unwrap().is_none());
    task.ack().await.unwrap();
}
