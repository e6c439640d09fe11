//! End-to-end tests against live infrastructure.
//!
//! These need a reachable PostgreSQL (DATABASE_URL) and Redis
//! (REDIS_ADDR, default localhost:6379) and are ignored by default:
//!
//! ```text
//! DATABASE_URL=postgres://... cargo test -- --ignored
//! ```

use std::net::TcpListener;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use taskrelay::config::Config;
use taskrelay::error::SchedulerError;
use taskrelay::grpc::{GrpcServer, JobGateway};
use taskrelay::proto::job_service_client::JobServiceClient;
use taskrelay::proto::Job as JobMessage;
use taskrelay::queue::{DispatchQueue, DLQ_JOBS_QUEUE};
use taskrelay::store::{JobStatus, JobStore};
use taskrelay::worker::Worker;

const POLL_DEADLINE: Duration = Duration::from_secs(60);

fn infra_config() -> Config {
    Config {
        server_port: 0,
        database_url: std::env::var("DATABASE_URL")
            .expect("DATABASE_URL must point at a test database"),
        redis_addr: std::env::var("REDIS_ADDR").unwrap_or_else(|_| "localhost:6379".to_string()),
        etcd_endpoints: Vec::new(),
        election_namespace: "/scheduler/v1".to_string(),
        election_key: "leader".to_string(),
        lease_ttl: Duration::from_secs(10),
        pg_max_conns: None,
        pg_min_conns: None,
        pg_max_conn_lifetime: None,
    }
}

async fn spawn_worker(config: &Config) -> (CancellationToken, tokio::task::JoinHandle<()>) {
    let store = JobStore::connect(config).await.expect("store");
    let queue = DispatchQueue::connect(&config.redis_addr).await.expect("queue");
    let token = CancellationToken::new();
    let worker_token = token.clone();
    let handle = tokio::spawn(async move {
        Worker::new(format!("test-worker-{}", Uuid::new_v4()), store, queue)
            .run(worker_token)
            .await;
    });
    (token, handle)
}

async fn poll_until_terminal(store: &JobStore, id: &str) -> taskrelay::store::Job {
    let deadline = tokio::time::Instant::now() + POLL_DEADLINE;
    loop {
        let job = store.get_job(id).await.expect("job row");
        if job.status.is_terminal() {
            return job;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "job {id} still {} after {POLL_DEADLINE:?}",
            job.status
        );
        tokio::time::sleep(Duration::from_millis(500)).await;
    }
}

#[tokio::test]
#[ignore]
async fn submitted_job_runs_and_captures_output() {
    let config = infra_config();
    let store = JobStore::connect(&config).await.expect("store");
    let mut queue = DispatchQueue::connect(&config.redis_addr).await.expect("queue");

    let id = format!("it-{}", Uuid::new_v4());
    store.create_job(&id, "echo hello").await.expect("create");
    queue.push(&id).await.expect("push");

    let (token, handle) = spawn_worker(&config).await;
    let job = poll_until_terminal(&store, &id).await;
    token.cancel();
    let _ = handle.await;

    assert_eq!(job.status, JobStatus::Succeeded);
    assert_eq!(job.output.as_deref(), Some("hello\n"));
    assert_eq!(job.retries, 0);
}

#[tokio::test]
#[ignore]
async fn failing_job_exhausts_retries_and_dead_letters() {
    let config = infra_config();
    let store = JobStore::connect(&config).await.expect("store");
    let mut queue = DispatchQueue::connect(&config.redis_addr).await.expect("queue");

    let dlq_before = queue.depth(DLQ_JOBS_QUEUE).await.expect("dlq depth");

    let id = format!("it-{}", Uuid::new_v4());
    store.create_job(&id, "false").await.expect("create");
    queue.push(&id).await.expect("push");

    let (token, handle) = spawn_worker(&config).await;
    let job = poll_until_terminal(&store, &id).await;
    token.cancel();
    let _ = handle.await;

    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.retries, job.max_retries + 1);
    assert!(job.output.unwrap_or_default().starts_with("Error: "));

    let dlq_after = queue.depth(DLQ_JOBS_QUEUE).await.expect("dlq depth");
    assert!(dlq_after > dlq_before, "job never reached the dead-letter list");
}

#[tokio::test]
#[ignore]
async fn gateway_rejects_empty_command_without_a_row() {
    let config = infra_config();
    let store = JobStore::connect(&config).await.expect("store");
    let queue = DispatchQueue::connect(&config.redis_addr).await.expect("queue");

    let port = {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        listener.local_addr().expect("addr").port()
    };
    let addr = format!("127.0.0.1:{port}").parse().expect("socket addr");
    let gateway = JobGateway::new(
        store.clone(),
        std::sync::Arc::new(tokio::sync::Mutex::new(queue)),
    );
    let shutdown = CancellationToken::new();
    let server_shutdown = shutdown.clone();
    let server = tokio::spawn(async move {
        GrpcServer::new(addr, gateway).run(server_shutdown).await
    });
    tokio::time::sleep(Duration::from_millis(300)).await;

    let mut client = JobServiceClient::connect(format!("http://127.0.0.1:{port}"))
        .await
        .expect("client");
    let err = client
        .submit_job(JobMessage {
            id: String::new(),
            command: "   ".to_string(),
            created_at: 0,
        })
        .await
        .expect_err("empty command must be rejected");
    assert_eq!(err.code(), tonic::Code::InvalidArgument);

    shutdown.cancel();
    let _ = server.await;
}

#[tokio::test]
#[ignore]
async fn gateway_surfaces_duplicate_ids_as_already_exists() {
    let config = infra_config();
    let store = JobStore::connect(&config).await.expect("store");

    let id = format!("it-{}", Uuid::new_v4());
    store.create_job(&id, "true").await.expect("first create");
    let err = store
        .create_job(&id, "true")
        .await
        .expect_err("second create must collide");
    assert!(matches!(err, SchedulerError::Conflict(_)));
}

#[tokio::test]
#[ignore]
async fn stale_running_rows_are_reaped_with_a_tag() {
    let config = infra_config();
    let store = JobStore::connect(&config).await.expect("store");

    let id = format!("it-{}", Uuid::new_v4());
    store.create_job(&id, "sleep 600").await.expect("create");
    store
        .update_status(&id, JobStatus::Running, "")
        .await
        .expect("mark running");

    tokio::time::sleep(Duration::from_secs(2)).await;
    let reaped = store
        .mark_stale_running_failed(1)
        .await
        .expect("stale sweep");
    assert!(reaped >= 1);

    let job = store.get_job(&id).await.expect("job row");
    assert_eq!(job.status, JobStatus::Failed);
    let output = job.output.unwrap_or_default();
    assert!(
        output.ends_with("\n[auto] marked failed due to staleness"),
        "unexpected output: {output:?}"
    );
}

#[tokio::test]
#[ignore]
async fn due_sweep_enqueues_pending_rows_missing_from_the_queue() {
    // A crash between the store write and the queue push leaves a
    // PENDING row with no queue entry; the due sweep must pick it up.
    let config = infra_config();
    let store = JobStore::connect(&config).await.expect("store");
    let mut queue = DispatchQueue::connect(&config.redis_addr).await.expect("queue");

    let id = format!("it-{}", Uuid::new_v4());
    store.create_job(&id, "true").await.expect("create");

    let due = store.due_task_ids(1000).await.expect("due scan");
    assert!(due.contains(&id), "fresh PENDING row must be due");

    queue.push(&id).await.expect("push");
    let popped = loop {
        match queue.pop().await {
            Ok(popped) if popped == id => break popped,
            Ok(_) => continue, // other tests' leftovers
            Err(e) => panic!("pop failed: {e}"),
        }
    };
    assert_eq!(popped, id);
    queue.ack(&id).await.expect("ack");
}

#[tokio::test]
#[ignore]
async fn pop_preserves_submission_order() {
    let config = infra_config();
    let mut queue = DispatchQueue::connect(&config.redis_addr).await.expect("queue");

    let first = format!("it-{}", Uuid::new_v4());
    let second = format!("it-{}", Uuid::new_v4());
    queue.push(&first).await.expect("push first");
    queue.push(&second).await.expect("push second");

    let mut seen = Vec::new();
    while seen.len() < 2 {
        match queue.pop().await {
            Ok(id) if id == first || id == second => {
                queue.ack(&id).await.expect("ack");
                seen.push(id);
            }
            Ok(other) => {
                // Not ours; put it back where it was.
                queue.requeue(&other).await.expect("requeue");
            }
            Err(e) => panic!("pop failed: {e}"),
        }
    }
    assert_eq!(seen, vec![first, second]);
}
