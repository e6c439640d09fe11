use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use taskrelay::config::Config;
use taskrelay::coord::LeaderElection;
use taskrelay::grpc::{GrpcServer, JobGateway};
use taskrelay::maintenance::MaintenanceLoop;
use taskrelay::proto::job_service_client::JobServiceClient;
use taskrelay::proto::{Job, JobId};
use taskrelay::queue::DispatchQueue;
use taskrelay::shutdown::install_shutdown_handler;
use taskrelay::store::JobStore;
use taskrelay::worker::Worker;

#[derive(Parser, Debug)]
#[command(name = "taskrelay")]
#[command(about = "A distributed shell-job scheduler")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the submission gateway (plus leader duties when elected)
    Server {
        /// Port to listen on, overriding SERVER_PORT
        #[arg(long)]
        port: Option<u16>,
    },
    /// Run a worker process
    Worker {
        /// Stable worker identifier; defaults to a fresh UUID
        #[arg(long)]
        worker_id: Option<String>,
    },
    /// Submit a job, or a JSON file of jobs
    Submit {
        /// Shell command to run
        command: Option<String>,
        /// JSON file: {"jobs": [{"name": "...", "command": "..."}]}
        #[arg(long, conflicts_with = "command")]
        file: Option<PathBuf>,
        #[arg(long, default_value = "http://localhost:50051")]
        server: String,
        /// Poll each job until it reaches a terminal status
        #[arg(long)]
        wait: bool,
    },
    /// Look up a job's status
    Status {
        id: String,
        #[arg(long, default_value = "http://localhost:50051")]
        server: String,
    },
}

#[derive(Deserialize, Debug)]
struct JobsFile {
    jobs: Vec<JobSpec>,
}

#[derive(Deserialize, Debug)]
struct JobSpec {
    name: String,
    command: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Server { port } => run_server(port).await,
        Command::Worker { worker_id } => run_worker(worker_id).await,
        Command::Submit {
            command,
            file,
            server,
            wait,
        } => run_submit(command, file, server, wait).await,
        Command::Status { id, server } => run_status(id, server).await,
    }
}

async fn run_server(port: Option<u16>) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = Config::from_env()?;
    if let Some(port) = port {
        config.server_port = port;
    }

    let store = JobStore::connect(&config).await?;
    let queue = Arc::new(Mutex::new(DispatchQueue::connect(&config.redis_addr).await?));
    let shutdown = install_shutdown_handler();

    if config.election_enabled() {
        tracing::info!(
            endpoints = ?config.etcd_endpoints,
            namespace = %config.election_namespace,
            key = %config.election_key,
            ttl = ?config.lease_ttl,
            "leader election enabled"
        );
        let election = LeaderElection::new(
            config.etcd_endpoints.clone(),
            &config.election_namespace,
            &config.election_key,
            config.lease_ttl,
        );
        let leader_store = store.clone();
        let redis_addr = config.redis_addr.clone();
        let leader_shutdown = shutdown.clone();
        tokio::spawn(async move {
            let result = election
                .run(leader_shutdown, |leadership| {
                    let store = leader_store.clone();
                    let redis_addr = redis_addr.clone();
                    async move {
                        match DispatchQueue::connect(&redis_addr).await {
                            Ok(queue) => MaintenanceLoop::new(store, queue).run(leadership).await,
                            Err(e) => {
                                tracing::error!(error = %e, "leader could not reach the broker")
                            }
                        }
                    }
                })
                .await;
            if let Err(e) = result {
                tracing::error!(error = %e, "leader election failed");
            }
        });
    } else {
        tracing::info!("leader election disabled (ETCD_ENDPOINTS not set); skipping leader-only duties");
    }

    let addr: SocketAddr = format!("0.0.0.0:{}", config.server_port).parse()?;
    let gateway = JobGateway::new(store.clone(), queue);
    GrpcServer::new(addr, gateway).run(shutdown).await?;

    store.close().await;
    Ok(())
}

async fn run_worker(worker_id: Option<String>) -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::from_env()?;
    let worker_id = worker_id.unwrap_or_else(|| Uuid::new_v4().to_string());

    let store = JobStore::connect(&config).await?;
    let queue = DispatchQueue::connect(&config.redis_addr).await?;
    let shutdown = install_shutdown_handler();

    let mut worker = Worker::new(worker_id, store.clone(), queue);
    worker.run(shutdown).await;

    store.close().await;
    Ok(())
}

async fn run_submit(
    command: Option<String>,
    file: Option<PathBuf>,
    server: String,
    wait: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let specs = match (command, file) {
        (Some(command), None) => vec![JobSpec {
            name: "shell".to_string(),
            command,
        }],
        (None, Some(path)) => {
            let data = tokio::fs::read_to_string(&path).await?;
            let parsed: JobsFile = serde_json::from_str(&data)?;
            parsed.jobs
        }
        _ => return Err("provide a command or --file".into()),
    };

    let mut client = JobServiceClient::connect(server).await?;
    for spec in specs {
        let response = client
            .submit_job(Job {
                id: String::new(),
                command: spec.command.clone(),
                created_at: chrono::Utc::now().timestamp(),
            })
            .await?
            .into_inner();
        println!("{}: submitted as {}", spec.name, response.job_id);

        if wait {
            loop {
                tokio::time::sleep(Duration::from_secs(1)).await;
                let status = match client
                    .get_job_status(JobId {
                        id: response.job_id.clone(),
                    })
                    .await
                {
                    Ok(status) => status.into_inner(),
                    Err(e) => {
                        eprintln!("{}: status poll failed: {}", spec.name, e.message());
                        continue;
                    }
                };
                if status.status == "SUCCEEDED" || status.status == "FAILED" {
                    println!("{}: {}", spec.name, status.status);
                    if !status.output.is_empty() {
                        println!("{}", status.output);
                    }
                    break;
                }
            }
        }
    }

    Ok(())
}

async fn run_status(id: String, server: String) -> Result<(), Box<dyn std::error::Error>> {
    let mut client = JobServiceClient::connect(server).await?;
    let status = client.get_job_status(JobId { id }).await?.into_inner();

    println!("id:         {}", status.id);
    println!("status:     {}", status.status);
    println!("created_at: {}", status.created_at);
    println!("updated_at: {}", status.updated_at);
    if !status.output.is_empty() {
        println!("output:\n{}", status.output);
    }

    Ok(())
}
