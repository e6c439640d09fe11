pub mod config;
pub mod coord;
pub mod cron;
pub mod error;
pub mod grpc;
pub mod maintenance;
pub mod queue;
pub mod shutdown;
pub mod store;
pub mod worker;

// Re-export generated protobuf types
pub mod proto {
    tonic::include_proto!("taskrelay");
}
