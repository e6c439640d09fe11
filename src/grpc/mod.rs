pub mod job_service;
pub mod server;

pub use job_service::JobGateway;
pub use server::GrpcServer;
