use std::net::SocketAddr;

use tokio_util::sync::CancellationToken;
use tonic::transport::Server;

use crate::error::Result;
use crate::grpc::job_service::JobGateway;
use crate::proto::job_service_server::JobServiceServer;

pub struct GrpcServer {
    addr: SocketAddr,
    gateway: JobGateway,
}

impl GrpcServer {
    pub fn new(addr: SocketAddr, gateway: JobGateway) -> Self {
        Self { addr, gateway }
    }

    /// Serve until the shutdown token fires, then drain gracefully.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        tracing::info!(addr = %self.addr, "starting gRPC server");

        Server::builder()
            .add_service(JobServiceServer::new(self.gateway))
            .serve_with_shutdown(self.addr, async move { shutdown.cancelled().await })
            .await?;

        Ok(())
    }
}
