//! Leader election over etcd.
//!
//! Exactly one instance cluster-wide wins the campaign; it runs the
//! on-acquire callback with a token that is cancelled when the lease
//! is lost or shutdown is requested, then steps down and the cycle
//! repeats.

use std::future::Future;
use std::time::Duration;

use etcd_client::{Client, ResignOptions};
use tokio_util::sync::CancellationToken;

use crate::error::{Result, SchedulerError};

const CAMPAIGN_RETRY_DELAY: Duration = Duration::from_secs(2);

pub struct LeaderElection {
    endpoints: Vec<String>,
    election_name: String,
    lease_ttl: Duration,
}

impl LeaderElection {
    pub fn new(endpoints: Vec<String>, namespace: &str, key: &str, lease_ttl: Duration) -> Self {
        let election_name = format!("{}/{}", namespace.trim_end_matches('/'), key);
        Self {
            endpoints,
            election_name,
            lease_ttl,
        }
    }

    /// Campaign for leadership in a loop until shutdown. Each time
    /// leadership is won, `on_acquired` runs with a child token that is
    /// cancelled on lease loss or shutdown.
    pub async fn run<F, Fut>(&self, shutdown: CancellationToken, mut on_acquired: F) -> Result<()>
    where
        F: FnMut(CancellationToken) -> Fut,
        Fut: Future<Output = ()>,
    {
        if self.endpoints.is_empty() {
            return Err(SchedulerError::Config("no etcd endpoints provided".into()));
        }

        let mut client = Client::connect(self.endpoints.clone(), None).await?;
        let identity = leader_identity();
        let ttl_secs = self.lease_ttl.as_secs().max(1) as i64;

        while !shutdown.is_cancelled() {
            let lease_id = match client.lease_grant(ttl_secs, None).await {
                Ok(lease) => lease.id(),
                Err(e) => {
                    tracing::warn!(error = %e, "lease grant failed, retrying");
                    if wait_or_shutdown(&shutdown, CAMPAIGN_RETRY_DELAY).await {
                        return Ok(());
                    }
                    continue;
                }
            };

            // The lease must stay alive while we wait in the campaign
            // queue, so keep-alive starts before the campaign. Losing
            // the lease cancels this term's token.
            let term = shutdown.child_token();
            let keepalive = match self.spawn_keepalive(&mut client, lease_id, &term).await {
                Ok(handle) => handle,
                Err(e) => {
                    tracing::warn!(error = %e, "lease keep-alive setup failed, retrying");
                    let _ = client.lease_revoke(lease_id).await;
                    if wait_or_shutdown(&shutdown, CAMPAIGN_RETRY_DELAY).await {
                        return Ok(());
                    }
                    continue;
                }
            };

            let mut election = client.election_client();
            let campaign = tokio::select! {
                _ = term.cancelled() => Err(None),
                res = election.campaign(
                    self.election_name.as_str(),
                    identity.as_str(),
                    lease_id,
                ) => res.map_err(Some),
            };

            let leader_key = match campaign {
                Ok(resp) => resp.leader().cloned(),
                Err(e) => {
                    if let Some(e) = e {
                        tracing::warn!(error = %e, "campaign failed, retrying");
                    }
                    term.cancel();
                    let _ = keepalive.await;
                    let _ = client.lease_revoke(lease_id).await;
                    if shutdown.is_cancelled() {
                        return Ok(());
                    }
                    if wait_or_shutdown(&shutdown, CAMPAIGN_RETRY_DELAY).await {
                        return Ok(());
                    }
                    continue;
                }
            };

            tracing::info!(identity = %identity, election = %self.election_name, "acquired leadership");
            on_acquired(term.clone()).await;

            term.cancel();
            let _ = keepalive.await;
            if let Some(key) = leader_key {
                let _ = election
                    .resign(Some(ResignOptions::new().with_leader(key)))
                    .await;
            }
            let _ = client.lease_revoke(lease_id).await;
            tracing::info!("leadership released");
        }

        Ok(())
    }

    async fn spawn_keepalive(
        &self,
        client: &mut Client,
        lease_id: i64,
        term: &CancellationToken,
    ) -> Result<tokio::task::JoinHandle<()>> {
        let (mut keeper, mut stream) = client.lease_keep_alive(lease_id).await?;
        let interval = Duration::from_secs((self.lease_ttl.as_secs() / 3).max(1));
        let term = term.clone();

        Ok(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = term.cancelled() => return,
                    _ = tokio::time::sleep(interval) => {}
                }
                if let Err(e) = keeper.keep_alive().await {
                    tracing::warn!(error = %e, "lease keep-alive failed, stepping down");
                    term.cancel();
                    return;
                }
                match stream.message().await {
                    Ok(Some(resp)) if resp.ttl() > 0 => {}
                    Ok(_) => {
                        tracing::warn!("lease expired, stepping down");
                        term.cancel();
                        return;
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "lease keep-alive stream failed, stepping down");
                        term.cancel();
                        return;
                    }
                }
            }
        }))
    }
}

/// Identity published for this instance: `<hostname>-<pid>`.
fn leader_identity() -> String {
    format!(
        "{}-{}",
        gethostname::gethostname().to_string_lossy(),
        std::process::id()
    )
}

/// Sleep, returning true if shutdown fired first.
async fn wait_or_shutdown(shutdown: &CancellationToken, delay: Duration) -> bool {
    tokio::select! {
        _ = shutdown.cancelled() => true,
        _ = tokio::time::sleep(delay) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_is_host_and_pid() {
        let identity = leader_identity();
        let pid = std::process::id().to_string();
        assert!(identity.ends_with(&pid));
        assert!(identity.len() > pid.len());
    }
}
