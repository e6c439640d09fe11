use std::env;
use std::time::Duration;

use crate::error::{Result, SchedulerError};

pub const DEFAULT_SERVER_PORT: u16 = 50051;
pub const DEFAULT_REDIS_ADDR: &str = "localhost:6379";
pub const DEFAULT_ELECTION_NAMESPACE: &str = "/scheduler/v1";
pub const DEFAULT_ELECTION_KEY: &str = "leader";
pub const DEFAULT_LEASE_TTL_SECS: u64 = 10;

#[derive(Debug, Clone)]
pub struct Config {
    pub server_port: u16,
    pub database_url: String,
    pub redis_addr: String,
    /// Empty when leader election is disabled.
    pub etcd_endpoints: Vec<String>,
    pub election_namespace: String,
    pub election_key: String,
    pub lease_ttl: Duration,
    pub pg_max_conns: Option<u32>,
    pub pg_min_conns: Option<u32>,
    pub pg_max_conn_lifetime: Option<Duration>,
}

impl Config {
    /// Read configuration from the environment. DATABASE_URL is the only
    /// required variable; everything else has a default or is optional.
    pub fn from_env() -> Result<Self> {
        let database_url = env::var("DATABASE_URL")
            .map_err(|_| SchedulerError::Config("DATABASE_URL is not set".into()))?;

        let server_port = match env::var("SERVER_PORT") {
            Ok(v) => v.parse::<u16>().map_err(|_| {
                SchedulerError::Config(format!("invalid SERVER_PORT: {v:?}"))
            })?,
            Err(_) => DEFAULT_SERVER_PORT,
        };

        let redis_addr =
            env::var("REDIS_ADDR").unwrap_or_else(|_| DEFAULT_REDIS_ADDR.to_string());

        let etcd_endpoints = env::var("ETCD_ENDPOINTS")
            .map(|v| parse_endpoints(&v))
            .unwrap_or_default();

        let election_namespace = env::var("ELECTION_NAMESPACE")
            .unwrap_or_else(|_| DEFAULT_ELECTION_NAMESPACE.to_string());
        let election_key =
            env::var("ELECTION_KEY").unwrap_or_else(|_| DEFAULT_ELECTION_KEY.to_string());

        let lease_ttl = optional_secs("LEASE_TTL")?
            .unwrap_or(Duration::from_secs(DEFAULT_LEASE_TTL_SECS));

        Ok(Self {
            server_port,
            database_url,
            redis_addr,
            etcd_endpoints,
            election_namespace,
            election_key,
            lease_ttl,
            pg_max_conns: optional_u32("PG_MAX_CONNS")?,
            pg_min_conns: optional_u32("PG_MIN_CONNS")?,
            pg_max_conn_lifetime: optional_secs("PG_MAX_CONN_LIFETIME")?,
        })
    }

    pub fn election_enabled(&self) -> bool {
        !self.etcd_endpoints.is_empty()
    }
}

fn parse_endpoints(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn optional_u32(key: &str) -> Result<Option<u32>> {
    match env::var(key) {
        Ok(v) => v
            .parse::<u32>()
            .map(Some)
            .map_err(|_| SchedulerError::Config(format!("invalid {key}: {v:?}"))),
        Err(_) => Ok(None),
    }
}

fn optional_secs(key: &str) -> Result<Option<Duration>> {
    match env::var(key) {
        Ok(v) => v
            .parse::<u64>()
            .map(|secs| Some(Duration::from_secs(secs)))
            .map_err(|_| SchedulerError::Config(format!("invalid {key}: {v:?}"))),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoints_split_on_commas_and_trim() {
        assert_eq!(
            parse_endpoints("http://a:2379, http://b:2379 ,,"),
            vec!["http://a:2379".to_string(), "http://b:2379".to_string()]
        );
        assert!(parse_endpoints("").is_empty());
    }
}
