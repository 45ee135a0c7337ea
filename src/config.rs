//! Broker configuration
//!
//! Every knob is an environment variable (the broker runs as a container
//! behind an env-driven deployment), surfaced through clap so `--help`
//! documents the full set.

use std::time::Duration;

use clap::Parser;

/// Broker configuration, populated from the environment
#[derive(Parser, Debug, Clone)]
#[command(name = "kube-broker", version, about)]
pub struct BrokerSettings {
    /// Listen port
    #[arg(long, env = "CONTAINER_BROKER_PORT", default_value = "8080")]
    pub port: u16,

    /// Serve TLS instead of plain HTTP
    #[arg(
        long,
        env = "CONTAINER_BROKER_SSL_ACTIVE",
        action = clap::ArgAction::Set,
        default_value = "false"
    )]
    pub ssl_active: bool,

    /// TLS certificate file (PEM), required when ssl_active
    #[arg(long, env = "CONTAINER_BROKER_SSL_CERT_FILE_LOCATION")]
    pub ssl_cert_file: Option<String>,

    /// TLS key file (PEM), required when ssl_active
    #[arg(long, env = "CONTAINER_BROKER_SSL_KEY_FILE_LOCATION")]
    pub ssl_key_file: Option<String>,

    /// Basic-auth user for the /v2 service broker routes
    #[arg(long, env = "AUTH_USER")]
    pub auth_user: String,

    /// Basic-auth password for the /v2 service broker routes
    #[arg(long, env = "AUTH_PASS")]
    pub auth_pass: String,

    /// RSA public key (PEM file) validating JWT bearer tokens on /rest routes
    #[arg(long, env = "JWT_PUBLIC_KEY_FILE_LOCATION")]
    pub jwt_public_key_file: Option<String>,

    /// Respond 202 and provision on a background task
    #[arg(
        long,
        env = "ACCEPT_INCOMPLETE",
        action = clap::ArgAction::Set,
        default_value = "false"
    )]
    pub accept_incomplete: bool,

    /// Maximum number of tenant clusters the creator may hold
    #[arg(long, env = "MAX_ORG_QUOTA", default_value = "10")]
    pub max_org_quota: usize,

    /// Seconds between persistent-volume drain checks in the reaper
    #[arg(long, env = "WAIT_BEFORE_NEXT_PV_CHECK_SEC", default_value = "60")]
    pub pv_recheck_sec: u64,

    /// Grace period before the reaper looks at a cluster at all
    #[arg(long, env = "WAIT_BEFORE_REMOVE_CLUSTER_SEC", default_value = "300")]
    pub reaper_grace_sec: u64,

    /// Seconds between lifecycle-hook job completion polls
    #[arg(long, env = "CHECK_JOB_INTERVAL_SEC", default_value = "30")]
    pub job_poll_sec: u64,

    /// Skip TLS verification towards tenant clusters and upstreams
    #[arg(
        long,
        env = "INSECURE_SKIP_VERIFY",
        action = clap::ArgAction::Set,
        default_value = "false"
    )]
    pub insecure_skip_verify: bool,

    /// Catalog directory root
    #[arg(long, env = "CATALOG_PATH", default_value = "./catalogData")]
    pub catalog_path: String,

    /// Cluster-creator endpoint
    #[arg(long, env = "CREATOR_URL")]
    pub creator_url: String,

    /// Cluster-creator basic-auth user
    #[arg(long, env = "CREATOR_USER", default_value = "")]
    pub creator_user: String,

    /// Cluster-creator basic-auth password
    #[arg(long, env = "CREATOR_PASS", default_value = "")]
    pub creator_pass: String,

    /// External domain used when composing public service addresses
    #[arg(long, env = "BROKER_DOMAIN", default_value = "localdomain")]
    pub domain: String,

    /// Outbound HTTP request timeout in seconds
    #[arg(long, env = "HTTP_TIMEOUT_SEC", default_value = "1800")]
    pub http_timeout_sec: u64,
}

impl BrokerSettings {
    /// Reaper grace period
    pub fn reaper_grace(&self) -> Duration {
        Duration::from_secs(self.reaper_grace_sec)
    }

    /// Reaper PV recheck interval
    pub fn pv_recheck_interval(&self) -> Duration {
        Duration::from_secs(self.pv_recheck_sec)
    }

    /// Hook-job completion poll interval
    pub fn job_poll_interval(&self) -> Duration {
        Duration::from_secs(self.job_poll_sec)
    }

    /// Outbound HTTP timeout
    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_sec)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> BrokerSettings {
        let mut argv = vec!["kube-broker"];
        argv.extend_from_slice(args);
        BrokerSettings::try_parse_from(argv).expect("settings should parse")
    }

    #[test]
    fn defaults_cover_optional_knobs() {
        let s = parse(&[
            "--auth-user",
            "admin",
            "--auth-pass",
            "secret",
            "--creator-url",
            "http://creator.local",
        ]);
        assert_eq!(s.port, 8080);
        assert!(!s.ssl_active);
        assert!(!s.accept_incomplete);
        assert_eq!(s.max_org_quota, 10);
        assert_eq!(s.pv_recheck_interval(), Duration::from_secs(60));
        assert_eq!(s.http_timeout(), Duration::from_secs(1800));
    }

    #[test]
    fn intervals_follow_settings() {
        let s = parse(&[
            "--auth-user",
            "a",
            "--auth-pass",
            "b",
            "--creator-url",
            "http://c",
            "--pv-recheck-sec",
            "5",
            "--reaper-grace-sec",
            "1",
            "--job-poll-sec",
            "2",
        ]);
        assert_eq!(s.pv_recheck_interval(), Duration::from_secs(5));
        assert_eq!(s.reaper_grace(), Duration::from_secs(1));
        assert_eq!(s.job_poll_interval(), Duration::from_secs(2));
    }
}
