//! Local target resolution -- map a DUT's declared hostname to an address
//! reachable from the rig.
//!
//! IP literals pass straight through. `.local` names go through the system
//! resolver (which consults mDNS via nss on the rig host); everything else
//! is looked up with the unicast DNS resolver from `/etc/resolv.conf`.

use std::net::IpAddr;

use async_trait::async_trait;
use thiserror::Error;
use tracing::debug;
use trust_dns_resolver::TokioAsyncResolver;

#[derive(Debug, Error)]
pub enum ResolutionError {
    #[error("Target missing")]
    TargetMissing,

    #[error("invalid target name: {0}")]
    InvalidTarget(String),

    #[error("could not resolve {target}: {reason}")]
    Unresolved { target: String, reason: String },
}

#[async_trait]
pub trait TargetResolver: Send + Sync {
    async fn resolve(&self, target: &str) -> Result<IpAddr, ResolutionError>;
}

/// Resolver used in production.
pub struct LocalResolver {
    dns: Option<TokioAsyncResolver>,
}

impl LocalResolver {
    pub fn new() -> Self {
        let dns = match TokioAsyncResolver::tokio_from_system_conf() {
            Ok(resolver) => Some(resolver),
            Err(e) => {
                tracing::warn!(error = %e, "no system DNS configuration, falling back to getaddrinfo");
                None
            }
        };
        Self { dns }
    }

    async fn lookup_system(&self, target: &str) -> Result<Vec<IpAddr>, ResolutionError> {
        let addrs = tokio::net::lookup_host((target, 0))
            .await
            .map_err(|e| ResolutionError::Unresolved {
                target: target.to_string(),
                reason: e.to_string(),
            })?;
        Ok(addrs.map(|a| a.ip()).collect())
    }
}

impl Default for LocalResolver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TargetResolver for LocalResolver {
    async fn resolve(&self, target: &str) -> Result<IpAddr, ResolutionError> {
        validate_target(target)?;

        if let Ok(ip) = target.parse::<IpAddr>() {
            return Ok(ip);
        }

        let candidates = match (&self.dns, is_mdns_name(target)) {
            (Some(dns), false) => {
                let lookup = dns.lookup_ip(target).await.map_err(|e| ResolutionError::Unresolved {
                    target: target.to_string(),
                    reason: e.to_string(),
                })?;
                lookup.iter().collect()
            }
            _ => self.lookup_system(target).await?,
        };

        let chosen = pick_address(&candidates).ok_or_else(|| ResolutionError::Unresolved {
            target: target.to_string(),
            reason: "no addresses returned".to_string(),
        })?;
        debug!(%target, address = %chosen, "resolved local target");
        Ok(chosen)
    }
}

fn is_mdns_name(target: &str) -> bool {
    target.trim_end_matches('.').to_ascii_lowercase().ends_with(".local")
}

/// Prefer IPv4: DUT services on the rig network are addressed over v4.
fn pick_address(candidates: &[IpAddr]) -> Option<IpAddr> {
    candidates
        .iter()
        .find(|ip| ip.is_ipv4())
        .or_else(|| candidates.first())
        .copied()
}

fn validate_target(target: &str) -> Result<(), ResolutionError> {
    if target.is_empty() {
        return Err(ResolutionError::TargetMissing);
    }
    if target.starts_with('-') {
        return Err(ResolutionError::InvalidTarget(target.to_string()));
    }
    if target
        .chars()
        .any(|c| !c.is_ascii_alphanumeric() && c != '.' && c != '-' && c != ':' && c != '_')
    {
        return Err(ResolutionError::InvalidTarget(target.to_string()));
    }
    Ok(())
}
