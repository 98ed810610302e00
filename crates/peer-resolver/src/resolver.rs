use async_trait::async_trait;
use hickory_resolver::TokioResolver;
use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResolveError {
    /// The name or address authoritatively has no records
    #[error("no records found for {0}")]
    NotFound(String),
    /// The query failed in a way that may succeed if retried later
    #[error("{0}")]
    Temporary(String),
}

impl ResolveError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Temporary(_))
    }
}

/// A trait for entities that can map between client addresses
/// and host names.
#[async_trait]
pub trait Resolver: Send + Sync {
    /// Reverse lookup: returns the PTR names for `addr`
    async fn resolve_ptr(&self, addr: IpAddr) -> Result<Vec<String>, ResolveError>;

    /// Forward lookup: returns the A and AAAA addresses for `host`
    async fn resolve_ip(&self, host: &str) -> Result<Vec<IpAddr>, ResolveError>;
}

pub struct HickoryResolver {
    inner: TokioResolver,
}

impl HickoryResolver {
    pub fn new(inner: TokioResolver) -> Self {
        Self { inner }
    }

    /// Builds a resolver from the system configuration (resolv.conf
    /// on unix systems)
    pub fn from_system_conf() -> anyhow::Result<Self> {
        let inner = TokioResolver::builder_tokio()?.build();
        Ok(Self { inner })
    }
}

fn classify(query: String, err: hickory_resolver::ResolveError) -> ResolveError {
    if err.is_nx_domain() || err.is_no_records_found() {
        ResolveError::NotFound(query)
    } else {
        ResolveError::Temporary(format!("failed to query DNS for {query}: {err:#}"))
    }
}

#[async_trait]
impl Resolver for HickoryResolver {
    async fn resolve_ptr(&self, addr: IpAddr) -> Result<Vec<String>, ResolveError> {
        let lookup = self
            .inner
            .reverse_lookup(addr)
            .await
            .map_err(|err| classify(addr.to_string(), err))?;
        Ok(lookup.iter().map(|ptr| ptr.to_string()).collect())
    }

    async fn resolve_ip(&self, host: &str) -> Result<Vec<IpAddr>, ResolveError> {
        let lookup = self
            .inner
            .lookup_ip(host)
            .await
            .map_err(|err| classify(host.to_string(), err))?;
        Ok(lookup.iter().collect())
    }
}

/// An in-memory resolver used to exercise peer resolution without
/// touching the network.
#[derive(Default, Debug, Clone)]
pub struct TestResolver {
    ptr: HashMap<IpAddr, Vec<String>>,
    ip: HashMap<String, Vec<IpAddr>>,
    ptr_failures: HashSet<IpAddr>,
    ip_failures: HashSet<String>,
    delay: Option<Duration>,
}

impl TestResolver {
    pub fn with_ptr(mut self, addr: IpAddr, name: &str) -> Self {
        self.ptr.entry(addr).or_default().push(name.to_string());
        self
    }

    pub fn with_ip(mut self, name: &str, addr: IpAddr) -> Self {
        self.ip
            .entry(name.to_ascii_lowercase())
            .or_default()
            .push(addr);
        self
    }

    /// Make reverse lookups for `addr` fail with a transient error
    pub fn with_ptr_failure(mut self, addr: IpAddr) -> Self {
        self.ptr_failures.insert(addr);
        self
    }

    /// Make forward lookups for `name` fail with a transient error
    pub fn with_ip_failure(mut self, name: &str) -> Self {
        self.ip_failures.insert(name.to_ascii_lowercase());
        self
    }

    /// Delay every answer; used to simulate an unresponsive server
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay.replace(delay);
        self
    }

    async fn pause(&self) {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl Resolver for TestResolver {
    async fn resolve_ptr(&self, addr: IpAddr) -> Result<Vec<String>, ResolveError> {
        self.pause().await;
        if self.ptr_failures.contains(&addr) {
            return Err(ResolveError::Temporary(format!("SERVFAIL for {addr}")));
        }
        self.ptr
            .get(&addr)
            .cloned()
            .ok_or_else(|| ResolveError::NotFound(addr.to_string()))
    }

    async fn resolve_ip(&self, host: &str) -> Result<Vec<IpAddr>, ResolveError> {
        self.pause().await;
        let key = host.trim_end_matches('.').to_ascii_lowercase();
        if self.ip_failures.contains(&key) {
            return Err(ResolveError::Temporary(format!("SERVFAIL for {host}")));
        }
        self.ip
            .get(&key)
            .cloned()
            .ok_or_else(|| ResolveError::NotFound(host.to_string()))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use k9::assert_equal;

    #[tokio::test]
    async fn test_resolver_answers() {
        let addr: IpAddr = "192.0.2.1".parse().unwrap();
        let resolver = TestResolver::default()
            .with_ptr(addr, "mail.example.com.")
            .with_ip("Mail.Example.com", addr);

        assert_equal!(
            resolver.resolve_ptr(addr).await.unwrap(),
            vec!["mail.example.com.".to_string()]
        );
        assert_equal!(
            resolver.resolve_ip("mail.example.com.").await.unwrap(),
            vec![addr]
        );
        assert_equal!(
            resolver.resolve_ip("nope.example.com").await.unwrap_err(),
            ResolveError::NotFound("nope.example.com".to_string())
        );
    }

    #[tokio::test]
    async fn test_resolver_failures_are_transient() {
        let addr: IpAddr = "192.0.2.1".parse().unwrap();
        let resolver = TestResolver::default().with_ptr_failure(addr);
        assert!(resolver.resolve_ptr(addr).await.unwrap_err().is_transient());
    }
}
