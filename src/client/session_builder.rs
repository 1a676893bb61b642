//! [SessionBuilder] is a convenient builder for a [Session].

use std::sync::Arc;
use std::time::Duration;

use super::session::{PoolingOptions, Session, SessionConfig, SessionListener};
use crate::cluster::Endpoint;
use crate::errors::NewSessionError;
use crate::network::{ConnectionFactory, Credentials};
use crate::policies::load_balancing::LoadBalancingPolicy;

/// Builds a [Session] step by step.
///
/// ```rust,no_run
/// # use cql_session::{Session, SessionBuilder};
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let session: Session = SessionBuilder::new()
///     .known_node("127.0.0.1:9042".parse::<std::net::SocketAddr>()?)
///     .build()
///     .await?;
/// # Ok(())
/// # }
/// ```
#[derive(Default)]
pub struct SessionBuilder {
    config: SessionConfig,
}

impl SessionBuilder {
    pub fn new() -> Self {
        Self {
            config: SessionConfig::new(),
        }
    }

    /// Adds a node the session will know about on startup.
    pub fn known_node(mut self, endpoint: impl Into<Endpoint>) -> Self {
        self.config.known_nodes.push(endpoint.into());
        self
    }

    /// Adds a list of known nodes.
    pub fn known_nodes(mut self, endpoints: impl IntoIterator<Item = Endpoint>) -> Self {
        self.config.known_nodes.extend(endpoints);
        self
    }

    /// Replaces the default round-robin policy. When set, `known_node`
    /// entries are ignored; the policy brings its own hosts.
    pub fn load_balancing(mut self, policy: Arc<dyn LoadBalancingPolicy>) -> Self {
        self.config.load_balancing_policy = Some(policy);
        self
    }

    pub fn pooling_options(mut self, pooling: PoolingOptions) -> Self {
        self.config.pooling = pooling;
        self
    }

    pub fn credentials(mut self, credentials: Credentials) -> Self {
        self.config.credentials = Some(credentials);
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    pub fn tcp_nodelay(mut self, nodelay: bool) -> Self {
        self.config.tcp_nodelay = nodelay;
        self
    }

    /// Fatal-error count at which a connection slot is removed instead of
    /// reconnected in place.
    pub fn reconnect_limit(mut self, limit: u32) -> Self {
        self.config.reconnect_limit = limit;
        self
    }

    /// Soft-retirement delay before a trashed connection is truly closed.
    pub fn trashcan_ttl(mut self, ttl: Duration) -> Self {
        self.config.trashcan_ttl = ttl;
        self
    }

    pub fn listener(mut self, listener: Arc<dyn SessionListener>) -> Self {
        self.config.listener = Some(listener);
        self
    }

    /// Substitutes the connection factory. Mostly useful for tests and
    /// custom transports.
    pub fn connection_factory(mut self, factory: Arc<dyn ConnectionFactory>) -> Self {
        self.config.connection_factory = Some(factory);
        self
    }

    /// Builds the session and performs the first connection attempt.
    pub async fn build(self) -> Result<Session, NewSessionError> {
        Session::connect(self.config).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn empty_builder_is_rejected() {
        let result = SessionBuilder::new().build().await;
        assert!(matches!(result, Err(NewSessionError::EmptyKnownNodesList)));
    }

    #[test]
    fn builder_collects_known_nodes() {
        let a: std::net::SocketAddr = "127.0.0.1:9042".parse().unwrap();
        let b: std::net::SocketAddr = "127.0.0.2:9042".parse().unwrap();
        let builder = SessionBuilder::new().known_node(a).known_node(b);
        assert_eq!(
            builder.config.known_nodes,
            vec![Endpoint::new(a), Endpoint::new(b)]
        );
    }
}
