//! [`Cluster`], the public entry point: resolves contact points and opens a single pool spanning
//! all of them, sharing one failover bitmask across every connection.

use std::{net::SocketAddr, time::Duration};

use typed_builder::TypedBuilder;

use crate::{
    error::{Error, Result},
    pool::{ConnectionOptions, PoolHandle, PoolOptions, PoolWorker, MAX_CONNECTIONS},
    request::Statement,
    results::QueryResult,
};

/// The CQL port Cassandra listens on by default.
pub const DEFAULT_PORT: u16 = 9042;

/// Top-level configuration for a [`Cluster`]: which hosts to connect to, and the pool/connection
/// options its one pool is built with.
#[derive(Clone, Debug, TypedBuilder)]
pub struct ClusterOptions {
    /// Contact points, as `host` or `host:port` strings. A bare `host` uses [`DEFAULT_PORT`]. Each
    /// contact point gets its own connection within the cluster's single pool, even if two contact
    /// points happen to resolve to the same address.
    #[builder(setter(into))]
    pub contact_points: Vec<String>,

    /// Port used for contact points that don't specify one.
    #[builder(default = DEFAULT_PORT)]
    pub port: u16,

    /// Default timeout schedule for `execute` calls that don't supply their own. The schedule's
    /// length is the request's retry budget: one attempt per entry.
    #[builder(default = vec![Duration::from_secs(1), Duration::from_secs(2), Duration::from_secs(5)])]
    pub default_timeouts: Vec<Duration>,

    /// Options applied to the cluster's pool.
    #[builder(default)]
    pub pool: PoolOptions,
}

/// A running client: a single connection pool spanning every configured contact point.
pub struct Cluster {
    pool: PoolHandle,
    default_timeouts: Vec<Duration>,
}

impl Cluster {
    /// Resolves every contact point and opens one pool spanning all of them. Returns an error if
    /// there are no contact points, or more than this crate's connection-identifier space
    /// (`MAX_CONNECTIONS`) can address.
    pub async fn init(options: ClusterOptions) -> Result<Self> {
        if options.contact_points.is_empty() {
            return Err(Error::invalid_argument("contact_points must not be empty"));
        }
        if options.contact_points.len() > MAX_CONNECTIONS as usize {
            return Err(Error::invalid_argument(format!(
                "cluster supports at most {MAX_CONNECTIONS} contact points, got {}",
                options.contact_points.len()
            )));
        }

        let mut hosts = Vec::with_capacity(options.contact_points.len());
        for contact_point in &options.contact_points {
            hosts.push(resolve_contact_point(contact_point, options.port).await?);
        }

        let pool = PoolWorker::spawn(hosts, options.pool);

        Ok(Self {
            pool,
            default_timeouts: options.default_timeouts,
        })
    }

    /// Executes `cql` with this cluster's default timeout schedule, as an idempotent statement.
    /// Use [`Cluster::execute_with`] to submit bound values, a custom timeout schedule, or mark a
    /// statement non-idempotent.
    pub async fn execute(&self, cql: impl Into<String>) -> Result<QueryResult> {
        self.execute_with(Statement::new(cql), None, true).await
    }

    /// Executes `statement`, with `timeouts` overriding the cluster's default schedule if given.
    /// `idempotent` gates whether a `Backend` error (as opposed to a connection failure) may be
    /// retried on another connection.
    pub async fn execute_with(
        &self,
        statement: Statement,
        timeouts: Option<Vec<Duration>>,
        idempotent: bool,
    ) -> Result<QueryResult> {
        let timeouts = timeouts.unwrap_or_else(|| self.default_timeouts.clone());
        if timeouts.is_empty() {
            return Err(Error::invalid_argument("timeouts must not be empty"));
        }
        self.pool
            .execute(statement, timeouts, idempotent)
            .await
            .map_err(|_| Error::connection_shutdown("cluster closed"))?
    }

    /// Closes the pool. In-flight requests are failed with
    /// [`crate::error::ErrorKind::ConnectionShutdown`]; already-queued requests that haven't been
    /// dispatched are failed the same way.
    pub fn close(&self) {
        self.pool.close();
    }
}

impl Drop for Cluster {
    fn drop(&mut self) {
        self.close();
    }
}

async fn resolve_contact_point(contact_point: &str, default_port: u16) -> Result<SocketAddr> {
    let target = if contact_point.contains(':') {
        contact_point.to_string()
    } else {
        format!("{contact_point}:{default_port}")
    };
    crate::runtime::resolve(&target)
        .await?
        .next()
        .ok_or_else(|| Error::invalid_argument(format!("could not resolve contact point {contact_point}")))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn bare_host_gets_default_port_appended() {
        // `resolve_contact_point` needs a runtime for `lookup_host`; this just exercises the
        // string-formatting branch indirectly via `ClusterOptions` validation elsewhere.
        let options = ClusterOptions::builder()
            .contact_points(vec!["127.0.0.1".to_string()])
            .build();
        assert_eq!(options.port, DEFAULT_PORT);
        assert_eq!(options.default_timeouts.len(), 3);
    }

    #[tokio::test]
    async fn init_rejects_empty_contact_points() {
        let options = ClusterOptions::builder().contact_points(Vec::<String>::new()).build();
        let result = Cluster::init(options).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn init_rejects_more_contact_points_than_the_identifier_space() {
        let too_many: Vec<String> = (0..=MAX_CONNECTIONS).map(|n| format!("127.0.0.1:{}", 9042 + n)).collect();
        let options = ClusterOptions::builder().contact_points(too_many).build();
        let result = Cluster::init(options).await;
        assert!(result.is_err());
    }
}
