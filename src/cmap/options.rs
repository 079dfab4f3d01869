use std::time::Duration;

use crate::options::ClientOptions;

/// The default maximum number of connections a pool maintains to its server, counting checked-out
/// connections.
pub(crate) const DEFAULT_MAX_POOL_SIZE: u32 = 10;

/// Options used to configure a connection pool, derived from the client options.
#[derive(Clone, Debug)]
pub(crate) struct ConnectionPoolOptions {
    /// The maximum number of connections that the pool can have at a given time, including
    /// connections which are currently checked out of the pool.
    pub(crate) max_pool_size: u32,

    /// Connections that have been idle in the pool longer than `max_idle_time` are closed rather
    /// than handed out.
    pub(crate) max_idle_time: Option<Duration>,

    /// The client options the pool's connection establisher was derived from.
    pub(crate) client_options: ClientOptions,
}

impl ConnectionPoolOptions {
    pub(crate) fn from_client_options(options: &ClientOptions) -> Self {
        Self {
            max_pool_size: options.max_pool_size.unwrap_or(DEFAULT_MAX_POOL_SIZE),
            max_idle_time: options.max_idle_time,
            client_options: options.clone(),
        }
    }
}
