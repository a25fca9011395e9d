pub mod pool;
pub mod protocol;
pub mod server;

pub use pool::{ConnectionPool, PoolStats, PooledConnection};
