//! Logical handles and the dispatcher that replays their calls on the
//! backends.

mod connection;
pub mod handle;
pub mod invoke;
pub mod planner;
mod result_set;
mod statement;
pub mod strategy;

pub use connection::ClusterConnection;
pub use handle::HandleId;
pub use result_set::ClusterResultSet;
pub use statement::ClusterStatement;
pub use strategy::InvocationStrategy;
