//! Load balancing configurations\
//! `Session` can use any load balancing policy which implements the
//! `LoadBalancingPolicy` trait.

use std::sync::Arc;

use crate::cluster::{Host, HostDistance};
use crate::statement::Statement;

mod round_robin;
pub use round_robin::RoundRobinPolicy;

/// The list of candidate hosts for one request, in priority order.
///
/// A plan is lazy and single-use: it is produced per dispatch, consumed at
/// most once, and never memoized across calls. Hosts the policy classifies
/// as [HostDistance::Ignored] must not appear in it.
pub type QueryPlan = Box<dyn Iterator<Item = Arc<Host>> + Send>;

/// Policy that decides which hosts to contact for each request.
///
/// When a request is about to be dispatched, the policy constructs a query
/// plan: the ordered list of hosts the session will try. The first elements
/// are the hosts which are the best to contact; the session walks the plan
/// until one of them yields a usable connection.
pub trait LoadBalancingPolicy: Send + Sync + std::fmt::Debug {
    /// Returns the plan for one request.
    ///
    /// `statement` is `None` for the initial connection probe made by
    /// session init, which is not tied to any particular statement.
    fn new_query_plan(&self, statement: Option<&Statement>) -> QueryPlan;

    /// Classifies a host. The distance parameterizes per-host pool sizing.
    fn distance(&self, host: &Host) -> HostDistance;

    /// Returns the name of load balancing policy.
    fn name(&self) -> String;
}

pub(crate) fn compute_rotation(index: usize, count: usize) -> usize {
    if count != 0 {
        index % count
    } else {
        0
    }
}

pub(crate) fn slice_rotated_left<T>(slice: &[T], mid: usize) -> impl Iterator<Item = &T> {
    slice[mid..].iter().chain(slice[..mid].iter())
}
