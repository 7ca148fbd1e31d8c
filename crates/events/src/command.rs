use debts_core::AggregateId;

/// A command targets a specific aggregate.
///
/// Commands express intent ("borrow 1000") and are transient; accepted
/// commands turn into events, which are what gets recorded. Each command
/// operates on exactly one aggregate, which is also the unit of
/// serialization in the dispatcher.
pub trait Command: Clone + core::fmt::Debug + Send + Sync + 'static {
    fn target_aggregate_id(&self) -> AggregateId;
}
