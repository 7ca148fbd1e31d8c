/// Execute an aggregate command in place (no IO, no persistence).
///
/// 1. **Decide**: `aggregate.handle(command)` (pure)
/// 2. **Evolve**: `aggregate.apply(event)` for each decided event
///
/// If `handle` fails, the aggregate is left untouched. For the persisted
/// pipeline, use the infrastructure `CommandDispatcher`.
pub fn execute<A>(aggregate: &mut A, command: &A::Command) -> Result<Vec<A::Event>, A::Error>
where
    A: debts_core::Aggregate,
{
    let events = A::handle(aggregate, command)?;
    for ev in &events {
        A::apply(aggregate, ev);
    }
    Ok(events)
}
