//! Standard invariant checks.
//!
//! Each check reads literal aggregate snapshots. A client that never received
//! the aggregate a check depends on violates that check.

use tracechain_proto::AggregateSnapshot;

use super::{
    ClientSnapshot, Invariant, InvariantKind, InvariantResult, ScenarioSnapshot, Violation,
    assertion,
};
use crate::{report::Assertion, scenario::StartPolicy};

fn violation(kind: InvariantKind, message: impl Into<String>) -> Violation {
    Violation { invariant: kind, message: message.into() }
}

fn require_aggregate(
    kind: InvariantKind,
    client: &ClientSnapshot,
) -> Result<&AggregateSnapshot, Violation> {
    client.aggregate.as_ref().ok_or_else(|| {
        violation(
            kind,
            format!(
                "{} has no aggregate (join_ok={}, event_ack_ok={})",
                client.label, client.join_ok, client.event_ack_ok
            ),
        )
    })
}

fn require_clients(kind: InvariantKind, state: &ScenarioSnapshot) -> InvariantResult {
    if state.clients.is_empty() {
        return Err(violation(kind, "no clients ran"));
    }
    Ok(())
}

/// Outcome of "the k-th client observes `field == k`" for each client.
fn positional<'a>(
    kind: InvariantKind,
    state: &'a ScenarioSnapshot,
    field: &str,
    count: fn(&AggregateSnapshot) -> u64,
) -> Vec<(&'a ClientSnapshot, InvariantResult)> {
    state
        .clients
        .iter()
        .map(|client| {
            let result = require_aggregate(kind, client).and_then(|aggregate| {
                let observed = count(aggregate);
                if observed == client.position {
                    Ok(())
                } else {
                    Err(violation(
                        kind,
                        format!("{}: {field} {observed}, expected {}", client.label, client.position),
                    ))
                }
            });
            (client, result)
        })
        .collect()
}

fn first_positional_violation(
    kind: InvariantKind,
    state: &ScenarioSnapshot,
    field: &str,
    count: fn(&AggregateSnapshot) -> u64,
) -> InvariantResult {
    require_clients(kind, state)?;
    positional(kind, state, field, count).into_iter().try_for_each(|(_, result)| result)
}

fn positional_lines(
    kind: InvariantKind,
    state: &ScenarioSnapshot,
    field: &str,
    count: fn(&AggregateSnapshot) -> u64,
) -> Vec<Assertion> {
    if let Err(v) = require_clients(kind, state) {
        return vec![assertion(kind, kind.description(), Err(v))];
    }
    positional(kind, state, field, count)
        .into_iter()
        .map(|(client, result)| {
            let description = format!("{} observes {field} == {}", client.label, client.position);
            assertion(kind, description, result)
        })
        .collect()
}

/// The k-th client to settle observes `joined_count == k`.
///
/// Earlier clients stay connected, so with sequenced starts the count seen
/// right after the k-th event is exact. Reported one line per client.
pub struct SequentialJoinCounts;

impl Invariant for SequentialJoinCounts {
    fn kind(&self) -> InvariantKind {
        InvariantKind::SequentialJoinCounts
    }

    fn check(&self, state: &ScenarioSnapshot) -> InvariantResult {
        first_positional_violation(self.kind(), state, "joined_count", |a| a.joined_count)
    }

    fn assertions(&self, state: &ScenarioSnapshot) -> Vec<Assertion> {
        positional_lines(self.kind(), state, "joined_count", |a| a.joined_count)
    }
}

/// The k-th client to settle observes `enter_event_count == k`.
pub struct SequentialEnterCounts;

impl Invariant for SequentialEnterCounts {
    fn kind(&self) -> InvariantKind {
        InvariantKind::SequentialEnterCounts
    }

    fn check(&self, state: &ScenarioSnapshot) -> InvariantResult {
        first_positional_violation(self.kind(), state, "enter_event_count", |a| {
            a.enter_event_count
        })
    }

    fn assertions(&self, state: &ScenarioSnapshot) -> Vec<Assertion> {
        positional_lines(self.kind(), state, "enter_event_count", |a| a.enter_event_count)
    }
}

/// A repeated join on one connection acks ok and never inflates membership.
///
/// Every aggregate the rejoining client saw must report at most as many
/// joined connections as could possibly be live at that point.
pub struct IdempotentRejoin;

impl Invariant for IdempotentRejoin {
    fn kind(&self) -> InvariantKind {
        InvariantKind::IdempotentRejoin
    }

    fn check(&self, state: &ScenarioSnapshot) -> InvariantResult {
        let rejoiners: Vec<_> = state.all().filter(|c| c.rejoin_requested).collect();
        if rejoiners.is_empty() {
            return Err(violation(self.kind(), "no client attempted a rejoin"));
        }

        for client in rejoiners {
            match client.rejoin_ok {
                Some(true) => {},
                Some(false) => {
                    return Err(violation(
                        self.kind(),
                        format!("{}: second join_session ack not observed", client.label),
                    ));
                },
                None => {
                    return Err(violation(
                        self.kind(),
                        format!("{}: rejoin never attempted (join_ok={})", client.label, client.join_ok),
                    ));
                },
            }

            let bound = match state.policy {
                StartPolicy::Sequenced => client.position,
                StartPolicy::Concurrent => state.live_clients(),
            };
            require_aggregate(self.kind(), client)?;
            let seen = client.rejoin_aggregates.iter().chain(&client.history);
            if let Some(over) = seen.filter(|a| a.joined_count > bound).map(|a| a.joined_count).max() {
                return Err(violation(
                    self.kind(),
                    format!(
                        "{}: joined_count {over} with at most {bound} live connection(s)",
                        client.label
                    ),
                ));
            }
        }
        Ok(())
    }
}

/// Counts never decrease across the aggregates one client received.
///
/// Holds while no client disconnects, which is the case for every client's
/// own run window.
pub struct AggregateMonotonicity;

impl Invariant for AggregateMonotonicity {
    fn kind(&self) -> InvariantKind {
        InvariantKind::AggregateMonotonicity
    }

    fn check(&self, state: &ScenarioSnapshot) -> InvariantResult {
        if state.all().all(|c| c.history.is_empty()) {
            return Err(violation(self.kind(), "no aggregates observed"));
        }
        for client in state.all() {
            for pair in client.history.windows(2) {
                let (before, after) = (&pair[0], &pair[1]);
                if after.joined_count < before.joined_count
                    || after.enter_event_count < before.enter_event_count
                {
                    return Err(violation(
                        self.kind(),
                        format!(
                            "{}: ({}, {}) -> ({}, {})",
                            client.label,
                            before.joined_count,
                            before.enter_event_count,
                            after.joined_count,
                            after.enter_event_count
                        ),
                    ));
                }
            }
        }
        Ok(())
    }
}

/// After one client disconnects, a fresh joiner observes the net membership:
/// the previous count, minus the disconnected client, plus itself.
pub struct DisconnectAccounting;

impl Invariant for DisconnectAccounting {
    fn kind(&self) -> InvariantKind {
        InvariantKind::DisconnectAccounting
    }

    fn check(&self, state: &ScenarioSnapshot) -> InvariantResult {
        let Some(disconnected) = &state.disconnected else {
            return Err(violation(self.kind(), "no client was disconnected"));
        };
        let Some(probe) = &state.probe else {
            return Err(violation(self.kind(), "probe client did not run"));
        };
        let aggregate = require_aggregate(self.kind(), probe)?;

        let expected = state.live_clients();
        if aggregate.joined_count != expected {
            return Err(violation(
                self.kind(),
                format!(
                    "{}: joined_count {}, expected {expected} ({expected} - 1 for {disconnected} + 1)",
                    probe.label, aggregate.joined_count
                ),
            ));
        }
        Ok(())
    }
}

/// With concurrent starts, every observed count lies in `1..=N`.
pub struct CountsWithinBounds;

impl Invariant for CountsWithinBounds {
    fn kind(&self) -> InvariantKind {
        InvariantKind::CountsWithinBounds
    }

    fn check(&self, state: &ScenarioSnapshot) -> InvariantResult {
        require_clients(self.kind(), state)?;
        let bound = state.live_clients();
        for client in &state.clients {
            require_aggregate(self.kind(), client)?;
            let out_of_range = client.history.iter().find(|a| {
                !(1..=bound).contains(&a.joined_count) || !(1..=bound).contains(&a.enter_event_count)
            });
            if let Some(a) = out_of_range {
                return Err(violation(
                    self.kind(),
                    format!(
                        "{}: ({}, {}) outside 1..={bound}",
                        client.label, a.joined_count, a.enter_event_count
                    ),
                ));
            }
        }
        Ok(())
    }
}

/// With concurrent starts, the last event processed sees every client joined
/// and entered, so some client must observe `(N, N)`.
pub struct CountsConverge;

impl Invariant for CountsConverge {
    fn kind(&self) -> InvariantKind {
        InvariantKind::CountsConverge
    }

    fn check(&self, state: &ScenarioSnapshot) -> InvariantResult {
        require_clients(self.kind(), state)?;
        let n = state.live_clients();
        let converged = state.clients.iter().filter_map(|c| c.aggregate.as_ref()).any(|a| {
            a.joined_count == n && a.enter_event_count == n
        });
        if converged {
            return Ok(());
        }
        let observed: Vec<String> = state
            .clients
            .iter()
            .map(|c| match &c.aggregate {
                Some(a) => format!("{}=({}, {})", c.label, a.joined_count, a.enter_event_count),
                None => format!("{}=none", c.label),
            })
            .collect();
        Err(violation(self.kind(), format!("no client observed ({n}, {n}): {}", observed.join(" "))))
    }
}

/// Advisory: the enter count does not move while a client rejoins, and the
/// rejoining client's own enter is counted exactly once.
pub struct RejoinEventCountStable;

impl Invariant for RejoinEventCountStable {
    fn kind(&self) -> InvariantKind {
        InvariantKind::RejoinEventCountStable
    }

    fn check(&self, state: &ScenarioSnapshot) -> InvariantResult {
        for client in state.all().filter(|c| c.rejoin_requested) {
            let before = client.position.saturating_sub(1);
            if let Some(a) = client.rejoin_aggregates.iter().find(|a| a.enter_event_count != before) {
                return Err(violation(
                    self.kind(),
                    format!(
                        "{}: enter_event_count {} around rejoin, expected {before}",
                        client.label, a.enter_event_count
                    ),
                ));
            }
            let aggregate = require_aggregate(self.kind(), client)?;
            if aggregate.enter_event_count != client.position {
                return Err(violation(
                    self.kind(),
                    format!(
                        "{}: enter_event_count {} after rejoin and enter, expected {}",
                        client.label, aggregate.enter_event_count, client.position
                    ),
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn agg(joined: u64, entered: u64) -> AggregateSnapshot {
        AggregateSnapshot { session_id: "s-1".to_string(), joined_count: joined, enter_event_count: entered }
    }

    fn client(label: &str, position: u64, joined: u64, entered: u64) -> ClientSnapshot {
        ClientSnapshot {
            label: label.to_string(),
            position,
            join_ok: true,
            event_ack_ok: true,
            aggregate: Some(agg(joined, entered)),
            history: vec![agg(joined, entered)],
            ..ClientSnapshot::default()
        }
    }

    fn sequenced(clients: Vec<ClientSnapshot>) -> ScenarioSnapshot {
        ScenarioSnapshot { clients, ..ScenarioSnapshot::new(StartPolicy::Sequenced) }
    }

    #[test]
    fn exact_counts_pass_and_off_by_one_fails() {
        let good = sequenced(vec![client("client1", 1, 1, 1), client("client2", 2, 2, 2)]);
        assert!(SequentialJoinCounts.check(&good).is_ok());
        assert!(SequentialEnterCounts.check(&good).is_ok());

        let doubled = sequenced(vec![client("client1", 1, 1, 1), client("client2", 2, 3, 2)]);
        let err = SequentialJoinCounts.check(&doubled).unwrap_err();
        assert_eq!(err.message, "client2: joined_count 3, expected 2");
        assert!(SequentialEnterCounts.check(&doubled).is_ok());
    }

    #[test]
    fn missing_aggregate_is_a_violation() {
        let mut lost = client("client2", 2, 2, 2);
        lost.aggregate = None;
        lost.event_ack_ok = false;
        let state = sequenced(vec![client("client1", 1, 1, 1), lost]);

        let err = SequentialJoinCounts.check(&state).unwrap_err();
        assert_eq!(err.message, "client2 has no aggregate (join_ok=true, event_ack_ok=false)");
    }

    #[test]
    fn rejoin_must_ack_and_not_inflate() {
        let mut rejoiner = client("client1", 1, 1, 1);
        rejoiner.rejoin_requested = true;
        rejoiner.rejoin_ok = Some(true);
        assert!(IdempotentRejoin.check(&sequenced(vec![rejoiner.clone()])).is_ok());

        let mut inflated = rejoiner.clone();
        inflated.history = vec![agg(2, 1)];
        inflated.aggregate = Some(agg(2, 1));
        let err = IdempotentRejoin.check(&sequenced(vec![inflated])).unwrap_err();
        assert!(err.message.contains("joined_count 2"));

        rejoiner.rejoin_ok = Some(false);
        assert!(IdempotentRejoin.check(&sequenced(vec![rejoiner])).is_err());
    }

    #[test]
    fn monotonicity_catches_decrease() {
        let mut c = client("client1", 1, 2, 2);
        c.history = vec![agg(1, 1), agg(2, 1), agg(2, 2)];
        assert!(AggregateMonotonicity.check(&sequenced(vec![c.clone()])).is_ok());

        c.history.push(agg(1, 2));
        let err = AggregateMonotonicity.check(&sequenced(vec![c])).unwrap_err();
        assert_eq!(err.message, "client1: (2, 2) -> (1, 2)");
    }

    #[test]
    fn disconnect_accounting_expects_net_membership() {
        let mut state = sequenced(vec![client("client1", 1, 1, 1), client("client2", 2, 2, 2)]);
        state.disconnected = Some("client1".to_string());
        state.probe = Some(client("client3", 3, 2, 2));
        assert!(DisconnectAccounting.check(&state).is_ok());

        state.probe = Some(client("client3", 3, 3, 2));
        let err = DisconnectAccounting.check(&state).unwrap_err();
        assert_eq!(err.message, "client3: joined_count 3, expected 2 (2 - 1 for client1 + 1)");

        state.probe = None;
        assert!(DisconnectAccounting.check(&state).is_err());
    }

    #[test]
    fn concurrent_bounds_and_convergence() {
        let state = ScenarioSnapshot {
            clients: vec![client("client1", 1, 2, 1), client("client2", 2, 2, 2)],
            ..ScenarioSnapshot::new(StartPolicy::Concurrent)
        };
        assert!(CountsWithinBounds.check(&state).is_ok());
        assert!(CountsConverge.check(&state).is_ok());

        let stuck = ScenarioSnapshot {
            clients: vec![client("client1", 1, 1, 1), client("client2", 2, 3, 1)],
            ..ScenarioSnapshot::new(StartPolicy::Concurrent)
        };
        assert!(CountsWithinBounds.check(&stuck).is_err());
        let err = CountsConverge.check(&stuck).unwrap_err();
        assert_eq!(err.message, "no client observed (2, 2): client1=(1, 1) client2=(3, 1)");
    }

    #[test]
    fn rejoin_event_count_stability() {
        let mut rejoiner = client("client1", 1, 1, 1);
        rejoiner.rejoin_requested = true;
        rejoiner.rejoin_aggregates = vec![agg(1, 0)];
        assert!(RejoinEventCountStable.check(&sequenced(vec![rejoiner.clone()])).is_ok());

        rejoiner.rejoin_aggregates = vec![agg(1, 0), agg(1, 1)];
        let err = RejoinEventCountStable.check(&sequenced(vec![rejoiner])).unwrap_err();
        assert_eq!(err.message, "client1: enter_event_count 1 around rejoin, expected 0");
    }
}
