//! Group Router (spec §4.C): given a group id, pick a healthy member, try
//! exactly one alternate on infrastructure failure, and track per-member and
//! group-level health so unhealthy members rotate out and back in.

use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;

use hangar_config::provider::{GroupConfig, ProviderId, RoutingStrategy};
use rand::Rng;
use serde::Serialize;
use tracing::{info, warn};

use crate::error::{ErrorKind, HangarError};
use crate::events::{DomainEvent, EventBus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum GroupStatus {
    Inactive,
    Partial,
    Healthy,
    Degraded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

struct Member {
    provider_id: ProviderId,
    weight: u32,
    priority: u32,
    in_rotation: bool,
    consecutive_group_successes: u32,
    consecutive_group_failures: u32,
    pending_count: u32,
    last_used: Instant,
    /// Smooth weighted round-robin running weight (Nginx-style algorithm).
    current_weight: i64,
}

struct RouterState {
    members: Vec<Member>,
    round_robin_cursor: usize,
    circuit: CircuitState,
    circuit_failures: u32,
    circuit_opened_at: Option<Instant>,
    /// Guards the single half-open probe: only one caller may pass through
    /// while the circuit is HalfOpen.
    half_open_probe_taken: bool,
}

pub struct GroupRouter {
    group_id: String,
    config: GroupConfig,
    events: EventBus,
    state: StdMutex<RouterState>,
    pick_counter: AtomicUsize,
}

/// Outcome of [`GroupRouter::select`]: the chosen member plus a token that
/// must be reported back via [`GroupRouter::record_outcome`].
pub struct Selection {
    pub provider_id: ProviderId,
    member_index: usize,
}

impl GroupRouter {
    pub fn new(config: GroupConfig, events: EventBus) -> Self {
        let members = config
            .members
            .iter()
            .map(|m| Member {
                provider_id: m.provider.clone(),
                weight: m.weight.unwrap_or(1).max(1),
                priority: m.priority.unwrap_or(0),
                in_rotation: true,
                consecutive_group_successes: 0,
                consecutive_group_failures: 0,
                pending_count: 0,
                last_used: Instant::now(),
                current_weight: 0,
            })
            .collect();
        Self {
            group_id: config.id.clone(),
            config,
            events,
            state: StdMutex::new(RouterState {
                members,
                round_robin_cursor: 0,
                circuit: CircuitState::Closed,
                circuit_failures: 0,
                circuit_opened_at: None,
                half_open_probe_taken: false,
            }),
            pick_counter: AtomicUsize::new(0),
        }
    }

    pub fn id(&self) -> &str {
        &self.group_id
    }

    /// Pick a healthy member, honouring the group circuit breaker and the
    /// availability gate. Does not invoke anything; the caller dispatches
    /// through the Supervisor and reports the outcome back.
    pub fn select(&self) -> Result<Selection, HangarError> {
        let mut state = self.state.lock().expect("router state poisoned");

        if state.circuit == CircuitState::Open {
            let reopened = state
                .circuit_opened_at
                .map(|at| at.elapsed() >= self.config.circuit.reset_timeout())
                .unwrap_or(false);
            if reopened {
                state.circuit = CircuitState::HalfOpen;
                state.half_open_probe_taken = false;
            } else {
                return Err(HangarError::new(
                    ErrorKind::CircuitOpen,
                    format!("group `{}` circuit is open", self.group_id),
                ));
            }
        }

        if state.circuit == CircuitState::HalfOpen {
            if state.half_open_probe_taken {
                return Err(HangarError::new(
                    ErrorKind::CircuitOpen,
                    format!("group `{}` circuit half-open probe already in flight", self.group_id),
                ));
            }
            state.half_open_probe_taken = true;
        }

        let in_rotation_count = state.members.iter().filter(|m| m.in_rotation).count();
        if in_rotation_count == 0 {
            return Err(HangarError::new(
                ErrorKind::NoHealthyMember,
                format!("group `{}` has no members in rotation", self.group_id),
            ));
        }

        self.pick_counter.fetch_add(1, Ordering::Relaxed);
        let index = select_index(&mut state, self.config.strategy)
            .ok_or_else(|| {
                HangarError::new(
                    ErrorKind::NoHealthyMember,
                    format!("group `{}` selection produced no candidate", self.group_id),
                )
            })?;

        state.members[index].pending_count += 1;
        state.members[index].last_used = Instant::now();
        let provider_id = state.members[index].provider_id.clone();

        Ok(Selection {
            provider_id,
            member_index: index,
        })
    }

    /// Current availability status, per the gate in spec §4.C.
    pub fn status(&self) -> GroupStatus {
        let state = self.state.lock().expect("router state poisoned");
        let in_rotation = state.members.iter().filter(|m| m.in_rotation).count();
        if state.circuit == CircuitState::Open {
            return GroupStatus::Degraded;
        }
        if in_rotation == 0 {
            GroupStatus::Inactive
        } else if in_rotation < self.config.min_healthy {
            GroupStatus::Partial
        } else {
            GroupStatus::Healthy
        }
    }

    /// Report the outcome of an invocation dispatched through `selection`.
    /// `infra_failure` distinguishes infrastructure failures (which count
    /// against health and the circuit) from provider-domain tool errors
    /// (which do not, mirroring Supervisor failure semantics).
    pub fn record_outcome(&self, selection: &Selection, infra_failure: bool) {
        let mut state = self.state.lock().expect("router state poisoned");
        if let Some(m) = state.members.get_mut(selection.member_index) {
            m.pending_count = m.pending_count.saturating_sub(1);
        }

        if infra_failure {
            self.record_member_failure(&mut state, selection.member_index);
            self.record_circuit_failure(&mut state);
        } else {
            self.record_member_success(&mut state, selection.member_index);
            self.record_circuit_success(&mut state);
        }
    }

    fn record_member_success(&self, state: &mut RouterState, index: usize) {
        let Some(m) = state.members.get_mut(index) else { return };
        m.consecutive_group_failures = 0;
        m.consecutive_group_successes += 1;
        if !m.in_rotation && m.consecutive_group_successes >= self.config.healthy_threshold {
            m.in_rotation = true;
            info!(group_id = %self.group_id, provider_id = %m.provider_id, "member back in rotation");
        }
    }

    fn record_member_failure(&self, state: &mut RouterState, index: usize) {
        let Some(m) = state.members.get_mut(index) else { return };
        m.consecutive_group_successes = 0;
        m.consecutive_group_failures += 1;
        if m.in_rotation && m.consecutive_group_failures >= self.config.unhealthy_threshold {
            m.in_rotation = false;
            warn!(group_id = %self.group_id, provider_id = %m.provider_id, "member removed from rotation");
        }
    }

    fn record_circuit_success(&self, state: &mut RouterState) {
        if state.circuit == CircuitState::HalfOpen {
            state.circuit = CircuitState::Closed;
            state.circuit_failures = 0;
            state.circuit_opened_at = None;
            state.half_open_probe_taken = false;
            self.events.emit(DomainEvent::CircuitClosed {
                group_id: self.group_id.clone(),
            });
        } else if state.circuit == CircuitState::Closed {
            state.circuit_failures = 0;
        }
    }

    fn record_circuit_failure(&self, state: &mut RouterState) {
        match state.circuit {
            CircuitState::HalfOpen => {
                state.circuit = CircuitState::Open;
                state.circuit_opened_at = Some(Instant::now());
                state.half_open_probe_taken = false;
            }
            CircuitState::Closed => {
                state.circuit_failures += 1;
                if state.circuit_failures >= self.config.circuit.failure_threshold {
                    state.circuit = CircuitState::Open;
                    state.circuit_opened_at = Some(Instant::now());
                    self.events.emit(DomainEvent::CircuitOpened {
                        group_id: self.group_id.clone(),
                    });
                }
            }
            CircuitState::Open => {}
        }
    }
}

fn select_index(state: &mut RouterState, strategy: RoutingStrategy) -> Option<usize> {
    let eligible: Vec<usize> = state
        .members
        .iter()
        .enumerate()
        .filter(|(_, m)| m.in_rotation)
        .map(|(i, _)| i)
        .collect();
    if eligible.is_empty() {
        return None;
    }

    match strategy {
        RoutingStrategy::RoundRobin => {
            let cursor = state.round_robin_cursor % eligible.len();
            state.round_robin_cursor = state.round_robin_cursor.wrapping_add(1);
            Some(eligible[cursor])
        }
        RoutingStrategy::WeightedRoundRobin => select_weighted_round_robin(state, &eligible),
        RoutingStrategy::LeastConnections => eligible
            .into_iter()
            .min_by_key(|&i| (state.members[i].pending_count, state.members[i].last_used)),
        RoutingStrategy::Random => {
            let idx = rand::rng().random_range(0..eligible.len());
            Some(eligible[idx])
        }
        RoutingStrategy::Priority => {
            let min_priority = eligible.iter().map(|&i| state.members[i].priority).min()?;
            eligible
                .into_iter()
                .filter(|&i| state.members[i].priority == min_priority)
                .min_by_key(|&i| (state.members[i].pending_count, state.members[i].last_used))
        }
    }
}

/// Smooth weighted round-robin: each eligible member's running weight
/// increases by its static weight every pick; the member with the highest
/// running weight is chosen and then reduced by the sum of all weights.
/// Converges to each member being picked in proportion to its weight.
fn select_weighted_round_robin(state: &mut RouterState, eligible: &[usize]) -> Option<usize> {
    let total_weight: i64 = eligible.iter().map(|&i| state.members[i].weight as i64).sum();
    if total_weight == 0 {
        return eligible.first().copied();
    }
    for &i in eligible {
        state.members[i].current_weight += state.members[i].weight as i64;
    }
    let winner = *eligible
        .iter()
        .max_by_key(|&&i| state.members[i].current_weight)?;
    state.members[winner].current_weight -= total_weight;
    Some(winner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use hangar_config::provider::{CircuitBreakerConfig, GroupMember};

    fn group_config(strategy: RoutingStrategy, members: Vec<GroupMember>) -> GroupConfig {
        GroupConfig {
            id: "g1".to_string(),
            members,
            strategy,
            unhealthy_threshold: 2,
            healthy_threshold: 2,
            min_healthy: 1,
            circuit: CircuitBreakerConfig {
                failure_threshold: 3,
                reset_timeout_secs: 60,
            },
        }
    }

    fn member(provider: &str, weight: Option<u32>, priority: Option<u32>) -> GroupMember {
        GroupMember {
            provider: provider.to_string(),
            weight,
            priority,
        }
    }

    #[test]
    fn round_robin_cycles_through_members() {
        let cfg = group_config(
            RoutingStrategy::RoundRobin,
            vec![member("a", None, None), member("b", None, None)],
        );
        let router = GroupRouter::new(cfg, EventBus::new());
        let picks: Vec<String> = (0..4)
            .map(|_| router.select().unwrap().provider_id)
            .collect();
        assert_eq!(picks, vec!["a", "b", "a", "b"]);
    }

    #[test]
    fn priority_prefers_lowest_priority_number() {
        let cfg = group_config(
            RoutingStrategy::Priority,
            vec![member("primary", None, Some(0)), member("backup", None, Some(10))],
        );
        let router = GroupRouter::new(cfg, EventBus::new());
        let selection = router.select().unwrap();
        assert_eq!(selection.provider_id, "primary");
    }

    #[test]
    fn weighted_round_robin_matches_weight_ratio_over_time() {
        let cfg = group_config(
            RoutingStrategy::WeightedRoundRobin,
            vec![member("heavy", Some(3), None), member("light", Some(1), None)],
        );
        let router = GroupRouter::new(cfg, EventBus::new());
        let mut heavy_count = 0;
        for _ in 0..8 {
            if router.select().unwrap().provider_id == "heavy" {
                heavy_count += 1;
            }
        }
        assert_eq!(heavy_count, 6);
    }

    #[test]
    fn member_leaves_rotation_after_unhealthy_threshold() {
        let cfg = group_config(
            RoutingStrategy::RoundRobin,
            vec![member("a", None, None), member("b", None, None)],
        );
        let router = GroupRouter::new(cfg, EventBus::new());
        for _ in 0..2 {
            let sel = Selection {
                provider_id: "a".to_string(),
                member_index: 0,
            };
            router.record_outcome(&sel, true);
        }
        let picks: Vec<String> = (0..4)
            .map(|_| router.select().unwrap().provider_id)
            .collect();
        assert!(picks.iter().all(|p| p == "b"));
    }

    #[test]
    fn circuit_opens_after_failure_threshold_and_blocks_calls() {
        // unhealthy_threshold kept above failure_threshold so the member
        // stays in rotation long enough for the circuit itself to open.
        let mut cfg = group_config(RoutingStrategy::RoundRobin, vec![member("a", None, None)]);
        cfg.unhealthy_threshold = 10;
        let router = GroupRouter::new(cfg, EventBus::new());
        for _ in 0..3 {
            let sel = router.select().unwrap();
            router.record_outcome(&sel, true);
        }
        let err = router.select().unwrap_err();
        assert_eq!(err.kind, ErrorKind::CircuitOpen);
        assert_eq!(router.status(), GroupStatus::Degraded);
    }

    #[test]
    fn zero_members_in_rotation_is_no_healthy_member() {
        let cfg = group_config(RoutingStrategy::RoundRobin, vec![member("a", None, None)]);
        let router = GroupRouter::new(cfg, EventBus::new());
        for _ in 0..2 {
            let sel = Selection {
                provider_id: "a".to_string(),
                member_index: 0,
            };
            router.record_outcome(&sel, true);
        }
        let err = router.select().unwrap_err();
        assert_eq!(err.kind, ErrorKind::NoHealthyMember);
        assert_eq!(router.status(), GroupStatus::Inactive);
    }
}
