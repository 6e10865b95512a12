use crate::config::RestartSettings;
use crate::error::ErrorKind;
use crate::events::{DomainEvent, EventBus, RestartDue};
use crate::types::ServerId;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Restart policy configuration
#[derive(Debug, Clone)]
pub struct RestartPolicy {
    pub base_delay: Duration,
    /// Cap on the exponential backoff
    pub max_delay: Duration,
    /// Restart ceiling
    pub max_attempts: u32,
    /// Uptime after which a process is considered stable
    pub min_uptime: Duration,
}

impl RestartPolicy {
    pub fn from_settings(settings: &RestartSettings) -> Self {
        Self {
            base_delay: Duration::from_millis(settings.base_delay_ms),
            max_delay: Duration::from_millis(settings.max_delay_ms),
            max_attempts: settings.max_attempts,
            min_uptime: Duration::from_millis(settings.min_uptime_ms),
        }
    }

    /// Delay before attempt `attempt` (1-based): `base * 2^(attempt-1)`, capped
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let base_ms = self.base_delay.as_millis().min(u64::MAX as u128) as u64;
        let delay_ms = base_ms.saturating_mul(2_u64.saturating_pow(exponent));
        Duration::from_millis(delay_ms).min(self.max_delay)
    }
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self::from_settings(&RestartSettings::default())
    }
}

/// What the engine did with a reported failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartDecision {
    Scheduled { attempt: u32, delay: Duration },
    /// The ceiling was reached; no automatic restart until the counter is reset
    Exhausted { attempts: u32 },
    /// A restart is already pending or in flight
    AlreadyScheduled,
    /// The failure kind never triggers a restart
    NotEligible,
}

/// Snapshot of a server's restart state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RestartStatus {
    pub attempt_count: u32,
    pub pending: bool,
    pub exhausted: bool,
    pub next_delay_ms: Option<u64>,
}

#[derive(Debug, Default)]
struct RestartState {
    attempt_count: u32,
    pending: Option<JoinHandle<()>>,
    /// The timer fired and the orchestrator is spawning
    in_flight: bool,
    exhausted: bool,
    /// Attempt number of the last successful restart and when it happened
    last_success: Option<(u32, Instant)>,
}

impl RestartState {
    fn abort_pending(&mut self) -> bool {
        match self.pending.take() {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        }
    }
}

/// Decides whether and when a failed server is restarted.
///
/// Owns one counter and at most one pending timer per server. When a timer
/// fires it sends [`RestartDue`] to the orchestrator, which spawns and reports
/// back with `on_restart_succeeded` or `on_restart_failed`.
#[derive(Clone)]
pub struct RestartPolicyEngine {
    policy: RestartPolicy,
    states: Arc<Mutex<HashMap<ServerId, RestartState>>>,
    due: mpsc::UnboundedSender<RestartDue>,
    events: EventBus,
}

impl RestartPolicyEngine {
    pub fn new(
        policy: RestartPolicy,
        due: mpsc::UnboundedSender<RestartDue>,
        events: EventBus,
    ) -> Self {
        Self {
            policy,
            states: Arc::new(Mutex::new(HashMap::new())),
            due,
            events,
        }
    }

    pub fn policy(&self) -> &RestartPolicy {
        &self.policy
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ServerId, RestartState>> {
        self.states.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        self.policy.delay_for_attempt(attempt)
    }

    /// A server failed. Schedules the next attempt when the failure qualifies.
    pub fn on_failure(&self, id: ServerId, kind: ErrorKind) -> RestartDecision {
        if !kind.qualifies_for_restart() {
            debug!("Failure {:?} of {} does not qualify for restart", kind, id);
            return RestartDecision::NotEligible;
        }

        let mut states = self.lock();
        let state = states.entry(id).or_default();

        if state.exhausted {
            return RestartDecision::Exhausted {
                attempts: state.attempt_count,
            };
        }
        if state.pending.is_some() || state.in_flight {
            return RestartDecision::AlreadyScheduled;
        }

        // Failing again right after a restart continues the previous sequence
        let previous = match state.last_success {
            Some((attempt, at)) if at.elapsed() < self.policy.min_uptime => {
                debug!(
                    "{} failed within {:?} of restart attempt {}",
                    id, self.policy.min_uptime, attempt
                );
                attempt
            }
            _ => state.attempt_count,
        };
        state.last_success = None;

        self.schedule(id, state, previous + 1)
    }

    /// The restart spawned successfully; the counter starts over
    pub fn on_restart_succeeded(&self, id: ServerId) {
        let mut states = self.lock();
        let state = states.entry(id).or_default();
        info!(
            "Restart attempt {} for {} succeeded, resetting counter",
            state.attempt_count, id
        );
        state.last_success = Some((state.attempt_count, Instant::now()));
        state.attempt_count = 0;
        state.in_flight = false;
    }

    /// The restart attempt itself failed with `kind`.
    ///
    /// Spawn failures move on to the next attempt. A failure that never
    /// qualifies, such as the port being taken, ends the sequence and leaves
    /// the counter for a manual start to pick up.
    pub fn on_restart_failed(&self, id: ServerId, kind: ErrorKind) -> RestartDecision {
        let mut states = self.lock();
        let state = states.entry(id).or_default();
        state.in_flight = false;
        if !kind.qualifies_for_restart() {
            warn!("Restart of {} failed with {:?}, not retrying", id, kind);
            return RestartDecision::NotEligible;
        }
        let next = state.attempt_count + 1;
        self.schedule(id, state, next)
    }

    /// Claim a fired timer. Returns `false` if it was cancelled after firing.
    pub fn take_due(&self, id: ServerId) -> bool {
        self.lock().get(&id).is_some_and(|s| s.in_flight)
    }

    /// Abort any pending timer and reset the counter
    pub fn cancel_restart(&self, id: ServerId) -> bool {
        let mut states = self.lock();
        match states.get_mut(&id) {
            Some(state) => {
                let aborted = state.abort_pending();
                *state = RestartState::default();
                if aborted {
                    info!("Cancelled pending restart for {}", id);
                }
                aborted
            }
            None => false,
        }
    }

    /// Abort a pending timer, keeping the counter
    pub fn cancel_pending(&self, id: ServerId) -> bool {
        let mut states = self.lock();
        match states.get_mut(&id) {
            Some(state) => {
                state.in_flight = false;
                state.abort_pending()
            }
            None => false,
        }
    }

    /// Zero the counter (and lift exhaustion) without touching a pending timer
    pub fn reset_restart_counter(&self, id: ServerId) {
        let mut states = self.lock();
        if let Some(state) = states.get_mut(&id) {
            state.attempt_count = 0;
            state.exhausted = false;
            state.last_success = None;
            info!("Reset restart counter for {}", id);
        }
    }

    /// Drop all state for a deleted server
    pub fn forget(&self, id: ServerId) {
        if let Some(mut state) = self.lock().remove(&id) {
            state.abort_pending();
        }
    }

    /// Abort every pending timer
    pub fn cancel_all(&self) {
        for state in self.lock().values_mut() {
            state.abort_pending();
            state.in_flight = false;
        }
    }

    pub fn attempt_count(&self, id: ServerId) -> u32 {
        self.lock().get(&id).map_or(0, |s| s.attempt_count)
    }

    pub fn has_pending(&self, id: ServerId) -> bool {
        self.lock().get(&id).is_some_and(|s| s.pending.is_some())
    }

    pub fn is_exhausted(&self, id: ServerId) -> bool {
        self.lock().get(&id).is_some_and(|s| s.exhausted)
    }

    pub fn status(&self, id: ServerId) -> RestartStatus {
        let states = self.lock();
        match states.get(&id) {
            Some(state) => RestartStatus {
                attempt_count: state.attempt_count,
                pending: state.pending.is_some(),
                exhausted: state.exhausted,
                next_delay_ms: (!state.exhausted).then(|| {
                    self.delay_for_attempt(state.attempt_count + 1).as_millis() as u64
                }),
            },
            None => RestartStatus {
                attempt_count: 0,
                pending: false,
                exhausted: false,
                next_delay_ms: Some(self.delay_for_attempt(1).as_millis() as u64),
            },
        }
    }

    fn schedule(&self, id: ServerId, state: &mut RestartState, attempt: u32) -> RestartDecision {
        if attempt > self.policy.max_attempts {
            state.abort_pending();
            state.exhausted = true;
            state.attempt_count = self.policy.max_attempts;
            warn!(
                "Server {} exceeded restart limit ({} attempts), giving up",
                id, self.policy.max_attempts
            );
            self.events.publish(DomainEvent::RestartExhausted {
                server_id: id,
                attempts: self.policy.max_attempts,
            });
            return RestartDecision::Exhausted {
                attempts: self.policy.max_attempts,
            };
        }

        let delay = self.delay_for_attempt(attempt);
        state.abort_pending();
        state.attempt_count = attempt;

        let states = Arc::clone(&self.states);
        let due = self.due.clone();
        state.pending = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            {
                let mut states = states.lock().unwrap_or_else(PoisonError::into_inner);
                match states.get_mut(&id) {
                    Some(state) => {
                        state.pending = None;
                        state.in_flight = true;
                    }
                    None => return,
                }
            }
            let _ = due.send(RestartDue {
                server_id: id,
                attempt,
            });
        }));

        info!(
            "Scheduling restart {}/{} for {} in {:?}",
            attempt, self.policy.max_attempts, id, delay
        );
        self.events.publish(DomainEvent::RestartScheduled {
            server_id: id,
            attempt,
            delay_ms: delay.as_millis() as u64,
        });

        RestartDecision::Scheduled { attempt, delay }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine(
        base_ms: u64,
        max_attempts: u32,
        min_uptime_ms: u64,
    ) -> (RestartPolicyEngine, mpsc::UnboundedReceiver<RestartDue>) {
        let settings = RestartSettings {
            base_delay_ms: base_ms,
            max_delay_ms: 30_000,
            max_attempts,
            min_uptime_ms,
        };
        let (tx, rx) = mpsc::unbounded_channel();
        (
            RestartPolicyEngine::new(RestartPolicy::from_settings(&settings), tx, EventBus::default()),
            rx,
        )
    }

    async fn recv_due(rx: &mut mpsc::UnboundedReceiver<RestartDue>) -> RestartDue {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for restart")
            .expect("channel closed")
    }

    #[test]
    fn test_backoff_exponential() {
        let policy = RestartPolicy {
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(30_000),
            max_attempts: 3,
            min_uptime: Duration::ZERO,
        };

        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(1000));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(2000));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(4000));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(16000));
        // Capped
        assert_eq!(policy.delay_for_attempt(6), Duration::from_millis(30000));
        assert_eq!(policy.delay_for_attempt(40), Duration::from_millis(30000));
    }

    #[tokio::test]
    async fn test_non_qualifying_failure() {
        let (engine, _rx) = engine(10, 3, 0);
        let id = ServerId::new();

        assert_eq!(
            engine.on_failure(id, ErrorKind::Validation),
            RestartDecision::NotEligible
        );
        assert_eq!(engine.attempt_count(id), 0);
    }

    #[tokio::test]
    async fn test_schedules_and_fires() {
        let (engine, mut rx) = engine(10, 3, 0);
        let id = ServerId::new();

        let decision = engine.on_failure(id, ErrorKind::ProcessCrashed);
        assert_eq!(
            decision,
            RestartDecision::Scheduled {
                attempt: 1,
                delay: Duration::from_millis(10)
            }
        );
        assert!(engine.has_pending(id));

        // A second failure report must not schedule a second restart
        assert_eq!(
            engine.on_failure(id, ErrorKind::UnexpectedExit),
            RestartDecision::AlreadyScheduled
        );

        let due = recv_due(&mut rx).await;
        assert_eq!(due.server_id, id);
        assert_eq!(due.attempt, 1);
        assert!(engine.take_due(id));
        assert!(!engine.has_pending(id));

        engine.on_restart_succeeded(id);
        assert_eq!(engine.attempt_count(id), 0);
        assert!(!engine.take_due(id));
    }

    #[tokio::test]
    async fn test_exhausts_at_ceiling() {
        let (engine, mut rx) = engine(1, 3, 0);
        let id = ServerId::new();

        engine.on_failure(id, ErrorKind::ProcessCrashed);
        for attempt in 1..=3 {
            let due = recv_due(&mut rx).await;
            assert_eq!(due.attempt, attempt);
            let decision = engine.on_restart_failed(id, ErrorKind::StartupFailed);
            if attempt < 3 {
                assert!(matches!(decision, RestartDecision::Scheduled { .. }));
            } else {
                assert_eq!(decision, RestartDecision::Exhausted { attempts: 3 });
            }
        }

        assert!(engine.is_exhausted(id));
        assert_eq!(engine.attempt_count(id), 3);
        assert_eq!(
            engine.on_failure(id, ErrorKind::ProcessCrashed),
            RestartDecision::Exhausted { attempts: 3 }
        );

        engine.reset_restart_counter(id);
        assert!(!engine.is_exhausted(id));
        assert_eq!(engine.attempt_count(id), 0);
        assert!(matches!(
            engine.on_failure(id, ErrorKind::ProcessCrashed),
            RestartDecision::Scheduled { attempt: 1, .. }
        ));
    }

    #[tokio::test]
    async fn test_conflict_on_restart_ends_sequence() {
        let (engine, mut rx) = engine(1, 3, 0);
        let id = ServerId::new();

        engine.on_failure(id, ErrorKind::ProcessCrashed);
        recv_due(&mut rx).await;
        assert!(engine.take_due(id));

        assert_eq!(
            engine.on_restart_failed(id, ErrorKind::Conflict),
            RestartDecision::NotEligible
        );
        assert!(!engine.has_pending(id));
        assert!(!engine.is_exhausted(id));
        assert_eq!(engine.attempt_count(id), 1);
    }

    #[tokio::test]
    async fn test_cancel_restart() {
        let (engine, mut rx) = engine(200, 3, 0);
        let id = ServerId::new();

        engine.on_failure(id, ErrorKind::ProcessCrashed);
        assert!(engine.cancel_restart(id));
        assert!(!engine.has_pending(id));
        assert_eq!(engine.attempt_count(id), 0);

        let fired = tokio::time::timeout(Duration::from_millis(400), rx.recv()).await;
        assert!(fired.is_err(), "cancelled timer must not fire");
    }

    #[tokio::test]
    async fn test_crash_loop_within_min_uptime_reaches_ceiling() {
        let (engine, mut rx) = engine(1, 3, 60_000);
        let id = ServerId::new();

        let mut decision = engine.on_failure(id, ErrorKind::ProcessCrashed);
        let mut restarts = 0;
        while let RestartDecision::Scheduled { .. } = decision {
            recv_due(&mut rx).await;
            assert!(engine.take_due(id));
            engine.on_restart_succeeded(id);
            restarts += 1;
            // Crashes immediately after every successful spawn
            decision = engine.on_failure(id, ErrorKind::UnexpectedExit);
        }

        assert_eq!(restarts, 3);
        assert_eq!(decision, RestartDecision::Exhausted { attempts: 3 });
    }

    #[tokio::test]
    async fn test_stable_run_starts_over() {
        let (engine, mut rx) = engine(1, 3, 0);
        let id = ServerId::new();

        for _ in 0..5 {
            let decision = engine.on_failure(id, ErrorKind::ProcessCrashed);
            assert!(matches!(decision, RestartDecision::Scheduled { attempt: 1, .. }));
            recv_due(&mut rx).await;
            engine.on_restart_succeeded(id);
        }
    }

    #[tokio::test]
    async fn test_status_snapshot() {
        let (engine, _rx) = engine(1000, 3, 0);
        let id = ServerId::new();

        let status = engine.status(id);
        assert_eq!(status.next_delay_ms, Some(1000));

        engine.on_failure(id, ErrorKind::HealthCheckFailed);
        let status = engine.status(id);
        assert_eq!(status.attempt_count, 1);
        assert!(status.pending);
        assert_eq!(status.next_delay_ms, Some(2000));

        engine.forget(id);
        assert!(!engine.has_pending(id));
    }
}
