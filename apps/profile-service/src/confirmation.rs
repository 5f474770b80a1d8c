use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

/// How long a pending destructive request waits for a yes/no before giving up.
pub const CONFIRMATION_WINDOW: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowState {
    Pending,
    Confirmed,
    Cancelled,
    TimedOut,
}

impl FlowState {
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Confirmed => "confirmed",
            Self::Cancelled => "cancelled",
            Self::TimedOut => "timed_out",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowSignal {
    Confirm,
    Cancel,
}

impl FlowSignal {
    fn resulting_state(self) -> FlowState {
        match self {
            Self::Confirm => FlowState::Confirmed,
            Self::Cancel => FlowState::Cancelled,
        }
    }
}

/// The profile a flow was opened for. Fixed for the lifetime of the flow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowTarget {
    pub profile_id: i64,
    pub external_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowOutcome {
    pub flow_id: Uuid,
    pub target: FlowTarget,
    pub state: FlowState,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfirmationError {
    /// `state` is `None` when the flow id is no longer tracked at all.
    #[error("confirmation flow already resolved")]
    FlowExpired { state: Option<FlowState> },
    #[error("only the requester who opened this confirmation can resolve it")]
    NotInitiator,
}

/// Single-use yes/no gate in front of one destructive request.
///
/// The first of confirm, cancel or the window elapsing wins; every later signal is
/// rejected. The timeout task is aborted once a manual signal lands, and again on drop.
pub struct ConfirmationFlow {
    id: Uuid,
    target: FlowTarget,
    initiator: String,
    expires_at: DateTime<Utc>,
    state: watch::Sender<FlowState>,
    timer: StdMutex<Option<JoinHandle<()>>>,
}

impl ConfirmationFlow {
    /// Must be called from within a tokio runtime; the timeout runs as a spawned task.
    pub fn start(target: FlowTarget, initiator: impl Into<String>, window: Duration) -> Arc<Self> {
        let (state, _) = watch::channel(FlowState::Pending);
        let window_delta =
            chrono::Duration::from_std(window).unwrap_or_else(|_| chrono::Duration::seconds(30));
        let flow = Arc::new(Self {
            id: Uuid::now_v7(),
            target,
            initiator: initiator.into(),
            expires_at: Utc::now() + window_delta,
            state,
            timer: StdMutex::new(None),
        });

        let weak = Arc::downgrade(&flow);
        let timer = tokio::spawn(async move {
            tokio::time::sleep(window).await;
            if let Some(flow) = weak.upgrade() {
                let _ = flow.transition(FlowState::TimedOut);
            }
        });
        *flow.timer.lock().unwrap_or_else(PoisonError::into_inner) = Some(timer);
        flow
    }

    #[must_use]
    pub fn id(&self) -> Uuid {
        self.id
    }

    #[must_use]
    pub fn target(&self) -> &FlowTarget {
        &self.target
    }

    #[must_use]
    pub fn initiator(&self) -> &str {
        &self.initiator
    }

    #[must_use]
    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    #[must_use]
    pub fn state(&self) -> FlowState {
        *self.state.borrow()
    }

    pub fn signal(
        &self,
        requester_id: &str,
        signal: FlowSignal,
    ) -> Result<FlowOutcome, ConfirmationError> {
        if requester_id != self.initiator {
            return Err(ConfirmationError::NotInitiator);
        }
        self.transition(signal.resulting_state())
    }

    /// Resolves once the flow leaves `Pending`, whichever way it went.
    pub async fn settled(&self) -> FlowOutcome {
        let mut receiver = self.state.subscribe();
        let state = receiver
            .wait_for(FlowState::is_terminal)
            .await
            .map(|state| *state)
            .unwrap_or_else(|_| self.state());
        self.outcome(state)
    }

    fn transition(&self, next: FlowState) -> Result<FlowOutcome, ConfirmationError> {
        let mut resolved_as = None;
        let accepted = self.state.send_if_modified(|state| {
            if state.is_terminal() {
                resolved_as = Some(*state);
                return false;
            }
            *state = next;
            true
        });
        if !accepted {
            return Err(ConfirmationError::FlowExpired { state: resolved_as });
        }

        let timer = self
            .timer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(timer) = timer {
            if next != FlowState::TimedOut {
                timer.abort();
            }
        }

        tracing::info!(
            flow_id = %self.id,
            profile_id = self.target.profile_id,
            external_id = %self.target.external_id,
            state = next.as_str(),
            "confirmation flow resolved"
        );
        Ok(self.outcome(next))
    }

    fn outcome(&self, state: FlowState) -> FlowOutcome {
        FlowOutcome {
            flow_id: self.id,
            target: self.target.clone(),
            state,
        }
    }
}

impl Drop for ConfirmationFlow {
    fn drop(&mut self) {
        let timer = self
            .timer
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(timer) = timer {
            timer.abort();
        }
    }
}

/// How long a settled flow stays addressable, so late signals and status reads
/// still see how it ended.
pub const SETTLED_RETENTION: Duration = Duration::from_secs(300);

/// Routes confirm/cancel signals to the flow they belong to.
///
/// Settled flows stay registered for `SETTLED_RETENTION`, then are reaped.
pub struct ConfirmationRegistry {
    window: Duration,
    retention: Duration,
    flows: Arc<Mutex<HashMap<Uuid, Arc<ConfirmationFlow>>>>,
}

impl Default for ConfirmationRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfirmationRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self {
            window: CONFIRMATION_WINDOW,
            retention: SETTLED_RETENTION,
            flows: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub async fn open(
        &self,
        target: FlowTarget,
        initiator: impl Into<String>,
    ) -> Arc<ConfirmationFlow> {
        let flow = ConfirmationFlow::start(target, initiator, self.window);
        let flow_id = flow.id();
        self.flows.lock().await.insert(flow_id, Arc::clone(&flow));

        let flows = Arc::clone(&self.flows);
        let watched = Arc::clone(&flow);
        let retention = self.retention;
        tokio::spawn(async move {
            let outcome = watched.settled().await;
            drop(watched);
            if outcome.state == FlowState::TimedOut {
                tracing::info!(
                    flow_id = %outcome.flow_id,
                    external_id = %outcome.target.external_id,
                    "profile deletion not confirmed in time"
                );
            }
            tokio::time::sleep(retention).await;
            flows.lock().await.remove(&flow_id);
        });
        flow
    }

    /// Unknown or reaped ids yield `FlowExpired { state: None }`; settled but still
    /// retained flows report their terminal state.
    pub async fn signal(
        &self,
        flow_id: Uuid,
        requester_id: &str,
        signal: FlowSignal,
    ) -> Result<FlowOutcome, ConfirmationError> {
        let flow = self
            .get(flow_id)
            .await
            .ok_or(ConfirmationError::FlowExpired { state: None })?;
        flow.signal(requester_id, signal)
    }

    pub async fn get(&self, flow_id: Uuid) -> Option<Arc<ConfirmationFlow>> {
        self.flows.lock().await.get(&flow_id).cloned()
    }

    /// Flows still waiting on a signal; retained settled flows are not counted.
    pub async fn pending_count(&self) -> usize {
        self.flows
            .lock()
            .await
            .values()
            .filter(|flow| flow.state() == FlowState::Pending)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use uuid::Uuid;

    use super::{
        CONFIRMATION_WINDOW, ConfirmationError, ConfirmationFlow, ConfirmationRegistry,
        FlowSignal, FlowState, FlowTarget, SETTLED_RETENTION,
    };

    fn target(external_id: &str) -> FlowTarget {
        FlowTarget {
            profile_id: 1,
            external_id: external_id.to_string(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn first_manual_signal_wins_and_later_signals_are_rejected() {
        let flow = ConfirmationFlow::start(target("42"), "42", CONFIRMATION_WINDOW);
        assert_eq!(flow.state(), FlowState::Pending);

        let confirmed = flow
            .signal("42", FlowSignal::Confirm)
            .expect("first signal accepted");
        assert_eq!(confirmed.state, FlowState::Confirmed);
        assert_eq!(confirmed.target, target("42"));

        let late_cancel = flow.signal("42", FlowSignal::Cancel);
        assert_eq!(
            late_cancel,
            Err(ConfirmationError::FlowExpired {
                state: Some(FlowState::Confirmed)
            })
        );
        assert_eq!(flow.state(), FlowState::Confirmed);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_is_terminal_too() {
        let flow = ConfirmationFlow::start(target("42"), "42", CONFIRMATION_WINDOW);
        let cancelled = flow
            .signal("42", FlowSignal::Cancel)
            .expect("cancel accepted");
        assert_eq!(cancelled.state, FlowState::Cancelled);
        assert!(matches!(
            flow.signal("42", FlowSignal::Confirm),
            Err(ConfirmationError::FlowExpired {
                state: Some(FlowState::Cancelled)
            })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn silent_flow_times_out_after_window() {
        let flow = ConfirmationFlow::start(target("42"), "42", CONFIRMATION_WINDOW);

        let early = tokio::time::timeout(Duration::from_secs(29), flow.settled()).await;
        assert!(early.is_err(), "flow must stay pending inside the window");
        assert_eq!(flow.state(), FlowState::Pending);

        let outcome = flow.settled().await;
        assert_eq!(outcome.state, FlowState::TimedOut);
        assert_eq!(
            flow.signal("42", FlowSignal::Confirm),
            Err(ConfirmationError::FlowExpired {
                state: Some(FlowState::TimedOut)
            })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn manual_resolution_disarms_the_timeout() {
        let flow = ConfirmationFlow::start(target("42"), "42", CONFIRMATION_WINDOW);
        flow.signal("42", FlowSignal::Cancel)
            .expect("cancel accepted");

        tokio::time::sleep(CONFIRMATION_WINDOW * 2).await;
        assert_eq!(flow.state(), FlowState::Cancelled);
        assert_eq!(flow.settled().await.state, FlowState::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn only_the_initiator_can_resolve() {
        let flow = ConfirmationFlow::start(target("42"), "42", CONFIRMATION_WINDOW);
        assert_eq!(
            flow.signal("7", FlowSignal::Confirm),
            Err(ConfirmationError::NotInitiator)
        );
        assert_eq!(flow.state(), FlowState::Pending);
    }

    #[tokio::test(start_paused = true)]
    async fn registry_keeps_flows_independent() {
        let registry = ConfirmationRegistry::new();
        let first = registry.open(target("1"), "1").await;
        let second = registry.open(target("2"), "2").await;
        assert_ne!(first.id(), second.id());
        assert_eq!(registry.pending_count().await, 2);

        let outcome = registry
            .signal(first.id(), "1", FlowSignal::Confirm)
            .await
            .expect("confirm first");
        assert_eq!(outcome.state, FlowState::Confirmed);
        assert_eq!(outcome.target.external_id, "1");
        assert_eq!(second.state(), FlowState::Pending);
        assert_eq!(registry.pending_count().await, 1);

        let retained = registry.get(first.id()).await.expect("settled flow retained");
        assert_eq!(retained.state(), FlowState::Confirmed);
        assert_eq!(retained.initiator(), "1");

        let replay = registry.signal(first.id(), "1", FlowSignal::Cancel).await;
        assert_eq!(
            replay,
            Err(ConfirmationError::FlowExpired {
                state: Some(FlowState::Confirmed)
            })
        );

        let unknown = registry
            .signal(Uuid::now_v7(), "1", FlowSignal::Confirm)
            .await;
        assert_eq!(unknown, Err(ConfirmationError::FlowExpired { state: None }));
    }

    #[tokio::test(start_paused = true)]
    async fn registry_reports_timeout_then_forgets_flow() {
        let registry = ConfirmationRegistry::new();
        let flow = registry.open(target("42"), "42").await;
        let flow_id = flow.id();

        assert_eq!(flow.settled().await.state, FlowState::TimedOut);
        drop(flow);
        assert_eq!(registry.pending_count().await, 0);

        let late = registry.signal(flow_id, "42", FlowSignal::Confirm).await;
        assert_eq!(
            late,
            Err(ConfirmationError::FlowExpired {
                state: Some(FlowState::TimedOut)
            })
        );

        tokio::time::sleep(SETTLED_RETENTION + Duration::from_secs(1)).await;
        for _ in 0..16 {
            if registry.get(flow_id).await.is_none() {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(registry.get(flow_id).await.is_none());

        let reaped = registry.signal(flow_id, "42", FlowSignal::Confirm).await;
        assert_eq!(reaped, Err(ConfirmationError::FlowExpired { state: None }));
    }
}
