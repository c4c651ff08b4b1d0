//! Single-flight credential refresh
//!
//! The coordinator owns the refresh state machine. The first caller to report
//! an expired credential starts a renewal; callers that arrive while it is in
//! flight wait in a FIFO queue and are settled with the same outcome. No
//! matter how many callers queue up, one refresh cycle issues one renewal.
//!
//! Transitions:
//! - Idle → Refreshing (first expired-credential report, renewal spawned)
//! - Refreshing → Idle (renewal settled, queue drained in arrival order)
//!
//! A failed renewal is terminal for the session: the stored credential is
//! cleared, every waiter gets the same `AuthFinal` error, and subscribers see
//! exactly one `SessionExpired` notification.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

use session_auth::{AccessCredential, CredentialStore, Renewer, SESSION_EXPIRED_MESSAGE};
use tokio::sync::{Mutex, broadcast, oneshot};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::metrics;

/// Capacity of the session-expired broadcast channel.
const EXPIRED_CHANNEL_CAPACITY: usize = 16;

/// Refresh state of the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshState {
    Idle,
    Refreshing,
}

impl RefreshState {
    /// State label for logging.
    pub fn label(&self) -> &'static str {
        match self {
            RefreshState::Idle => "idle",
            RefreshState::Refreshing => "refreshing",
        }
    }
}

/// Terminal notification broadcast when the session cannot be renewed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionExpired {
    pub message: String,
}

/// A caller blocked on the in-flight renewal.
struct PendingEntry {
    request_id: String,
    tx: oneshot::Sender<Result<AccessCredential>>,
}

/// State and wait-list, always mutated together under one lock.
struct Cycle {
    state: RefreshState,
    pending: VecDeque<PendingEntry>,
}

struct Shared {
    store: Arc<CredentialStore>,
    renewer: Arc<dyn Renewer>,
    cycle: Mutex<Cycle>,
    expired: broadcast::Sender<SessionExpired>,
}

/// Refresh coordinator. Cheap to clone; clones share one state machine.
///
/// The coordinator is the only writer of the credential store.
#[derive(Clone)]
pub struct RefreshCoordinator {
    shared: Arc<Shared>,
}

impl RefreshCoordinator {
    pub fn new(store: Arc<CredentialStore>, renewer: Arc<dyn Renewer>) -> Self {
        let (expired, _) = broadcast::channel(EXPIRED_CHANNEL_CAPACITY);
        Self {
            shared: Arc::new(Shared {
                store,
                renewer,
                cycle: Mutex::new(Cycle {
                    state: RefreshState::Idle,
                    pending: VecDeque::new(),
                }),
                expired,
            }),
        }
    }

    /// Subscribe to session-expired notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionExpired> {
        self.shared.expired.subscribe()
    }

    /// The credential store this coordinator writes to.
    pub fn store(&self) -> &Arc<CredentialStore> {
        &self.shared.store
    }

    /// Current refresh state.
    pub async fn state(&self) -> RefreshState {
        self.shared.cycle.lock().await.state
    }

    /// Number of callers waiting on the in-flight renewal.
    pub async fn pending(&self) -> usize {
        self.shared.cycle.lock().await.pending.len()
    }

    /// Install a credential obtained outside the renewal path (sign-in).
    pub async fn install(&self, credential: AccessCredential) {
        let _cycle = self.shared.cycle.lock().await;
        self.shared.store.set(credential).await;
        info!("access credential installed");
    }

    /// Drop the current credential without notifying subscribers (sign-out).
    pub async fn sign_out(&self) {
        let _cycle = self.shared.cycle.lock().await;
        self.shared.store.clear().await;
        info!("access credential cleared by sign-out");
    }

    /// Return a credential that is fresher than `stale`, renewing if needed.
    ///
    /// `stale` is the credential the failed request carried (`None` if it went
    /// out unauthenticated). If the store already holds something else, a
    /// renewal completed after that request was sent and the current value is
    /// returned without renewing again.
    ///
    /// Dropping the returned future does not cancel a renewal in flight.
    pub async fn ensure_fresh_credential(
        &self,
        stale: Option<&AccessCredential>,
        request_id: &str,
    ) -> Result<AccessCredential> {
        let waiter = {
            let mut cycle = self.shared.cycle.lock().await;
            match cycle.state {
                RefreshState::Refreshing => {
                    let (tx, rx) = oneshot::channel();
                    cycle.pending.push_back(PendingEntry {
                        request_id: request_id.to_string(),
                        tx,
                    });
                    debug!(
                        request_id,
                        position = cycle.pending.len(),
                        "renewal in flight, queued"
                    );
                    Some(rx)
                }
                RefreshState::Idle => {
                    if let Some(current) = self.shared.store.get().await {
                        if stale != Some(&current) {
                            debug!(request_id, "credential already renewed, reusing");
                            return Ok(current);
                        }
                    }
                    cycle.state = RefreshState::Refreshing;
                    None
                }
            }
        };

        if let Some(rx) = waiter {
            return rx.await.unwrap_or_else(|_| {
                Err(Error::AuthFinal {
                    status: None,
                    message: "renewal abandoned before settling".into(),
                })
            });
        }

        info!(
            request_id,
            state = RefreshState::Refreshing.label(),
            "access credential expired, starting renewal"
        );
        let shared = self.shared.clone();
        let triggered_by = request_id.to_string();
        let task = tokio::spawn(async move { shared.renew_and_settle(&triggered_by).await });

        // Renewer panics are settled inside the task itself
        task.await.unwrap_or_else(|e| {
            Err(Error::AuthFinal {
                status: None,
                message: format!("renewal task failed: {e}"),
            })
        })
    }
}

impl Shared {
    /// Run the renewal exactly once and settle every waiter with its outcome.
    async fn renew_and_settle(&self, triggered_by: &str) -> Result<AccessCredential> {
        let started = Instant::now();

        // Run the renewer in its own task so a panic surfaces as a JoinError
        // here instead of unwinding past the queue.
        let renewer = self.renewer.clone();
        let renewal = tokio::spawn(async move { renewer.renew().await });

        match renewal.await {
            Ok(Ok(credential)) => {
                self.store.set(credential.clone()).await;
                let waiters = self.drain().await;
                info!(
                    triggered_by,
                    waiters = waiters.len(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "renewal succeeded"
                );
                metrics::record_renewal("success", waiters.len());
                for entry in waiters {
                    if entry.tx.send(Ok(credential.clone())).is_err() {
                        debug!(request_id = %entry.request_id, "waiter gone before renewal settled");
                    }
                }
                Ok(credential)
            }
            Ok(Err(e)) => {
                warn!(
                    triggered_by,
                    error = %e,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "renewal failed, ending session"
                );
                let err = Error::from(e);
                self.fail(err.clone()).await;
                Err(err)
            }
            Err(e) => {
                warn!(triggered_by, error = %e, "renewal task aborted, ending session");
                let err = Error::AuthFinal {
                    status: None,
                    message: format!("renewal task failed: {e}"),
                };
                self.fail(err.clone()).await;
                Err(err)
            }
        }
    }

    /// Clear the credential, reject every waiter and broadcast expiry once.
    async fn fail(&self, err: Error) {
        self.store.clear().await;
        let waiters = self.drain().await;
        metrics::record_renewal("failure", waiters.len());
        for entry in waiters {
            if entry.tx.send(Err(err.clone())).is_err() {
                debug!(request_id = %entry.request_id, "waiter gone before renewal settled");
            }
        }

        let notice = SessionExpired {
            message: SESSION_EXPIRED_MESSAGE.to_string(),
        };
        metrics::record_session_expired();
        match self.expired.send(notice) {
            Ok(subscribers) => info!(subscribers, "session-expired notification sent"),
            Err(_) => debug!("session expired with no subscribers"),
        }
    }

    /// Return to Idle and take the wait-list in arrival order.
    async fn drain(&self) -> VecDeque<PendingEntry> {
        let mut cycle = self.cycle.lock().await;
        cycle.state = RefreshState::Idle;
        debug!(
            state = cycle.state.label(),
            waiters = cycle.pending.len(),
            "renewal settled"
        );
        std::mem::take(&mut cycle.pending)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::future::Future;
    use std::pin::Pin;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::Notify;

    /// Renewer with a fixed outcome that optionally waits for the test to
    /// release it, so callers can pile up behind an in-flight renewal.
    struct ScriptedRenewer {
        calls: AtomicUsize,
        gate: Option<Notify>,
        outcome: session_auth::Result<&'static str>,
    }

    impl ScriptedRenewer {
        fn immediate(outcome: session_auth::Result<&'static str>) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                gate: None,
                outcome,
            })
        }

        fn gated(outcome: session_auth::Result<&'static str>) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                gate: Some(Notify::new()),
                outcome,
            })
        }

        fn release(&self) {
            if let Some(gate) = &self.gate {
                gate.notify_one();
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl Renewer for ScriptedRenewer {
        fn renew(
            &self,
        ) -> Pin<Box<dyn Future<Output = session_auth::Result<AccessCredential>> + Send + '_>>
        {
            Box::pin(async move {
                self.calls.fetch_add(1, Ordering::SeqCst);
                if let Some(gate) = &self.gate {
                    gate.notified().await;
                }
                self.outcome.clone().map(AccessCredential::new)
            })
        }
    }

    fn rejected() -> session_auth::Error {
        session_auth::Error::Rejected {
            status: 401,
            message: "refresh token expired".into(),
        }
    }

    async fn store_with(token: Option<&str>) -> Arc<CredentialStore> {
        let store = CredentialStore::in_memory();
        if let Some(token) = token {
            store.set(AccessCredential::new(token)).await;
        }
        Arc::new(store)
    }

    /// Wait until `n` callers are queued behind the in-flight renewal.
    async fn wait_for_pending(coordinator: &RefreshCoordinator, n: usize) {
        for _ in 0..500 {
            if coordinator.pending().await == n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        panic!("expected {n} pending callers, got {}", coordinator.pending().await);
    }

    /// Renewer that panics once released.
    struct PanickingRenewer {
        gate: Notify,
    }

    impl Renewer for PanickingRenewer {
        fn renew(
            &self,
        ) -> Pin<Box<dyn Future<Output = session_auth::Result<AccessCredential>> + Send + '_>>
        {
            Box::pin(async move {
                self.gate.notified().await;
                explode()
            })
        }
    }

    fn explode() -> session_auth::Result<AccessCredential> {
        panic!("renewer blew up")
    }

    /// Wait until the coordinator reports `state`.
    async fn wait_for_state(coordinator: &RefreshCoordinator, state: RefreshState) {
        for _ in 0..500 {
            if coordinator.state().await == state {
                return;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        panic!("coordinator never reached {}", state.label());
    }

    /// Queue `n` callers one at a time behind the in-flight renewal. Each
    /// pushes its arrival index to the returned log as soon as it is settled.
    async fn queue_one_by_one(
        coordinator: &RefreshCoordinator,
        n: usize,
    ) -> (
        Vec<tokio::task::JoinHandle<Result<AccessCredential>>>,
        Arc<std::sync::Mutex<Vec<usize>>>,
    ) {
        let settled = Arc::new(std::sync::Mutex::new(Vec::new()));
        let mut handles = Vec::new();
        for i in 0..n {
            let coordinator_clone = coordinator.clone();
            let settled = settled.clone();
            handles.push(tokio::spawn(async move {
                let stale = AccessCredential::new("t1");
                let result = coordinator_clone
                    .ensure_fresh_credential(Some(&stale), &format!("queued-{i}"))
                    .await;
                settled.lock().unwrap().push(i);
                result
            }));
            wait_for_pending(coordinator, i + 1).await;
        }
        (handles, settled)
    }

    /// Spawn `n` concurrent callers that all hold `stale`.
    fn spawn_callers(
        coordinator: &RefreshCoordinator,
        stale: &'static str,
        n: usize,
    ) -> Vec<tokio::task::JoinHandle<Result<AccessCredential>>> {
        (0..n)
            .map(|i| {
                let coordinator = coordinator.clone();
                tokio::spawn(async move {
                    let stale = AccessCredential::new(stale);
                    coordinator
                        .ensure_fresh_credential(Some(&stale), &format!("req-{i}"))
                        .await
                })
            })
            .collect()
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_renewal() {
        let store = store_with(Some("t1")).await;
        let renewer = ScriptedRenewer::gated(Ok("t2"));
        let coordinator = RefreshCoordinator::new(store.clone(), renewer.clone());

        let handles = spawn_callers(&coordinator, "t1", 8);
        wait_for_pending(&coordinator, 7).await;
        assert_eq!(coordinator.state().await, RefreshState::Refreshing);

        renewer.release();
        for h in handles {
            let credential = h.await.unwrap().unwrap();
            assert_eq!(credential.expose(), "t2");
        }

        assert_eq!(renewer.calls(), 1);
        assert_eq!(coordinator.state().await, RefreshState::Idle);
        assert_eq!(coordinator.pending().await, 0);
        assert_eq!(store.get().await.unwrap().expose(), "t2");
    }

    #[tokio::test]
    async fn failed_renewal_rejects_everyone_and_notifies_once() {
        let store = store_with(Some("t1")).await;
        let renewer = ScriptedRenewer::gated(Err(rejected()));
        let coordinator = RefreshCoordinator::new(store.clone(), renewer.clone());
        let mut expired = coordinator.subscribe();

        let handles = spawn_callers(&coordinator, "t1", 5);
        wait_for_pending(&coordinator, 4).await;
        renewer.release();

        let mut errors = Vec::new();
        for h in handles {
            errors.push(h.await.unwrap().unwrap_err());
        }
        assert!(errors.iter().all(|e| e.is_auth_final()));
        assert!(errors.windows(2).all(|w| w[0] == w[1]), "all waiters share one error");

        assert_eq!(renewer.calls(), 1);
        assert!(store.get().await.is_none(), "credential must be cleared");
        assert_eq!(coordinator.state().await, RefreshState::Idle);

        let notice = expired.try_recv().unwrap();
        assert_eq!(notice.message, SESSION_EXPIRED_MESSAGE);
        assert!(expired.try_recv().is_err(), "exactly one notification");
    }

    #[tokio::test]
    async fn malformed_renewal_is_auth_final() {
        let store = store_with(Some("t1")).await;
        let renewer = ScriptedRenewer::immediate(Err(session_auth::Error::Malformed(
            "renewal response carried no access token".into(),
        )));
        let coordinator = RefreshCoordinator::new(store, renewer);

        let stale = AccessCredential::new("t1");
        let err = coordinator
            .ensure_fresh_credential(Some(&stale), "req-1")
            .await
            .unwrap_err();
        assert!(err.is_auth_final());
        assert!(err.message().contains("no access token"));
    }

    #[tokio::test]
    async fn already_renewed_credential_is_reused() {
        let store = store_with(Some("t2")).await;
        let renewer = ScriptedRenewer::immediate(Ok("t3"));
        let coordinator = RefreshCoordinator::new(store, renewer.clone());

        let stale = AccessCredential::new("t1");
        let credential = coordinator
            .ensure_fresh_credential(Some(&stale), "late-401")
            .await
            .unwrap();

        assert_eq!(credential.expose(), "t2");
        assert_eq!(renewer.calls(), 0);
    }

    #[tokio::test]
    async fn each_cycle_issues_its_own_renewal() {
        let store = store_with(Some("t1")).await;
        let renewer = ScriptedRenewer::immediate(Ok("t2"));
        let coordinator = RefreshCoordinator::new(store, renewer.clone());

        let t1 = AccessCredential::new("t1");
        coordinator.ensure_fresh_credential(Some(&t1), "a").await.unwrap();

        // The new credential expires too; a fresh cycle starts
        let t2 = AccessCredential::new("t2");
        coordinator.ensure_fresh_credential(Some(&t2), "b").await.unwrap();

        assert_eq!(renewer.calls(), 2);
    }

    #[tokio::test]
    async fn empty_store_renews_for_unauthenticated_caller() {
        let store = store_with(None).await;
        let renewer = ScriptedRenewer::immediate(Ok("t1"));
        let coordinator = RefreshCoordinator::new(store.clone(), renewer.clone());

        let credential = coordinator.ensure_fresh_credential(None, "bootstrap").await.unwrap();
        assert_eq!(credential.expose(), "t1");
        assert_eq!(renewer.calls(), 1);
        assert_eq!(store.get().await.unwrap().expose(), "t1");
    }

    #[tokio::test]
    async fn dropped_trigger_does_not_strand_waiters() {
        let store = store_with(Some("t1")).await;
        let renewer = ScriptedRenewer::gated(Ok("t2"));
        let coordinator = RefreshCoordinator::new(store, renewer.clone());

        let trigger = spawn_callers(&coordinator, "t1", 1).remove(0);
        wait_for_state(&coordinator, RefreshState::Refreshing).await;
        trigger.abort();

        let waiter = spawn_callers(&coordinator, "t1", 1).remove(0);
        wait_for_pending(&coordinator, 1).await;
        renewer.release();

        assert_eq!(waiter.await.unwrap().unwrap().expose(), "t2");
        assert_eq!(renewer.calls(), 1);
        assert_eq!(coordinator.state().await, RefreshState::Idle);
    }

    #[tokio::test]
    async fn renewer_panic_settles_waiters_after_trigger_dropped() {
        let store = store_with(Some("t1")).await;
        let renewer = Arc::new(PanickingRenewer {
            gate: Notify::new(),
        });
        let coordinator = RefreshCoordinator::new(store.clone(), renewer.clone());
        let mut expired = coordinator.subscribe();

        let trigger = spawn_callers(&coordinator, "t1", 1).remove(0);
        wait_for_state(&coordinator, RefreshState::Refreshing).await;
        trigger.abort();

        let waiter = spawn_callers(&coordinator, "t1", 1).remove(0);
        wait_for_pending(&coordinator, 1).await;
        renewer.gate.notify_one();

        let err = tokio::time::timeout(Duration::from_secs(2), waiter)
            .await
            .expect("queued caller must be settled")
            .unwrap()
            .unwrap_err();
        assert!(err.is_auth_final(), "got: {err:?}");
        assert!(err.message().contains("renewal task failed"));

        assert_eq!(coordinator.state().await, RefreshState::Idle);
        assert_eq!(coordinator.pending().await, 0);
        assert!(store.get().await.is_none());
        assert_eq!(expired.try_recv().unwrap().message, SESSION_EXPIRED_MESSAGE);
        assert!(expired.try_recv().is_err());
    }

    #[tokio::test]
    async fn renewer_panic_is_reported_to_trigger() {
        let store = store_with(Some("t1")).await;
        let renewer = Arc::new(PanickingRenewer {
            gate: Notify::new(),
        });
        renewer.gate.notify_one();
        let coordinator = RefreshCoordinator::new(store, renewer);

        let stale = AccessCredential::new("t1");
        let err = coordinator
            .ensure_fresh_credential(Some(&stale), "req-1")
            .await
            .unwrap_err();
        assert!(err.is_auth_final());
        assert_eq!(coordinator.state().await, RefreshState::Idle);
    }

    #[tokio::test]
    async fn waiters_are_granted_in_arrival_order() {
        let store = store_with(Some("t1")).await;
        let renewer = ScriptedRenewer::gated(Ok("t2"));
        let coordinator = RefreshCoordinator::new(store, renewer.clone());

        let trigger = spawn_callers(&coordinator, "t1", 1).remove(0);
        wait_for_state(&coordinator, RefreshState::Refreshing).await;
        let (handles, settled) = queue_one_by_one(&coordinator, 6).await;

        renewer.release();
        assert_eq!(trigger.await.unwrap().unwrap().expose(), "t2");
        for h in handles {
            assert_eq!(h.await.unwrap().unwrap().expose(), "t2");
        }

        assert_eq!(*settled.lock().unwrap(), vec![0, 1, 2, 3, 4, 5]);
        assert_eq!(renewer.calls(), 1);
    }

    #[tokio::test]
    async fn waiters_are_rejected_in_arrival_order() {
        let store = store_with(Some("t1")).await;
        let renewer = ScriptedRenewer::gated(Err(rejected()));
        let coordinator = RefreshCoordinator::new(store, renewer.clone());

        let trigger = spawn_callers(&coordinator, "t1", 1).remove(0);
        wait_for_state(&coordinator, RefreshState::Refreshing).await;
        let (handles, settled) = queue_one_by_one(&coordinator, 6).await;

        renewer.release();
        assert!(trigger.await.unwrap().unwrap_err().is_auth_final());
        for h in handles {
            assert!(h.await.unwrap().unwrap_err().is_auth_final());
        }

        assert_eq!(*settled.lock().unwrap(), vec![0, 1, 2, 3, 4, 5]);
        assert_eq!(renewer.calls(), 1);
    }

    #[tokio::test]
    async fn failure_without_subscribers_still_settles() {
        let store = store_with(Some("t1")).await;
        let renewer = ScriptedRenewer::immediate(Err(rejected()));
        let coordinator = RefreshCoordinator::new(store, renewer);

        let stale = AccessCredential::new("t1");
        let err = coordinator
            .ensure_fresh_credential(Some(&stale), "req-1")
            .await
            .unwrap_err();
        assert_eq!(err.status(), Some(401));
        assert_eq!(coordinator.state().await, RefreshState::Idle);
    }

    #[tokio::test]
    async fn install_and_sign_out_write_through_to_store() {
        let store = store_with(None).await;
        let mut expired = {
            let coordinator =
                RefreshCoordinator::new(store.clone(), ScriptedRenewer::immediate(Ok("unused")));
            let expired = coordinator.subscribe();

            coordinator.install(AccessCredential::new("t_login")).await;
            assert_eq!(store.get().await.unwrap().expose(), "t_login");

            coordinator.sign_out().await;
            assert!(store.get().await.is_none());
            expired
        };

        // Sign-out is deliberate, not an expiry
        assert!(matches!(
            expired.try_recv(),
            Err(broadcast::error::TryRecvError::Closed) | Err(broadcast::error::TryRecvError::Empty)
        ));
    }

    #[test]
    fn state_labels() {
        assert_eq!(RefreshState::Idle.label(), "idle");
        assert_eq!(RefreshState::Refreshing.label(), "refreshing");
    }
}
