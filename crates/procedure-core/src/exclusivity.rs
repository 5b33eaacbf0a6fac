//! Mutual exclusivity: at most one procedure per category executes at a time.
//!
//! Design:
//! - Each category is a FIFO of procedure ids in request order.
//! - A lock over a set of categories is granted once the requester is at the
//!   front of every one of them.
//! - Requests are made when a procedure is otherwise ready, so an explicit
//!   dependency between two procedures of one category can never deadlock.
//! - The manager is an injectable value; `shared()` is the process-wide one.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};

use tokio::sync::oneshot;

use crate::domain::ProcedureId;

struct Waiter {
    categories: BTreeSet<String>,
    grant: oneshot::Sender<()>,
}

#[derive(Default)]
struct ExclusivityState {
    queues: HashMap<String, VecDeque<ProcedureId>>,
    waiting: HashMap<ProcedureId, Waiter>,
}

impl ExclusivityState {
    fn is_front_of_all(&self, id: ProcedureId, categories: &BTreeSet<String>) -> bool {
        categories.iter().all(|category| {
            self.queues
                .get(category)
                .and_then(VecDeque::front)
                .is_some_and(|front| *front == id)
        })
    }

    fn remove(&mut self, id: ProcedureId, categories: &BTreeSet<String>) {
        for category in categories {
            if let Some(queue) = self.queues.get_mut(category) {
                queue.retain(|queued| *queued != id);
                if queue.is_empty() {
                    self.queues.remove(category);
                }
            }
        }
    }

    /// Waiters that reached the front of all their categories.
    fn take_grantable(&mut self) -> Vec<(ProcedureId, oneshot::Sender<()>)> {
        let ready: Vec<ProcedureId> = self
            .waiting
            .iter()
            .filter(|(id, waiter)| self.is_front_of_all(**id, &waiter.categories))
            .map(|(id, _)| *id)
            .collect();
        ready
            .into_iter()
            .filter_map(|id| self.waiting.remove(&id).map(|w| (id, w.grant)))
            .collect()
    }
}

/// Registry of category locks.
#[derive(Default)]
pub struct ExclusivityManager {
    state: Mutex<ExclusivityState>,
}

/// A pending lock request. Resolves once every category is held.
pub struct LockRequest {
    receiver: Option<oneshot::Receiver<()>>,
}

impl LockRequest {
    pub async fn granted(mut self) {
        if let Some(receiver) = self.receiver.take() {
            // the sender is only dropped after a grant or a withdrawal
            let _ = receiver.await;
        }
    }
}

impl ExclusivityManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide manager used by queues that were not given one.
    pub fn shared() -> Arc<ExclusivityManager> {
        static SHARED: OnceLock<Arc<ExclusivityManager>> = OnceLock::new();
        Arc::clone(SHARED.get_or_init(|| Arc::new(ExclusivityManager::new())))
    }

    fn lock_state(&self) -> MutexGuard<'_, ExclusivityState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Queue `id` behind the current holders of `categories`.
    pub fn request_lock(&self, id: ProcedureId, categories: &BTreeSet<String>) -> LockRequest {
        let mut state = self.lock_state();
        for category in categories {
            let queue = state.queues.entry(category.clone()).or_default();
            if !queue.contains(&id) {
                queue.push_back(id);
            }
        }

        if state.is_front_of_all(id, categories) {
            tracing::trace!(procedure = %id, ?categories, "exclusivity lock granted");
            return LockRequest { receiver: None };
        }

        let (grant, receiver) = oneshot::channel();
        state.waiting.insert(
            id,
            Waiter {
                categories: categories.clone(),
                grant,
            },
        );
        tracing::trace!(procedure = %id, ?categories, "waiting for exclusivity lock");
        LockRequest {
            receiver: Some(receiver),
        }
    }

    /// Release the categories held (or requested) by `id` and grant the next
    /// waiters.
    pub fn unlock(&self, id: ProcedureId, categories: &BTreeSet<String>) {
        let granted = {
            let mut state = self.lock_state();
            state.waiting.remove(&id);
            state.remove(id, categories);
            state.take_grantable()
        };
        for (next, grant) in granted {
            tracing::trace!(procedure = %next, "exclusivity lock granted");
            let _ = grant.send(());
        }
    }

    /// Is anyone holding or waiting for `category`?
    pub fn is_contended(&self, category: &str) -> bool {
        self.lock_state().queues.contains_key(category)
    }

    /// Current holder of `category`, if any.
    pub fn holder(&self, category: &str) -> Option<ProcedureId> {
        let state = self.lock_state();
        let front = *state.queues.get(category)?.front()?;
        (!state.waiting.contains_key(&front)).then_some(front)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use crate::procedure::{BlockObserver, Procedure};
    use crate::queue::{ProcedureQueue, QueueConfig};

    fn categories(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn second_request_waits_for_unlock() {
        let manager = ExclusivityManager::new();
        let (a, b) = (ProcedureId::generate(), ProcedureId::generate());
        let cats = categories(&["alert"]);

        manager.request_lock(a, &cats).granted().await;
        assert_eq!(manager.holder("alert"), Some(a));

        let pending = manager.request_lock(b, &cats);
        let waiter = tokio::spawn(pending.granted());
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        manager.unlock(a, &cats);
        waiter.await.unwrap();
        assert_eq!(manager.holder("alert"), Some(b));

        manager.unlock(b, &cats);
        assert!(!manager.is_contended("alert"));
    }

    #[tokio::test]
    async fn lock_needs_every_category() {
        let manager = ExclusivityManager::new();
        let (a, b, c) = (
            ProcedureId::generate(),
            ProcedureId::generate(),
            ProcedureId::generate(),
        );

        manager.request_lock(a, &categories(&["x"])).granted().await;
        manager.request_lock(b, &categories(&["y"])).granted().await;
        let both = tokio::spawn(manager_request(&manager, c, &["x", "y"]));

        manager.unlock(a, &categories(&["x"]));
        tokio::task::yield_now().await;
        assert!(!both.is_finished());

        manager.unlock(b, &categories(&["y"]));
        both.await.unwrap();
    }

    fn manager_request(
        manager: &ExclusivityManager,
        id: ProcedureId,
        names: &[&str],
    ) -> impl std::future::Future<Output = ()> + Send + 'static {
        manager.request_lock(id, &categories(names)).granted()
    }

    #[tokio::test]
    async fn withdrawn_request_does_not_block_others() {
        let manager = ExclusivityManager::new();
        let cats = categories(&["net"]);
        let (a, b, c) = (
            ProcedureId::generate(),
            ProcedureId::generate(),
            ProcedureId::generate(),
        );

        manager.request_lock(a, &cats).granted().await;
        let _withdrawn = manager.request_lock(b, &cats);
        let waiter = tokio::spawn(manager.request_lock(c, &cats).granted());

        manager.unlock(b, &cats);
        manager.unlock(a, &cats);

        waiter.await.unwrap();
        assert_eq!(manager.holder("net"), Some(c));
    }

    #[tokio::test]
    async fn shared_category_never_runs_concurrently() {
        let queue = ProcedureQueue::with_config(QueueConfig {
            max_concurrent: Some(8),
            ..QueueConfig::default()
        })
        .with_exclusivity(Arc::new(ExclusivityManager::new()));
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let started = tokio::time::Instant::now();

        let mut futures = Vec::new();
        for i in 0..4 {
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            let procedure = Procedure::block(format!("exclusive-{i}"), move |_ctx| {
                let running = Arc::clone(&running);
                let peak = Arc::clone(&peak);
                async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                }
            });
            procedure.add_mutually_exclusive_category("shared").unwrap();
            futures.push(queue.add(procedure).unwrap());
        }
        for future in futures {
            assert!(future.await.is_success());
        }

        assert_eq!(peak.load(Ordering::SeqCst), 1);
        assert!(started.elapsed() >= Duration::from_millis(80));
    }

    #[tokio::test]
    async fn dependency_wins_over_submission_order() {
        let queue = ProcedureQueue::new().with_exclusivity(Arc::new(ExclusivityManager::new()));
        let order = Arc::new(Mutex::new(Vec::new()));

        let record = |name: &'static str| {
            let order = Arc::clone(&order);
            BlockObserver::new().on_will_execute(move |_| {
                order.lock().unwrap().push(name);
            })
        };
        let a = Procedure::block("a", |_ctx| async { Ok(()) });
        let b = Procedure::block("b", |_ctx| async { Ok(()) });
        a.add_mutually_exclusive_category("ui").unwrap();
        b.add_mutually_exclusive_category("ui").unwrap();
        b.add_dependency(&a).unwrap();
        a.add_observer(record("a"));
        b.add_observer(record("b"));

        let b_done = queue.add(b).unwrap();
        let a_done = queue.add(a).unwrap();

        assert!(a_done.await.is_success());
        assert!(b_done.await.is_success());
        assert_eq!(*order.lock().unwrap(), vec!["a", "b"]);
    }
}
