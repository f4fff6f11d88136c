use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::watch;

use crate::capabilities::kv::lock_ignoring_poison;

/// Coalesces calls arriving within `window` into one invocation of the
/// flush function.
///
/// The first caller of a window becomes its leader: it waits out the
/// window, flushes every item submitted meanwhile, and publishes the result
/// to the followers of that window. All callers of a window observe the
/// same result. A follower whose leader was dropped gets `None`.
pub struct BatchedThrottle<T, R> {
    window: Duration,
    state: Mutex<ThrottleState<T, R>>,
}

struct ThrottleState<T, R> {
    pending: Vec<T>,
    current: Option<watch::Receiver<Option<R>>>,
    generation: u64,
}

enum Role<R> {
    Leader(watch::Sender<Option<R>>, u64),
    Follower(watch::Receiver<Option<R>>),
}

impl<T, R: Clone> BatchedThrottle<T, R> {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            state: Mutex::new(ThrottleState {
                pending: Vec::new(),
                current: None,
                generation: 0,
            }),
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub async fn submit<F, Fut>(&self, item: T, flush: F) -> Option<R>
    where
        F: FnOnce(Vec<T>) -> Fut,
        Fut: Future<Output = R>,
    {
        let role = {
            let mut state = lock_ignoring_poison(&self.state);
            state.pending.push(item);
            match &state.current {
                Some(rx) => Role::Follower(rx.clone()),
                None => {
                    let (tx, rx) = watch::channel(None);
                    state.current = Some(rx);
                    state.generation += 1;
                    Role::Leader(tx, state.generation)
                }
            }
        };

        match role {
            Role::Leader(tx, generation) => {
                let mut guard = LeaderGuard {
                    state: &self.state,
                    generation,
                    armed: true,
                };
                tokio::time::sleep(self.window).await;
                let items = {
                    let mut state = lock_ignoring_poison(&self.state);
                    state.current = None;
                    std::mem::take(&mut state.pending)
                };
                guard.armed = false;

                let result = flush(items).await;
                // followers may all be gone; that is fine
                let _ = tx.send(Some(result.clone()));
                Some(result)
            }
            Role::Follower(mut rx) => loop {
                if let Some(result) = rx.borrow_and_update().clone() {
                    return Some(result);
                }
                if rx.changed().await.is_err() {
                    return rx.borrow().clone();
                }
            },
        }
    }
}

/// Discards the window if its leader is dropped before taking the items,
/// so the next caller opens a fresh one.
struct LeaderGuard<'a, T, R> {
    state: &'a Mutex<ThrottleState<T, R>>,
    generation: u64,
    armed: bool,
}

impl<T, R> Drop for LeaderGuard<'_, T, R> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut state = lock_ignoring_poison(self.state);
        if state.generation == self.generation {
            state.current = None;
            state.pending.clear();
        }
    }
}
