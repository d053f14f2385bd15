use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::{Arc, Weak};
use std::time::SystemTime;

use tokio::sync::{Mutex, Notify};
use tokio::time::{Instant, sleep_until};
use tracing::info;

use crate::EventHub;
use crate::events::{Event, UnavailableEndEvent};
use crate::pool::PoolState;

use super::state::CredentialId;

/// Deadline heap that returns unavailable credentials to rotation.
#[derive(Debug, Default)]
pub(crate) struct RecoveryQueue {
    heap: Mutex<BinaryHeap<Reverse<(Instant, CredentialId)>>>,
    notify: Notify,
}

impl RecoveryQueue {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) async fn push(&self, until: Instant, credential_id: CredentialId) {
        self.heap.lock().await.push(Reverse((until, credential_id)));
        self.notify.notify_one();
    }

    /// The task stops once the pool state is dropped.
    pub(crate) fn spawn_recover_task(self: Arc<Self>, state: Weak<Mutex<PoolState>>, events: EventHub) {
        tokio::spawn(async move {
            loop {
                let next = {
                    let heap = self.heap.lock().await;
                    heap.peek().map(|Reverse((t, _))| *t)
                };
                match next {
                    None => {
                        self.notify.notified().await;
                        continue;
                    }
                    Some(deadline) => {
                        tokio::select! {
                            _ = sleep_until(deadline) => {}
                            // An earlier deadline may have been pushed.
                            _ = self.notify.notified() => continue,
                        }
                    }
                }

                let now = Instant::now();
                let mut due = Vec::new();
                {
                    let mut heap = self.heap.lock().await;
                    while let Some(Reverse((t, id))) = heap.peek().copied()
                        && t <= now
                    {
                        heap.pop();
                        due.push(id);
                    }
                }
                if due.is_empty() {
                    continue;
                }

                let Some(state) = state.upgrade() else {
                    return;
                };
                let mut recovered = Vec::new();
                {
                    let mut guard = state.lock().await;
                    for id in due {
                        // Stale entries (re-marked with a later deadline) are skipped.
                        if guard.recover(id, now) {
                            recovered.push(id);
                        }
                    }
                }
                for credential_id in recovered {
                    info!(event = "credential_recovered", credential = credential_id);
                    events
                        .emit(Event::UnavailableEnd(UnavailableEndEvent {
                            at: SystemTime::now(),
                            credential_id,
                        }))
                        .await;
                }
            }
        });
    }
}
