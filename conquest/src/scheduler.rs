use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, Mutex},
    time::Duration,
};

use tokio::{
    sync::{Notify, mpsc},
    task::JoinHandle,
    time::{self, Instant},
};

/// Cancels one scheduled expiry.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct ExpiryToken(u64);

#[derive(Debug)]
pub struct Expired<T> {
    pub token: ExpiryToken,
    pub payload: T,
}

struct Queue<T> {
    deadlines: BTreeMap<(Instant, u64), T>,
    index: HashMap<u64, Instant>,
    next_id: u64,
    closed: bool,
}

impl<T> Queue<T> {
    fn pop_due(&mut self, now: Instant) -> Vec<Expired<T>> {
        let mut due = Vec::new();
        while let Some(entry) = self.deadlines.first_entry() {
            if entry.key().0 > now {
                break;
            }
            let ((_, id), payload) = entry.remove_entry();
            self.index.remove(&id);
            due.push(Expired {
                token: ExpiryToken(id),
                payload,
            });
        }
        due
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.deadlines.keys().next().map(|(at, _)| *at)
    }
}

struct Shared<T> {
    queue: Mutex<Queue<T>>,
    wake: Notify,
}

/// Deadline-ordered one-shot timers.
///
/// A single driver task sleeps until the earliest deadline and hands each
/// fired payload to the channel given to [`ExpiryScheduler::spawn_driver`].
/// Every entry fires at most once; cancelled entries never fire.
pub struct ExpiryScheduler<T> {
    shared: Arc<Shared<T>>,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl<T: Send + 'static> ExpiryScheduler<T> {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                queue: Mutex::new(Queue {
                    deadlines: BTreeMap::new(),
                    index: HashMap::new(),
                    next_id: 0,
                    closed: false,
                }),
                wake: Notify::new(),
            }),
            driver: Mutex::new(None),
        }
    }

    /// Starts delivering fired entries. Must be called from within a tokio runtime.
    pub fn spawn_driver(&self, fired: mpsc::UnboundedSender<Expired<T>>) {
        let mut driver = self.driver.lock().expect("scheduler driver mutex poisoned");
        if driver.is_some() {
            return;
        }
        let shared = self.shared.clone();
        *driver = Some(tokio::spawn(drive(shared, fired)));
    }

    pub fn schedule(&self, after: Duration, payload: T) -> ExpiryToken {
        let deadline = Instant::now() + after;
        let mut queue = self.shared.queue.lock().expect("scheduler mutex poisoned");
        queue.next_id += 1;
        let id = queue.next_id;
        queue.deadlines.insert((deadline, id), payload);
        queue.index.insert(id, deadline);
        drop(queue);
        self.shared.wake.notify_one();
        ExpiryToken(id)
    }

    /// Returns false if the entry already fired or was cancelled.
    pub fn cancel(&self, token: ExpiryToken) -> bool {
        let mut queue = self.shared.queue.lock().expect("scheduler mutex poisoned");
        match queue.index.remove(&token.0) {
            Some(deadline) => queue.deadlines.remove(&(deadline, token.0)).is_some(),
            None => false,
        }
    }

    pub fn pending(&self) -> usize {
        let queue = self.shared.queue.lock().expect("scheduler mutex poisoned");
        queue.deadlines.len()
    }

    /// Drops every pending entry and stops the driver. Later schedules never fire.
    pub fn shutdown(&self) {
        {
            let mut queue = self.shared.queue.lock().expect("scheduler mutex poisoned");
            queue.closed = true;
            queue.deadlines.clear();
            queue.index.clear();
        }
        self.shared.wake.notify_one();
        if let Some(handle) = self
            .driver
            .lock()
            .expect("scheduler driver mutex poisoned")
            .take()
        {
            handle.abort();
        }
    }
}

async fn drive<T>(shared: Arc<Shared<T>>, fired: mpsc::UnboundedSender<Expired<T>>) {
    loop {
        let next = {
            let mut queue = shared.queue.lock().expect("scheduler mutex poisoned");
            if queue.closed {
                return;
            }
            for expired in queue.pop_due(Instant::now()) {
                if fired.send(expired).is_err() {
                    return;
                }
            }
            queue.next_deadline()
        };

        match next {
            Some(deadline) => {
                tokio::select! {
                    _ = time::sleep_until(deadline) => {}
                    _ = shared.wake.notified() => {}
                }
            }
            None => shared.wake.notified().await,
        }
    }
}
