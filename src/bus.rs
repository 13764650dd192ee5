//! Per-stream fan-out.
//!
//! A `Topic` owns one unbounded channel and one dispatcher thread. Publishers
//! push and return immediately; the dispatcher drains the channel in arrival
//! order and hands every value to each subscriber. Subscribe/unsubscribe travel
//! through the same channel, so the subscriber list is owned by the dispatcher
//! alone and needs no lock.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};

use crossbeam::channel::{self, Receiver, Sender};

type Callback<T> = Box<dyn Fn(&T) + Send + 'static>;

enum Command<T> {
    Publish(T),
    Subscribe(u64, Callback<T>),
    /// Ack is sent once the callback is gone and no call is in flight
    Unsubscribe(u64, Option<Sender<()>>),
    Flush(Sender<()>),
}

/// Handle returned by [`Topic::subscribe`]; pass back to `unsubscribe`.
#[derive(Debug, PartialEq, Eq)]
#[must_use = "dropping a Subscription leaves the callback registered"]
pub struct Subscription {
    id: u64,
    topic: &'static str,
}

impl Subscription {
    pub fn topic(&self) -> &'static str {
        self.topic
    }
}

pub struct Topic<T> {
    name: &'static str,
    tx: Sender<Command<T>>,
    next_id: Arc<AtomicU64>,
    dispatcher: ThreadId,
}

impl<T> Clone for Topic<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name,
            tx: self.tx.clone(),
            next_id: self.next_id.clone(),
            dispatcher: self.dispatcher,
        }
    }
}

impl<T: Send + 'static> Topic<T> {
    pub fn new(name: &'static str) -> Self {
        let (tx, rx) = channel::unbounded();
        let handle = thread::spawn(move || dispatch_loop(name, rx));
        Self {
            name,
            tx,
            next_id: Arc::new(AtomicU64::new(1)),
            dispatcher: handle.thread().id(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Queue a value for delivery. Never blocks.
    pub fn publish(&self, value: T) {
        if self.tx.send(Command::Publish(value)).is_err() {
            log::warn!("[bus] {}: dispatcher gone, value dropped", self.name);
        }
    }

    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&T) + Send + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        if self
            .tx
            .send(Command::Subscribe(id, Box::new(callback)))
            .is_err()
        {
            log::warn!("[bus] {}: subscribe after dispatcher exit", self.name);
        }
        Subscription {
            id,
            topic: self.name,
        }
    }

    /// Remove a subscriber. When called from any thread but the dispatcher,
    /// returns only after the callback has been dropped, so no invocation can
    /// start or still be running afterwards.
    pub fn unsubscribe(&self, subscription: Subscription) {
        if thread::current().id() == self.dispatcher {
            // Called from inside a callback; waiting would deadlock.
            let _ = self.tx.send(Command::Unsubscribe(subscription.id, None));
            return;
        }
        let (ack_tx, ack_rx) = channel::bounded(1);
        if self
            .tx
            .send(Command::Unsubscribe(subscription.id, Some(ack_tx)))
            .is_ok()
        {
            let _ = ack_rx.recv();
        }
    }

    /// Block until everything published before this call has been dispatched.
    pub fn flush(&self) {
        if thread::current().id() == self.dispatcher {
            return;
        }
        let (ack_tx, ack_rx) = channel::bounded(1);
        if self.tx.send(Command::Flush(ack_tx)).is_ok() {
            let _ = ack_rx.recv();
        }
    }
}

fn dispatch_loop<T>(name: &'static str, rx: Receiver<Command<T>>) {
    let mut subscribers: Vec<(u64, Callback<T>)> = Vec::new();
    let mut delivered = 0u64;

    for command in rx.iter() {
        match command {
            Command::Publish(value) => {
                for (_, callback) in &subscribers {
                    callback(&value);
                }
                delivered += 1;
            }
            Command::Subscribe(id, callback) => subscribers.push((id, callback)),
            Command::Unsubscribe(id, ack) => {
                let before = subscribers.len();
                subscribers.retain(|(sub_id, _)| *sub_id != id);
                if subscribers.len() == before {
                    log::warn!("[bus] {name}: unsubscribe of unknown id {id}");
                }
                if let Some(ack) = ack {
                    let _ = ack.send(());
                }
            }
            Command::Flush(ack) => {
                let _ = ack.send(());
            }
        }
    }

    if !subscribers.is_empty() {
        log::debug!(
            "[bus] {name}: closed with {} subscriber(s) still registered",
            subscribers.len()
        );
    }
    log::trace!("[bus] {name}: dispatcher exit after {delivered} values");
}
