//! Notification routing by method name.

use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Callback invoked with a notification's `params`.
pub type NotificationCallback = Arc<dyn Fn(&Value) + Send + Sync>;

#[derive(Clone)]
enum Listener {
    Callback(NotificationCallback),
    Channel(mpsc::UnboundedSender<Value>),
}

/// Per-method listener lists, invoked in registration order.
#[derive(Default)]
pub struct Listeners {
    topics: Mutex<HashMap<String, Vec<Listener>>>,
}

impl fmt::Debug for Listeners {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let topics = self.topics.lock();
        f.debug_map()
            .entries(topics.iter().map(|(method, list)| (method, list.len())))
            .finish()
    }
}

impl Listeners {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_callback(&self, method: impl Into<String>, callback: NotificationCallback) {
        self.push(method.into(), Listener::Callback(callback));
    }

    /// Registers a channel listener and returns its receiver.
    pub fn add_channel(&self, method: impl Into<String>) -> mpsc::UnboundedReceiver<Value> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.push(method.into(), Listener::Channel(tx));
        rx
    }

    fn push(&self, method: String, listener: Listener) {
        self.topics.lock().entry(method).or_default().push(listener);
    }

    /// Removes every listener for `method`, returning how many there were.
    pub fn remove(&self, method: &str) -> usize {
        self.topics.lock().remove(method).map_or(0, |list| list.len())
    }

    pub fn count(&self, method: &str) -> usize {
        self.topics.lock().get(method).map_or(0, Vec::len)
    }

    /// Delivers `params` to every listener of `method`.
    ///
    /// Returns the number of listeners reached. Callbacks run outside the
    /// lock, so they may register or remove listeners.
    pub fn deliver(&self, method: &str, params: &Value) -> usize {
        let snapshot = match self.topics.lock().get(method) {
            Some(list) => list.clone(),
            None => return 0,
        };

        let mut delivered = 0;
        let mut closed = false;
        for listener in &snapshot {
            match listener {
                Listener::Callback(callback) => {
                    callback(params);
                    delivered += 1;
                }
                Listener::Channel(tx) => {
                    if tx.send(params.clone()).is_ok() {
                        delivered += 1;
                    } else {
                        closed = true;
                    }
                }
            }
        }

        if closed {
            let mut topics = self.topics.lock();
            if let Some(list) = topics.get_mut(method) {
                list.retain(|l| !matches!(l, Listener::Channel(tx) if tx.is_closed()));
                if list.is_empty() {
                    topics.remove(method);
                }
            }
        }

        delivered
    }
}
