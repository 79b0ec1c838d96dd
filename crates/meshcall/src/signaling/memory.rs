//! In-process relay
//!
//! A JSON tree with value subscriptions, used by the demo binary and the
//! test suites in place of a hosted realtime database. Empty objects are
//! pruned after deletes and writing `null` deletes, so snapshots look like
//! the hosted store's.

use super::relay::{Relay, RelayPath, RelaySubscription, Snapshot, SubscriptionId};
use crate::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Injected failures
#[derive(Debug, Clone, Default)]
pub struct RelayFaults {
    /// Reject every write
    pub fail_writes: bool,
    /// Reject every delete
    pub fail_deletes: bool,
    /// Reject every subscribe
    pub fail_subscribes: bool,
    /// Reject writes and deletes at or below this path
    pub fail_under: Option<RelayPath>,
}

impl RelayFaults {
    fn rejects(&self, path: &RelayPath, is_write: bool) -> bool {
        let global = if is_write {
            self.fail_writes
        } else {
            self.fail_deletes
        };
        global
            || self
                .fail_under
                .as_ref()
                .is_some_and(|prefix| prefix.is_prefix_of(path))
    }
}

/// One recorded mutation
#[derive(Debug, Clone, PartialEq)]
pub enum RelayOp {
    /// Value written at a path
    Write(RelayPath, Value),
    /// Path deleted
    Delete(RelayPath),
}

struct Subscriber {
    path: RelayPath,
    tx: mpsc::UnboundedSender<Snapshot>,
}

#[derive(Default)]
struct Inner {
    root: Value,
    subscribers: HashMap<SubscriptionId, Subscriber>,
    log: Vec<RelayOp>,
    faults: RelayFaults,
}

/// In-memory [`Relay`]
#[derive(Default)]
pub struct MemoryRelay {
    inner: Mutex<Inner>,
    next_id: AtomicU64,
}

impl MemoryRelay {
    /// Create an empty relay
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the injected failures
    pub fn set_faults(&self, faults: RelayFaults) {
        self.inner.lock().faults = faults;
    }

    /// Current value at `path`
    pub fn snapshot(&self, path: &RelayPath) -> Snapshot {
        get_at(&self.inner.lock().root, path.segments()).cloned()
    }

    /// Every successful mutation so far, in order
    pub fn log(&self) -> Vec<RelayOp> {
        self.inner.lock().log.clone()
    }

    /// Successful writes at or below `prefix`
    pub fn writes_under(&self, prefix: &RelayPath) -> Vec<(RelayPath, Value)> {
        self.inner
            .lock()
            .log
            .iter()
            .filter_map(|op| match op {
                RelayOp::Write(path, value) if prefix.is_prefix_of(path) => {
                    Some((path.clone(), value.clone()))
                }
                _ => None,
            })
            .collect()
    }

    /// Successful deletes at or below `prefix`
    pub fn deletes_under(&self, prefix: &RelayPath) -> Vec<RelayPath> {
        self.inner
            .lock()
            .log
            .iter()
            .filter_map(|op| match op {
                RelayOp::Delete(path) if prefix.is_prefix_of(path) => Some(path.clone()),
                _ => None,
            })
            .collect()
    }

    /// Number of live subscriptions
    pub fn subscriber_count(&self) -> usize {
        self.inner.lock().subscribers.len()
    }

    /// Drop every subscription sender, as a lost connection would
    pub fn disconnect_all(&self) {
        self.inner.lock().subscribers.clear();
    }

    fn notify(inner: &mut Inner, changed: &RelayPath) {
        let root = &inner.root;
        inner.subscribers.retain(|id, sub| {
            if !(sub.path.is_prefix_of(changed) || changed.is_prefix_of(&sub.path)) {
                return true;
            }
            let snapshot = get_at(root, sub.path.segments()).cloned();
            if sub.tx.send(snapshot).is_err() {
                debug!("Dropping closed relay subscription {}", id);
                return false;
            }
            true
        });
    }
}

#[async_trait]
impl Relay for MemoryRelay {
    async fn write(&self, path: &RelayPath, value: Value) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.faults.rejects(path, true) {
            warn!("Injected relay write failure at {}", path);
            return Err(Error::RelayError(format!("write rejected at {}", path)));
        }

        if value.is_null() {
            remove_at(&mut inner.root, path.segments());
        } else {
            set_at(&mut inner.root, path.segments(), value.clone());
        }
        inner.log.push(RelayOp::Write(path.clone(), value));
        Self::notify(&mut inner, path);
        Ok(())
    }

    async fn delete(&self, path: &RelayPath) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.faults.rejects(path, false) {
            warn!("Injected relay delete failure at {}", path);
            return Err(Error::RelayError(format!("delete rejected at {}", path)));
        }

        if path.segments().is_empty() {
            inner.root = Value::Null;
        } else {
            remove_at(&mut inner.root, path.segments());
        }
        inner.log.push(RelayOp::Delete(path.clone()));
        Self::notify(&mut inner, path);
        Ok(())
    }

    async fn subscribe(&self, path: &RelayPath) -> Result<RelaySubscription> {
        let mut inner = self.inner.lock();
        if inner.faults.fail_subscribes {
            return Err(Error::RelayError(format!("subscribe rejected at {}", path)));
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::unbounded_channel();
        // Value listeners fire once with the current state
        let _ = tx.send(get_at(&inner.root, path.segments()).cloned());
        inner.subscribers.insert(
            id,
            Subscriber {
                path: path.clone(),
                tx,
            },
        );
        debug!("Relay subscription {} opened at {}", id, path);

        Ok(RelaySubscription { id, snapshots: rx })
    }

    async fn unsubscribe(&self, id: SubscriptionId) -> Result<()> {
        if self.inner.lock().subscribers.remove(&id).is_some() {
            debug!("Relay subscription {} closed", id);
        }
        Ok(())
    }
}

fn get_at<'a>(node: &'a Value, segments: &[String]) -> Option<&'a Value> {
    let found = segments
        .iter()
        .try_fold(node, |node, seg| node.as_object()?.get(seg))?;
    (!found.is_null()).then_some(found)
}

fn set_at(node: &mut Value, segments: &[String], value: Value) {
    match segments.split_first() {
        None => *node = value,
        Some((head, rest)) => {
            if !node.is_object() {
                *node = Value::Object(Map::new());
            }
            if let Value::Object(map) = node {
                set_at(map.entry(head.clone()).or_insert(Value::Null), rest, value);
            }
        }
    }
}

fn remove_at(node: &mut Value, segments: &[String]) -> bool {
    let Some((head, rest)) = segments.split_first() else {
        return false;
    };
    let Value::Object(map) = node else {
        return false;
    };
    if rest.is_empty() {
        return map.remove(head).is_some();
    }
    let Some(child) = map.get_mut(head) else {
        return false;
    };
    let removed = remove_at(child, rest);
    if removed && child.as_object().is_some_and(Map::is_empty) {
        map.remove(head);
    }
    removed
}
