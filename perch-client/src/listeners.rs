//! Per-thread listener registries: each application thread that calls
//! `listen()` or `add_listener()` gets its own registry, so one thread's slow
//! callback never stalls another's.

use std::collections::{HashMap, HashSet};

use crate::event::Event;

/// A callback returning `false` detaches itself.
pub type Callback = Box<dyn FnMut(&Event) -> bool + Send>;

struct Entry {
    callback: Callback,
    detached: bool,
}

/// Listener registry owned by a single application thread.
///
/// The loop thread enqueues events, the owning thread drains them. A drain is
/// two-phase so no lock is held while callbacks run: [`Listeners::take_work`]
/// swaps the pending queues and their callback lists out, [`DrainWork::run`]
/// delivers, [`Listeners::merge_back`] restores the survivors. Kinds with a
/// drain in flight keep accepting events; they are delivered next drain.
pub struct Listeners {
    callbacks: HashMap<String, Vec<Entry>>,
    queues: HashMap<String, Vec<Event>>,
    draining: HashSet<String>,
}

/// Queued events and their callbacks, checked out of a registry for delivery.
pub struct DrainWork {
    items: Vec<(String, Vec<Entry>, Vec<Event>)>,
}

impl Listeners {
    pub fn new() -> Listeners {
        Listeners {
            callbacks: HashMap::new(),
            queues: HashMap::new(),
            draining: HashSet::new(),
        }
    }

    /// Register a callback for an event kind.
    pub fn add(&mut self, kind: &str, callback: Callback) {
        self.callbacks.entry(kind.to_owned()).or_default().push(Entry {
            callback,
            detached: false,
        });
    }

    /// Whether any attached callback remains, for any kind.
    pub fn active(&self) -> bool {
        !self.draining.is_empty()
            || self
                .callbacks
                .values()
                .any(|entries| entries.iter().any(|e| !e.detached))
    }

    /// Queue an event if some callback (attached, or checked out mid-drain)
    /// listens for its kind; otherwise drop it.
    pub fn enqueue(&mut self, event: &Event) {
        let kind = event.kind();
        let interested = self.draining.contains(kind)
            || self
                .callbacks
                .get(kind)
                .map(|entries| entries.iter().any(|e| !e.detached))
                .unwrap_or(false);
        if interested {
            self.queues
                .entry(kind.to_owned())
                .or_default()
                .push(event.clone());
        }
    }

    /// Check out every kind with pending events together with its callbacks.
    pub fn take_work(&mut self) -> DrainWork {
        let mut items = Vec::new();
        let kinds: Vec<String> = self.queues.keys().cloned().collect();
        for kind in kinds {
            let events = match self.queues.remove(&kind) {
                Some(events) if !events.is_empty() => events,
                _ => continue,
            };
            let entries = self.callbacks.remove(&kind).unwrap_or_default();
            self.draining.insert(kind.clone());
            items.push((kind, entries, events));
        }
        DrainWork { items }
    }

    /// Return surviving callbacks after a drain. Callbacks registered for the
    /// same kind while the drain ran keep their relative order after the
    /// survivors.
    pub fn merge_back(&mut self, work: DrainWork) {
        for (kind, mut entries, _) in work.items {
            self.draining.remove(&kind);
            entries.retain(|e| !e.detached);
            if let Some(added) = self.callbacks.remove(&kind) {
                entries.extend(added);
            }
            if !entries.is_empty() {
                self.callbacks.insert(kind, entries);
            }
        }
    }
}

impl DrainWork {
    /// Deliver the checked-out events. Returns the number of events delivered
    /// to at least one callback. A callback returning `false` is skipped for
    /// the rest of this drain and dropped at merge time.
    pub fn run(&mut self) -> usize {
        let mut delivered = 0;
        for (_, entries, events) in self.items.iter_mut() {
            for event in events.iter() {
                let mut any = false;
                for entry in entries.iter_mut() {
                    if entry.detached {
                        continue;
                    }
                    any = true;
                    if !(entry.callback)(event) {
                        entry.detached = true;
                    }
                }
                if any {
                    delivered += 1;
                }
            }
        }
        delivered
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

impl Default for Listeners {
    fn default() -> Self {
        Listeners::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Event;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn chat(nick: &str) -> Event {
        Event::Generic {
            target: "chat".into(),
            data: serde_json::json!({ "nick": nick }),
        }
    }

    fn drain(l: &mut Listeners) -> usize {
        let mut work = l.take_work();
        let delivered = work.run();
        l.merge_back(work);
        delivered
    }

    #[test]
    fn events_without_a_listener_are_dropped() {
        let mut l = Listeners::new();
        l.enqueue(&chat("a"));
        assert!(l.take_work().is_empty());
    }

    #[test]
    fn delivery_counts_events_not_callbacks() {
        let mut l = Listeners::new();
        let hits = Arc::new(AtomicUsize::new(0));
        for _ in 0..2 {
            let hits = hits.clone();
            l.add(
                "chat",
                Box::new(move |_| {
                    hits.fetch_add(1, Ordering::SeqCst);
                    true
                }),
            );
        }
        l.enqueue(&chat("a"));
        assert_eq!(drain(&mut l), 1);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn returning_false_detaches() {
        let mut l = Listeners::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let cb_hits = hits.clone();
        l.add(
            "chat",
            Box::new(move |_| {
                cb_hits.fetch_add(1, Ordering::SeqCst);
                false
            }),
        );
        l.enqueue(&chat("a"));
        l.enqueue(&chat("b"));
        assert_eq!(drain(&mut l), 2);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(!l.active());
        l.enqueue(&chat("c"));
        assert_eq!(drain(&mut l), 0);
    }

    #[test]
    fn events_enqueued_mid_drain_are_kept_for_the_next_drain() {
        let mut l = Listeners::new();
        l.add("chat", Box::new(|_| true));
        l.enqueue(&chat("a"));
        let mut work = l.take_work();
        // The loop thread races in while callbacks run.
        l.enqueue(&chat("b"));
        assert_eq!(work.run(), 1);
        l.merge_back(work);
        assert_eq!(drain(&mut l), 1);
    }

    #[test]
    fn listeners_registered_mid_drain_order_after_survivors() {
        let mut l = Listeners::new();
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let first = order.clone();
        l.add(
            "chat",
            Box::new(move |_| {
                first.lock().unwrap().push("old");
                true
            }),
        );
        l.enqueue(&chat("a"));
        let mut work = l.take_work();
        let second = order.clone();
        l.add(
            "chat",
            Box::new(move |_| {
                second.lock().unwrap().push("new");
                true
            }),
        );
        work.run();
        l.merge_back(work);
        l.enqueue(&chat("b"));
        assert_eq!(drain(&mut l), 1);
        assert_eq!(*order.lock().unwrap(), vec!["old", "old", "new"]);
    }
}
