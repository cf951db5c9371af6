//! Event dispatch module
//!
//! Decouples message arrival from message handling. Listeners are registered
//! per [`MessageType`] and invoked in registration order. The registry is a
//! fixed table with one list per message type.
//!
//! `trigger` copies the listener list for the type and runs the callbacks with
//! no lock held, so a listener may add or remove listeners (including itself)
//! while it runs. Additions show up on the next trigger; a removal also stops
//! any call to that listener still pending in the current trigger.

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::protocol::{Message, MessageType};

/// Result returned by listener callbacks
pub type ListenerResult = anyhow::Result<()>;

type Callback = Arc<dyn Fn(&Message) -> ListenerResult + Send + Sync>;

/// Handle returned by [`EventManager::add_listener`], used for removal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerHandle {
    message_type: MessageType,
    id: u64,
}

impl ListenerHandle {
    pub fn message_type(&self) -> MessageType {
        self.message_type
    }
}

#[derive(Clone)]
struct Registration {
    id: u64,
    active: Arc<AtomicBool>,
    callback: Callback,
}

/// Outcome of a single trigger
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    /// Listeners that were called
    pub invoked: usize,
    /// Listeners that returned an error or panicked
    pub failed: usize,
}

type Table = [Vec<Registration>; MessageType::COUNT];

/// Typed publish/subscribe dispatcher
pub struct EventManager {
    listeners: RwLock<Table>,
    next_id: AtomicU64,
}

impl EventManager {
    pub fn new() -> Self {
        tracing::debug!("Event manager initialized");
        Self {
            listeners: RwLock::new(std::array::from_fn(|_| Vec::new())),
            next_id: AtomicU64::new(1),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Table> {
        self.listeners.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Table> {
        self.listeners.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a callback for one message type
    pub fn add_listener<F>(&self, message_type: MessageType, callback: F) -> ListenerHandle
    where
        F: Fn(&Message) -> ListenerResult + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.write()[message_type.index()].push(Registration {
            id,
            active: Arc::new(AtomicBool::new(true)),
            callback: Arc::new(callback),
        });

        tracing::debug!("Listener {} added for {}", id, message_type);
        ListenerHandle { message_type, id }
    }

    /// Unregister a listener. Returns false if it was already removed.
    pub fn remove_listener(&self, handle: ListenerHandle) -> bool {
        let mut listeners = self.write();
        let list = &mut listeners[handle.message_type.index()];

        match list.iter().position(|r| r.id == handle.id) {
            Some(position) => {
                let registration = list.remove(position);
                registration.active.store(false, Ordering::Release);
                tracing::debug!("Listener {} removed from {}", handle.id, handle.message_type);
                true
            }
            None => false,
        }
    }

    /// Number of listeners currently registered for a type
    pub fn listener_count(&self, message_type: MessageType) -> usize {
        self.read()[message_type.index()].len()
    }

    /// Remove every listener
    pub fn clear(&self) {
        let mut listeners = self.write();
        for list in listeners.iter_mut() {
            for registration in list.drain(..) {
                registration.active.store(false, Ordering::Release);
            }
        }
    }

    /// Invoke every listener registered for the message's type
    ///
    /// Listener failures are logged and never stop the remaining listeners.
    pub fn trigger(&self, message: &Message) -> DispatchReport {
        let message_type = message.message_type();
        let snapshot = self.read()[message_type.index()].clone();

        let mut report = DispatchReport::default();
        if snapshot.is_empty() {
            tracing::debug!("No listeners for {} from {}", message_type, message.sender);
            return report;
        }

        tracing::debug!(
            "Trigger {} from {} ({} listeners)",
            message_type,
            message.sender,
            snapshot.len()
        );

        for registration in snapshot {
            if !registration.active.load(Ordering::Acquire) {
                continue;
            }

            report.invoked += 1;
            let callback = &registration.callback;
            match panic::catch_unwind(AssertUnwindSafe(|| callback(message))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    report.failed += 1;
                    tracing::warn!(
                        "Listener {} for {} failed: {:#}",
                        registration.id,
                        message_type,
                        e
                    );
                }
                Err(panic) => {
                    report.failed += 1;
                    tracing::warn!(
                        "Listener {} for {} panicked: {}",
                        registration.id,
                        message_type,
                        panic_message(panic.as_ref())
                    );
                }
            }
        }

        report
    }
}

impl Default for EventManager {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for EventManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let listeners = self.read();
        let mut map = f.debug_map();
        for ty in MessageType::ALL {
            let count = listeners[ty.index()].len();
            if count > 0 {
                map.entry(&ty, &count);
            }
        }
        map.finish()
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.as_str()
    } else {
        "non-string panic payload"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ConnectionId, Payload};
    use std::sync::Mutex;

    fn chat(text: &str) -> Message {
        Message::new(ConnectionId::new(7), Payload::Chat(text.to_string()))
    }

    #[test]
    fn test_listeners_run_in_registration_order() {
        let events = EventManager::new();
        let calls = Arc::new(Mutex::new(Vec::new()));

        for name in ["L1", "L2", "L3"] {
            let calls = calls.clone();
            events.add_listener(MessageType::Chat, move |_| {
                calls.lock().unwrap().push(name);
                Ok(())
            });
        }

        let report = events.trigger(&chat("hi"));
        assert_eq!(report, DispatchReport { invoked: 3, failed: 0 });
        assert_eq!(*calls.lock().unwrap(), vec!["L1", "L2", "L3"]);
    }

    #[test]
    fn test_listener_receives_payload_and_sender() {
        let events = EventManager::new();
        let seen = Arc::new(Mutex::new(None));

        let slot = seen.clone();
        events.add_listener(MessageType::Chat, move |message| {
            *slot.lock().unwrap() = Some(message.clone());
            Ok(())
        });

        events.trigger(&chat("hi"));
        let message = seen.lock().unwrap().clone().unwrap();
        assert_eq!(message.payload, Payload::Chat("hi".to_string()));
        assert_eq!(message.sender, ConnectionId::new(7));
    }

    #[test]
    fn test_only_matching_type_is_invoked() {
        let events = EventManager::new();
        let count = Arc::new(AtomicU64::new(0));

        let counter = count.clone();
        events.add_listener(MessageType::Turn, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        let report = events.trigger(&chat("hi"));
        assert_eq!(report.invoked, 0);
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_failing_listeners_do_not_stop_dispatch() {
        let events = EventManager::new();
        let reached = Arc::new(AtomicBool::new(false));

        events.add_listener(MessageType::Chat, |_| anyhow::bail!("bad listener"));
        events.add_listener(MessageType::Chat, |_| panic!("worse listener"));
        let flag = reached.clone();
        events.add_listener(MessageType::Chat, move |_| {
            flag.store(true, Ordering::SeqCst);
            Ok(())
        });

        let report = events.trigger(&chat("hi"));
        assert_eq!(report, DispatchReport { invoked: 3, failed: 2 });
        assert!(reached.load(Ordering::SeqCst));
    }

    #[test]
    fn test_listener_can_remove_itself() {
        let events = Arc::new(EventManager::new());
        let own_handle: Arc<Mutex<Option<ListenerHandle>>> = Arc::new(Mutex::new(None));
        let count = Arc::new(AtomicU64::new(0));

        let handle = {
            let events_ref = Arc::downgrade(&events);
            let own_handle = own_handle.clone();
            let count = count.clone();
            events.add_listener(MessageType::Chat, move |_| {
                count.fetch_add(1, Ordering::SeqCst);
                if let (Some(events), Some(handle)) = (events_ref.upgrade(), *own_handle.lock().unwrap()) {
                    events.remove_listener(handle);
                }
                Ok(())
            })
        };
        *own_handle.lock().unwrap() = Some(handle);

        events.trigger(&chat("one"));
        events.trigger(&chat("two"));

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(events.listener_count(MessageType::Chat), 0);
    }

    #[test]
    fn test_removal_during_dispatch_suppresses_later_listener() {
        let events = Arc::new(EventManager::new());
        let victim: Arc<Mutex<Option<ListenerHandle>>> = Arc::new(Mutex::new(None));
        let victim_calls = Arc::new(AtomicU64::new(0));

        {
            let events_ref = Arc::downgrade(&events);
            let victim = victim.clone();
            events.add_listener(MessageType::Chat, move |_| {
                if let (Some(events), Some(handle)) = (events_ref.upgrade(), *victim.lock().unwrap()) {
                    events.remove_listener(handle);
                }
                Ok(())
            });
        }
        let counter = victim_calls.clone();
        let handle = events.add_listener(MessageType::Chat, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        *victim.lock().unwrap() = Some(handle);

        let report = events.trigger(&chat("hi"));
        assert_eq!(report.invoked, 1);
        assert_eq!(victim_calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_addition_during_dispatch_applies_to_next_trigger() {
        let events = Arc::new(EventManager::new());
        let late_calls = Arc::new(AtomicU64::new(0));

        {
            let events_ref = Arc::downgrade(&events);
            let late_calls = late_calls.clone();
            let added = AtomicBool::new(false);
            events.add_listener(MessageType::Chat, move |_| {
                if !added.swap(true, Ordering::SeqCst) {
                    if let Some(events) = events_ref.upgrade() {
                        let late_calls = late_calls.clone();
                        events.add_listener(MessageType::Chat, move |_| {
                            late_calls.fetch_add(1, Ordering::SeqCst);
                            Ok(())
                        });
                    }
                }
                Ok(())
            });
        }

        assert_eq!(events.trigger(&chat("one")).invoked, 1);
        assert_eq!(late_calls.load(Ordering::SeqCst), 0);

        assert_eq!(events.trigger(&chat("two")).invoked, 2);
        assert_eq!(late_calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_remove_is_idempotent() {
        let events = EventManager::new();
        let handle = events.add_listener(MessageType::Join, |_| Ok(()));

        assert!(events.remove_listener(handle));
        assert!(!events.remove_listener(handle));
        assert_eq!(events.listener_count(MessageType::Join), 0);
    }

    #[test]
    fn test_clear_removes_everything() {
        let events = EventManager::new();
        events.add_listener(MessageType::Chat, |_| Ok(()));
        events.add_listener(MessageType::Turn, |_| Ok(()));

        events.clear();
        assert_eq!(events.listener_count(MessageType::Chat), 0);
        assert_eq!(events.listener_count(MessageType::Turn), 0);
    }
}
