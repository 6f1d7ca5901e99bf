//! Typed change-notification channel.
//!
//! An [`Observable`] holds the latest value and a list of subscriber
//! callbacks. `set` only notifies when the value actually changes, and it
//! notifies synchronously in subscription order. Callbacks may call back
//! into other observables (controllers schedule reactions this way), so no
//! internal borrow is held while they run.
//!
//! Subscriptions do not own their subscriber: callbacks are expected to
//! capture a `Weak` handle and become no-ops once the target is gone.

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

/// Handle returned by [`Observable::subscribe`], used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Callback<T> = Rc<dyn Fn(&T)>;

pub struct Observable<T> {
    value: RefCell<Option<T>>,
    subscribers: RefCell<Vec<(SubscriptionId, Callback<T>)>>,
    next_id: Cell<u64>,
}

impl<T: Clone + PartialEq + 'static> Observable<T> {
    /// Empty channel: no value until the first `set`.
    pub fn new() -> Self {
        Self {
            value: RefCell::new(None),
            subscribers: RefCell::new(Vec::new()),
            next_id: Cell::new(0),
        }
    }

    /// Channel seeded with `initial`. Seeding does not notify.
    pub fn with_value(initial: T) -> Self {
        let channel = Self::new();
        *channel.value.borrow_mut() = Some(initial);
        channel
    }

    pub fn get(&self) -> Option<T> {
        self.value.borrow().clone()
    }

    /// Store `value` and notify every subscriber iff it differs from the
    /// current one. Returns whether a notification went out.
    pub fn set(&self, value: T) -> bool {
        {
            let mut current = self.value.borrow_mut();
            if current.as_ref() == Some(&value) {
                return false;
            }
            *current = Some(value.clone());
        }

        let callbacks: Vec<Callback<T>> = self
            .subscribers
            .borrow()
            .iter()
            .map(|(_, cb)| Rc::clone(cb))
            .collect();
        for cb in callbacks {
            cb(&value);
        }
        true
    }

    pub fn subscribe(&self, callback: impl Fn(&T) + 'static) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.get());
        self.next_id.set(id.0 + 1);
        self.subscribers.borrow_mut().push((id, Rc::new(callback)));
        id
    }

    /// Remove a subscription. Unknown ids are ignored.
    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.subscribers.borrow_mut().retain(|(sid, _)| *sid != id);
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.borrow().len()
    }

    /// Attach a dirty-flag [`Latest`] subscriber to this channel. The
    /// returned handle keeps the subscriber alive; dropping it turns the
    /// subscription into a no-op.
    pub fn watch(&self) -> Rc<Latest<T>> {
        let latest = Rc::new(Latest::new());
        let weak: Weak<Latest<T>> = Rc::downgrade(&latest);
        self.subscribe(move |v| {
            if let Some(latest) = weak.upgrade() {
                latest.update(v.clone());
            }
        });
        latest
    }
}

impl<T: Clone + PartialEq + 'static> Default for Observable<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Subscriber that remembers the last value it received and whether that
/// value has been read yet.
pub struct Latest<T> {
    value: RefCell<Option<T>>,
    changed: Cell<bool>,
}

impl<T: Clone> Latest<T> {
    fn new() -> Self {
        Self {
            value: RefCell::new(None),
            changed: Cell::new(false),
        }
    }

    fn update(&self, value: T) {
        *self.value.borrow_mut() = Some(value);
        self.changed.set(true);
    }

    /// Read the value and clear the changed flag.
    pub fn take(&self) -> Option<T> {
        self.changed.set(false);
        self.value.borrow().clone()
    }

    /// True if a value arrived since the last `take`.
    pub fn changed(&self) -> bool {
        self.changed.get()
    }
}
