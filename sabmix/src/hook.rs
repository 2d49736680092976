//! Hooks : points d'accroche synchrones sur le cycle de vie des
//! objets. Les abonnements se libèrent à la chute du [`HookSlot`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

type Callback<T> = Box<dyn Fn(&T) + Send + Sync>;

struct HookInner<T> {
    subscribers: Mutex<Vec<(u64, Callback<T>)>>,
    next_id: AtomicU64,
}

/// Un point d'accroche typé.
pub struct Hook<T> {
    inner: Arc<HookInner<T>>,
}

impl<T> Hook<T> {
    pub fn new() -> Self {
        Hook {
            inner: Arc::new(HookInner {
                subscribers: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(0),
            }),
        }
    }

    /// S'abonne. Les callbacks sont appelés dans l'ordre d'abonnement,
    /// sur le thread qui déclenche le hook.
    pub fn connect(&self, cb: impl Fn(&T) + Send + Sync + 'static) -> HookSlot<T> {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.subscribers.lock().push((id, Box::new(cb)));
        HookSlot {
            hook: Arc::downgrade(&self.inner),
            id,
        }
    }

    /// Déclenche le hook pour `data`.
    pub fn fire(&self, data: &T) {
        // Les callbacks peuvent s'abonner/se désabonner pendant le
        // parcours : on déroule sur une copie des identifiants.
        let ids: Vec<u64> = self
            .inner
            .subscribers
            .lock()
            .iter()
            .map(|(id, _)| *id)
            .collect();
        for id in ids {
            let cb = {
                let mut subs = self.inner.subscribers.lock();
                match subs.iter().position(|(i, _)| *i == id) {
                    Some(pos) => subs.remove(pos),
                    None => continue,
                }
            };
            (cb.1)(data);
            self.inner.subscribers.lock().push(cb);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.inner.subscribers.lock().is_empty()
    }
}

impl<T> Default for Hook<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for Hook<T> {
    fn clone(&self) -> Self {
        Hook {
            inner: self.inner.clone(),
        }
    }
}

/// Abonnement actif ; le détruire désabonne.
pub struct HookSlot<T> {
    hook: Weak<HookInner<T>>,
    id: u64,
}

impl<T> Drop for HookSlot<T> {
    fn drop(&mut self) {
        if let Some(hook) = self.hook.upgrade() {
            hook.subscribers.lock().retain(|(id, _)| *id != self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[test]
    fn fire_reaches_subscribers_in_order() {
        let hook: Hook<u32> = Hook::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let l1 = log.clone();
        let l2 = log.clone();
        let _a = hook.connect(move |v| l1.lock().push(("a", *v)));
        let _b = hook.connect(move |v| l2.lock().push(("b", *v)));
        hook.fire(&7);
        assert_eq!(&*log.lock(), &[("a", 7), ("b", 7)]);
    }

    #[test]
    fn dropped_slot_unsubscribes() {
        let hook: Hook<()> = Hook::new();
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();
        let slot = hook.connect(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        hook.fire(&());
        drop(slot);
        hook.fire(&());
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
