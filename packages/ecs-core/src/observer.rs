//! Observer registry: append-only, per-type event queues delivered during
//! `AddRemove` commits.

use std::any::TypeId;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::component::Component;
use crate::entity::Entity;
use crate::error::{EcsError, EcsResult};

/// One lifecycle event delivered to an observer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event<T> {
    /// `T` was added to `Entity` (its presence bit flipped 0 -> 1).
    Added(Entity, std::marker::PhantomData<T>),
    /// `T` was explicitly `Set` on an entity that already had it.
    Modified(Entity),
    /// `T` was removed from `Entity` (its presence bit flipped 1 -> 0, via
    /// `Unset` or `Destroy`).
    Removed(Entity),
}

impl<T> Event<T> {
    pub fn added(entity: Entity) -> Self {
        Event::Added(entity, std::marker::PhantomData)
    }
}

struct Queue<T> {
    events: Mutex<VecDeque<Event<T>>>,
    closed: AtomicBool,
}

impl<T> Queue<T> {
    fn new() -> Self {
        Self {
            events: Mutex::new(VecDeque::new()),
            closed: AtomicBool::new(false),
        }
    }
}

/// The strong-owning handle returned by `register`. Dropping it drops the
/// queue; the registry only holds a [`Weak`] reference and lazily compacts
/// dead entries whenever a new observer is registered.
pub struct Observer<T: Component> {
    queue: Arc<Queue<T>>,
}

impl<T: Component> Observer<T> {
    /// Pops the next queued event, oldest first.
    /// `None` if the queue is currently empty; `Err(ObserverClosed)` if
    /// `close` was already called.
    pub fn poll(&self) -> EcsResult<Option<Event<T>>> {
        if self.queue.closed.load(Ordering::Acquire) {
            return Err(EcsError::ObserverClosed);
        }
        Ok(self.queue.events.lock().pop_front())
    }

    /// Explicitly stops delivery. Requires `AddRemove` at the call site
    /// (enforced by [`crate::transaction::Transaction::close_observer`]);
    /// this method itself is just the mechanical half.
    pub fn close(&self) {
        self.queue.closed.store(true, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.queue.closed.load(Ordering::Acquire)
    }
}

trait AnyQueue: Send + Sync {
    fn type_id(&self) -> TypeId;
    fn is_alive(&self) -> bool;
    fn push_added(&self, entity: Entity);
    fn push_modified(&self, entity: Entity);
    fn push_removed(&self, entity: Entity);
}

struct TypedHandle<T: Component> {
    queue: Weak<Queue<T>>,
}

impl<T: Component> AnyQueue for TypedHandle<T> {
    fn type_id(&self) -> TypeId {
        TypeId::of::<T>()
    }
    fn is_alive(&self) -> bool {
        self.queue.strong_count() > 0
    }
    fn push_added(&self, entity: Entity) {
        if let Some(q) = self.queue.upgrade() {
            if !q.closed.load(Ordering::Acquire) {
                q.events.lock().push_back(Event::added(entity));
            }
        }
    }
    fn push_modified(&self, entity: Entity) {
        if let Some(q) = self.queue.upgrade() {
            if !q.closed.load(Ordering::Acquire) {
                q.events.lock().push_back(Event::Modified(entity));
            }
        }
    }
    fn push_removed(&self, entity: Entity) {
        if let Some(q) = self.queue.upgrade() {
            if !q.closed.load(Ordering::Acquire) {
                q.events.lock().push_back(Event::Removed(entity));
            }
        }
    }
}

/// Owns every live observer queue, keyed implicitly by the `TypeId` each
/// `TypedHandle` carries. Registration and dispatch both require
/// `AddRemove` at the call site; this type is the mechanical half the
/// transaction/EMS-commit path drives.
#[derive(Default)]
pub struct ObserverRegistry {
    handles: Mutex<Vec<Box<dyn AnyQueue>>>,
}

impl ObserverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a fresh observer for component type `T`. Lazily compacts
    /// dead (dropped) entries first.
    pub fn register<T: Component>(&self) -> Observer<T> {
        let queue = Arc::new(Queue::new());
        let handle = Box::new(TypedHandle {
            queue: Arc::downgrade(&queue),
        });
        let mut handles = self.handles.lock();
        handles.retain(|h| h.is_alive());
        handles.push(handle);
        Observer { queue }
    }

    /// Dispatches `Added(entity)` to every live observer of type `T`.
    pub fn dispatch_added<T: Component>(&self, entity: Entity) {
        self.dispatch_added_by_id(TypeId::of::<T>(), entity);
    }

    /// Dispatches `Modified(entity)` to every live observer of type `T`.
    pub fn dispatch_modified<T: Component>(&self, entity: Entity) {
        self.dispatch_modified_by_id(TypeId::of::<T>(), entity);
    }

    /// Dispatches `Removed(entity)` to every live observer of type `T`.
    pub fn dispatch_removed<T: Component>(&self, entity: Entity) {
        self.dispatch_removed_by_id(TypeId::of::<T>(), entity);
    }

    /// Type-erased variants used by the EMS-commit dispatch loop, which
    /// walks registered component types by runtime `TypeId` rather than by
    /// a compile-time type parameter, since the registry is only fixed at
    /// the `Ecs` level.
    pub fn dispatch_added_by_id(&self, type_id: TypeId, entity: Entity) {
        self.dispatch_by_id(type_id, entity, AnyQueue::push_added);
    }
    pub fn dispatch_modified_by_id(&self, type_id: TypeId, entity: Entity) {
        self.dispatch_by_id(type_id, entity, AnyQueue::push_modified);
    }
    pub fn dispatch_removed_by_id(&self, type_id: TypeId, entity: Entity) {
        self.dispatch_by_id(type_id, entity, AnyQueue::push_removed);
    }

    fn dispatch_by_id(&self, type_id: TypeId, entity: Entity, f: impl Fn(&dyn AnyQueue, Entity)) {
        let handles = self.handles.lock();
        for handle in handles.iter() {
            if handle.type_id() == type_id {
                f(handle.as_ref(), entity);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default, Clone)]
    struct Count(u32);
    impl Component for Count {}

    fn entity(i: u32) -> Entity {
        Entity::new(i, 1, 0)
    }

    #[test]
    fn delivers_events_fifo() {
        let registry = ObserverRegistry::new();
        let observer = registry.register::<Count>();

        let e = entity(1);
        registry.dispatch_added::<Count>(e);
        registry.dispatch_modified::<Count>(e);
        registry.dispatch_removed::<Count>(e);

        assert!(matches!(observer.poll().unwrap(), Some(Event::Added(_, _))));
        assert!(matches!(observer.poll().unwrap(), Some(Event::Modified(_))));
        assert!(matches!(observer.poll().unwrap(), Some(Event::Removed(_))));
        assert!(observer.poll().unwrap().is_none());
    }

    #[test]
    fn closed_observer_fails_poll() {
        let registry = ObserverRegistry::new();
        let observer = registry.register::<Count>();
        observer.close();
        assert!(matches!(observer.poll(), Err(EcsError::ObserverClosed)));
    }

    #[test]
    fn dropping_observer_handle_does_not_panic_dispatch() {
        let registry = ObserverRegistry::new();
        {
            let _observer = registry.register::<Count>();
        }
        registry.dispatch_added::<Count>(entity(3));
    }
}
