use std::cell::RefCell;
use std::rc::Rc;

use rustc_hash::FxHashMap;
use slotmap::{SlotMap, new_key_type};
use smallvec::SmallVec;

new_key_type! {
    pub struct ListenerId;
}

pub const DEFAULT_MAX_LISTENERS: usize = 20;

pub type Listener<A> = Rc<dyn Fn(&A)>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EmitterMode {
    /// The same listener may be registered any number of times.
    #[default]
    Multi,
    /// Registering an already registered [`Listener`] for the same event
    /// returns the existing id instead of adding it again.
    Unique,
}

struct Entry<A> {
    callback: Listener<A>,
    once: bool,
}

struct Registry<A> {
    listeners: SlotMap<ListenerId, Entry<A>>,
    events: FxHashMap<String, SmallVec<[ListenerId; 4]>>,
    max_listeners: Option<usize>,
}

/// Named listener lists.
///
/// Listeners are called in registration order (prepended ones first). An
/// emit calls the listeners registered when it started; adding or removing
/// listeners from inside a listener only affects later emits.
pub struct EventEmitter<A> {
    registry: RefCell<Registry<A>>,
    mode: EmitterMode,
}

impl<A> Default for EventEmitter<A> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A> EventEmitter<A> {
    pub fn new() -> Self {
        Self::with_mode(EmitterMode::Multi)
    }

    pub fn unique() -> Self {
        Self::with_mode(EmitterMode::Unique)
    }

    pub fn with_mode(mode: EmitterMode) -> Self {
        Self {
            registry: RefCell::new(Registry {
                listeners: SlotMap::with_key(),
                events: FxHashMap::default(),
                max_listeners: None,
            }),
            mode,
        }
    }

    pub fn mode(&self) -> EmitterMode {
        self.mode
    }

    pub fn on(&self, name: &str, listener: impl Fn(&A) + 'static) -> ListenerId {
        self.register(name, Rc::new(listener), false, false)
    }

    pub fn add_listener(&self, name: &str, listener: impl Fn(&A) + 'static) -> ListenerId {
        self.on(name, listener)
    }

    /// Registers a shared listener. In [`EmitterMode::Unique`] a listener
    /// already registered for `name` is not added twice.
    pub fn on_shared(&self, name: &str, listener: Listener<A>) -> ListenerId {
        self.register(name, listener, false, false)
    }

    /// Registers a listener that is removed the first time it fires.
    pub fn once(&self, name: &str, listener: impl Fn(&A) + 'static) -> ListenerId {
        self.register(name, Rc::new(listener), true, false)
    }

    pub fn prepend_listener(&self, name: &str, listener: impl Fn(&A) + 'static) -> ListenerId {
        self.register(name, Rc::new(listener), false, true)
    }

    pub fn prepend_once_listener(
        &self,
        name: &str,
        listener: impl Fn(&A) + 'static,
    ) -> ListenerId {
        self.register(name, Rc::new(listener), true, true)
    }

    fn register(&self, name: &str, callback: Listener<A>, once: bool, prepend: bool) -> ListenerId {
        let mut registry = self.registry.borrow_mut();
        let Registry {
            listeners,
            events,
            max_listeners,
        } = &mut *registry;

        let ids = events.entry(name.to_string()).or_default();
        if self.mode == EmitterMode::Unique {
            let existing = ids
                .iter()
                .copied()
                .find(|&id| Rc::ptr_eq(&listeners[id].callback, &callback));
            if let Some(id) = existing {
                return id;
            }
        }

        let id = listeners.insert(Entry { callback, once });
        if prepend {
            ids.insert(0, id);
        } else {
            ids.push(id);
        }

        let max = max_listeners.unwrap_or(DEFAULT_MAX_LISTENERS);
        if ids.len() == max + 1 {
            tracing::warn!(
                event_name = name,
                count = ids.len(),
                "possible listener leak detected; use set_max_listeners() to increase the limit"
            );
        }
        id
    }

    /// Removes one listener. Returns whether it was registered for `name`.
    pub fn remove_listener(&self, name: &str, id: ListenerId) -> bool {
        let mut registry = self.registry.borrow_mut();
        let Some(ids) = registry.events.get_mut(name) else {
            return false;
        };
        let Some(pos) = ids.iter().position(|&other| other == id) else {
            return false;
        };
        ids.remove(pos);
        if ids.is_empty() {
            registry.events.remove(name);
        }
        registry.listeners.remove(id);
        true
    }

    pub fn off(&self, name: &str, id: ListenerId) -> bool {
        self.remove_listener(name, id)
    }

    /// Removes the listeners of `name`, or of every event when `None`.
    pub fn remove_all_listeners(&self, name: Option<&str>) {
        let mut registry = self.registry.borrow_mut();
        match name {
            Some(name) => {
                if let Some(ids) = registry.events.remove(name) {
                    for id in ids {
                        registry.listeners.remove(id);
                    }
                }
            }
            None => {
                registry.events.clear();
                registry.listeners.clear();
            }
        }
    }

    /// Calls every listener of `name` with `args`. Returns whether the event
    /// had listeners.
    pub fn emit(&self, name: &str, args: &A) -> bool {
        let snapshot: SmallVec<[(ListenerId, Listener<A>, bool); 4]> = {
            let registry = self.registry.borrow();
            let Some(ids) = registry.events.get(name) else {
                return false;
            };
            ids.iter()
                .filter_map(|&id| {
                    registry
                        .listeners
                        .get(id)
                        .map(|entry| (id, entry.callback.clone(), entry.once))
                })
                .collect()
        };

        for (id, callback, once) in snapshot {
            if once {
                self.remove_listener(name, id);
            }
            callback(args);
        }
        true
    }

    pub fn listener_count(&self, name: &str) -> usize {
        self.registry
            .borrow()
            .events
            .get(name)
            .map_or(0, |ids| ids.len())
    }

    /// Names of the events that currently have listeners, in no particular
    /// order.
    pub fn event_names(&self) -> Vec<String> {
        self.registry.borrow().events.keys().cloned().collect()
    }

    pub fn set_max_listeners(&self, max: usize) {
        self.registry.borrow_mut().max_listeners = Some(max);
    }

    pub fn max_listeners(&self) -> usize {
        self.registry
            .borrow()
            .max_listeners
            .unwrap_or(DEFAULT_MAX_LISTENERS)
    }
}
