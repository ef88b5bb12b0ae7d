pub mod emitter;

pub use emitter::{DEFAULT_MAX_LISTENERS, EmitterMode, EventEmitter, Listener, ListenerId};
