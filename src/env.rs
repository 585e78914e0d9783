//! The request-scoped, lazily populated environment structure.
//!
//! One [`Environment`] exists per in-flight request. It reads like a plain
//! string-keyed map but stores well-known keys in a fixed slot array indexed
//! by [`RackKey`], with a generic overflow map behind it for everything else.
//! Slots hold either a materialized [`Value`] or a deferred producer that
//! runs at most once, on first [`get`], on the calling thread.
//!
//! The environment is owned by exactly one request and accessed by one
//! logical flow of execution, so memoization needs no internal locking;
//! [`get`] takes `&mut self` for exactly that reason. Handlers that fan the
//! environment out across concurrent tasks must bring their own
//! synchronization around it.
//!
//! [`get`]: Environment::get

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::error::AlreadyHijacked;
use crate::hijack::{HijackCell, HijackProc};
use crate::io::{ErrorSink, RackInput, Transport};
use crate::key::{KeyRegistry, RackKey};

/// Key under which the hijacked transport is installed.
///
/// Not a [`RackKey`]: the entry only exists after a hijack and lives in
/// the overflow map.
pub const HIJACK_IO_KEY: &str = "rack.hijack_io";

/// A value stored in the [`Environment`].
///
/// No shape validation happens on insertion; application code is expected
/// to know which variant lives under which well-known key.
#[derive(Debug)]
pub enum Value {
    Str(String),
    Bool(bool),
    /// The rack protocol version pair, `[1, 4]`.
    Version([u8; 2]),
    Input(RackInput),
    Errors(ErrorSink),
    Proc(HijackProc),
    Io(Transport),
}

impl Value {
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_version(&self) -> Option<[u8; 2]> {
        match self {
            Self::Version(pair) => Some(*pair),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_input(&self) -> Option<&RackInput> {
        match self {
            Self::Input(input) => Some(input),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_errors(&self) -> Option<&ErrorSink> {
        match self {
            Self::Errors(sink) => Some(sink),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_proc(&self) -> Option<&HijackProc> {
        match self {
            Self::Proc(proc_) => Some(proc_),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_io(&self) -> Option<&Transport> {
        match self {
            Self::Io(transport) => Some(transport),
            _ => None,
        }
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::Str(s)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::Str(s.to_owned())
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

type Thunk = Box<dyn FnOnce() -> Value + Send + 'static>;

/// A single insertion path for both already-computed and deferred values.
///
/// `Ready` is for values the builder computed anyway while deriving the
/// request; `Thunk` defers the computation until the key is first read.
/// Both end up retrievable through [`Environment::get`] the same way.
pub enum LazyEntry {
    Ready(Value),
    Thunk(Thunk),
}

impl LazyEntry {
    pub fn thunk(producer: impl FnOnce() -> Value + Send + 'static) -> Self {
        Self::Thunk(Box::new(producer))
    }
}

impl From<Value> for LazyEntry {
    fn from(value: Value) -> Self {
        Self::Ready(value)
    }
}

impl fmt::Debug for LazyEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ready(value) => f.debug_tuple("Ready").field(value).finish(),
            Self::Thunk(_) => f.debug_tuple("Thunk").finish(),
        }
    }
}

enum Slot {
    Unset,
    Deferred(Thunk),
    Ready(Value),
}

impl Slot {
    fn is_set(&self) -> bool {
        !matches!(self, Self::Unset)
    }
}

/// The request environment handed to application code.
///
/// Create one per request via [`EnvironmentBuilder::build`].
///
/// [`EnvironmentBuilder::build`]: crate::EnvironmentBuilder::build
pub struct Environment {
    slots: [Slot; RackKey::COUNT],
    overflow: HashMap<String, Value>,
    registry: Arc<KeyRegistry>,
    hijack: Arc<HijackCell>,
}

impl Environment {
    pub(crate) fn new(registry: Arc<KeyRegistry>, hijack: Arc<HijackCell>) -> Self {
        Self {
            slots: std::array::from_fn(|_| Slot::Unset),
            overflow: HashMap::new(),
            registry,
            hijack,
        }
    }

    /// Look up a key, materializing its value first if it is still deferred.
    ///
    /// A deferred producer runs exactly once; its result is cached in the
    /// slot and every later read observes the same value until the slot is
    /// explicitly overwritten. Reading is the *only* trigger for running a
    /// producer.
    pub fn get(&mut self, key: &str) -> Option<&Value> {
        match self.registry.tag(key) {
            Some(tag) => {
                let slot = &mut self.slots[tag.index()];
                if matches!(slot, Slot::Deferred(_))
                    && let Slot::Deferred(thunk) = std::mem::replace(slot, Slot::Unset)
                {
                    *slot = Slot::Ready(thunk());
                }
                match &self.slots[tag.index()] {
                    Slot::Ready(value) => Some(value),
                    _ => None,
                }
            }
            None => {
                if key == HIJACK_IO_KEY {
                    self.sync_hijack_io();
                }
                self.overflow.get(key)
            }
        }
    }

    /// Insert a materialized value, clearing any pending deferred producer.
    ///
    /// Returns the previous materialized value, if any.
    pub fn insert(&mut self, key: &str, value: impl Into<Value>) -> Option<Value> {
        match self.registry.tag(key) {
            Some(tag) => {
                match std::mem::replace(&mut self.slots[tag.index()], Slot::Ready(value.into())) {
                    Slot::Ready(old) => Some(old),
                    _ => None,
                }
            }
            None => self.overflow.insert(key.to_owned(), value.into()),
        }
    }

    /// Register an entry for a well-known key.
    ///
    /// This is the builder's single insertion path: already-computed values
    /// go in as [`LazyEntry::Ready`], deferred producers as
    /// [`LazyEntry::Thunk`]. Any previous entry for the key is replaced.
    pub fn lazy_put(&mut self, key: RackKey, entry: impl Into<LazyEntry>) {
        self.slots[key.index()] = match entry.into() {
            LazyEntry::Ready(value) => Slot::Ready(value),
            LazyEntry::Thunk(thunk) => Slot::Deferred(thunk),
        };
    }

    /// Delete a key.
    ///
    /// Removing a key whose value is still deferred discards the producer
    /// without running it and returns `None`.
    pub fn remove(&mut self, key: &str) -> Option<Value> {
        match self.registry.tag(key) {
            Some(tag) => match std::mem::replace(&mut self.slots[tag.index()], Slot::Unset) {
                Slot::Ready(value) => Some(value),
                _ => None,
            },
            None => {
                if key == HIJACK_IO_KEY {
                    self.sync_hijack_io();
                }
                self.overflow.remove(key)
            }
        }
    }

    #[must_use]
    pub fn contains_key(&self, key: &str) -> bool {
        match self.registry.tag(key) {
            Some(tag) => self.slots[tag.index()].is_set(),
            None => {
                (key == HIJACK_IO_KEY && self.hijack.pending_io())
                    || self.overflow.contains_key(key)
            }
        }
    }

    /// Iterate over every present key: set slots (materialized or still
    /// deferred) and all overflow entries, each exactly once, in no
    /// particular order. Enumeration never runs a deferred producer.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        RackKey::ALL
            .iter()
            .filter(|key| self.slots[key.index()].is_set())
            .map(|key| key.name())
            .chain(self.overflow.keys().map(String::as_str))
            .chain(
                (self.hijack.pending_io() && !self.overflow.contains_key(HIJACK_IO_KEY))
                    .then_some(HIJACK_IO_KEY),
            )
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.keys().count()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Hijack the connection directly, without going through the
    /// `rack.hijack` callable.
    ///
    /// Installs the raw transport as `rack.hijack_io` and returns it.
    /// Fails with [`AlreadyHijacked`] on every call after the first, or
    /// after the callable already fired.
    pub fn hijack(&mut self) -> Result<&Transport, AlreadyHijacked> {
        self.hijack.fire()?;
        self.sync_hijack_io();
        match self.overflow.get(HIJACK_IO_KEY) {
            Some(Value::Io(transport)) => Ok(transport),
            // fire just transitioned the cell, so the entry is always here
            _ => Err(AlreadyHijacked),
        }
    }

    /// True once the connection was hijacked, through either the callable
    /// or [`hijack`]. The server layer checks this after the handler
    /// returns and suspends its own response writing when set.
    ///
    /// [`hijack`]: Environment::hijack
    #[must_use]
    pub fn is_hijacked(&self) -> bool {
        self.hijack.is_hijacked()
    }

    fn sync_hijack_io(&mut self) {
        if let Some(transport) = self.hijack.drain() {
            self.overflow
                .insert(HIJACK_IO_KEY.to_owned(), Value::Io(transport));
        }
    }
}

impl fmt::Debug for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Environment")
            .field("keys", &self.keys().collect::<Vec<_>>())
            .field("hijacked", &self.is_hijacked())
            .finish()
    }
}
