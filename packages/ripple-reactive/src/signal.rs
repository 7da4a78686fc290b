//! Reactive signals.

use std::any::Any;
use std::cell::{Ref, RefMut};
use std::fmt;
use std::fmt::Formatter;
use std::marker::PhantomData;
use std::ops::Deref;

use crate::node::{EqualsFn, NodeId, NodeKind, ReactiveNode};
use crate::scope::Scope;

/// A read-only handle on a reactive value.
///
/// The underlying data is not immutable: it can be updated through the
/// corresponding [`Signal`] (which has write access) and the update will show
/// up in the `ReadSignal` as well. A `ReadSignal` is obtained by
/// dereferencing a [`Signal`].
///
/// # Example
/// ```
/// # use ripple_reactive::*;
/// # let _ = create_scope(|| {
/// let signal: Signal<i32> = create_signal(123);
/// let read_signal: ReadSignal<i32> = *signal;
/// assert_eq!(read_signal.get(), 123);
/// signal.set(456);
/// assert_eq!(read_signal.get(), 456);
/// # });
/// ```
pub struct ReadSignal<T: 'static> {
    pub(crate) id: NodeId,
    scope: &'static Scope,
    /// Keep track of where the signal was created for diagnostics.
    #[cfg(debug_assertions)]
    created_at: &'static std::panic::Location<'static>,
    _phantom: PhantomData<T>,
}

/// A reactive value that can be read and written to.
///
/// This is the writable analog of [`ReadSignal`]. A write is compared
/// against the current value with the signal's equality predicate; an equal
/// write keeps the old value and propagates nothing.
pub struct Signal<T: 'static>(pub(crate) ReadSignal<T>);

/// Create a new [`Signal`] using the type's [`PartialEq`] implementation as
/// the equality predicate.
///
/// Signals are reactive atoms, pieces of state that can be read and written
/// to and which will automatically update anything that depends on them.
///
/// ```rust
/// # use ripple_reactive::*;
/// # let _ = create_scope(|| {
/// let state = create_signal(1);
/// assert_eq!(state.get(), 1);
/// state.set(2);
/// assert_eq!(state.get(), 2);
/// # });
/// ```
///
/// Accessing a signal inside a derivation or watcher automatically tracks it
/// as a dependency:
///
/// ```rust
/// # use ripple_reactive::*;
/// # let _ = create_scope(|| {
/// let state = create_signal(1);
/// let double = create_derived(move || state.get() * 2);
/// state.set(2);
/// assert_eq!(double.get(), 4);
/// # });
/// ```
///
/// What is returned from this function is just a `Copy`-able handle; the
/// value itself is owned by the [`Scope`](crate::create_scope), which allows
/// freely moving handles into closures without worrying about ownership.
#[cfg_attr(debug_assertions, track_caller)]
pub fn create_signal<T: PartialEq>(value: T) -> Signal<T> {
    create_signal_with(value, T::eq)
}

/// Create a new [`Signal`] with a custom equality predicate.
///
/// The predicate is called with `(prev, next)` on every write, exactly once;
/// returning `true` makes the write a silent no-op. This is the place for
/// conventions the type's `PartialEq` does not express, such as treating two
/// NaN values as the same:
///
/// ```rust
/// # use ripple_reactive::*;
/// # let _ = create_scope(|| {
/// let value = create_signal_with(f64::NAN, |a: &f64, b: &f64| {
///     a == b || (a.is_nan() && b.is_nan())
/// });
/// value.set(f64::NAN); // does not propagate
/// # });
/// ```
#[cfg_attr(debug_assertions, track_caller)]
pub fn create_signal_with<T>(
    value: T,
    mut equals: impl FnMut(&T, &T) -> bool + 'static,
) -> Signal<T> {
    let signal = create_empty_signal::<T>(NodeKind::Source);
    let mut node = signal.get_mut();
    node.value = Some(Box::new(value));
    node.equals = Some(Box::new(move |prev: &dyn Any, next: &dyn Any| {
        equals(
            prev.downcast_ref().expect("wrong value type"),
            next.downcast_ref().expect("wrong value type"),
        )
    }));
    drop(node);
    signal
}

/// Creates a new node of the given kind with the `value` field set to `None`.
#[cfg_attr(debug_assertions, track_caller)]
pub(crate) fn create_empty_signal<T>(kind: NodeKind) -> Signal<T> {
    let scope = Scope::global();
    let id = scope.insert_node(kind);
    Signal(ReadSignal {
        id,
        scope,
        #[cfg(debug_assertions)]
        created_at: std::panic::Location::caller(),
        _phantom: PhantomData,
    })
}

impl<T> ReadSignal<T> {
    /// Get an immutable reference to the underlying node.
    #[cfg_attr(debug_assertions, track_caller)]
    pub(crate) fn get_ref(self) -> Ref<'static, ReactiveNode> {
        Ref::map(self.scope.nodes.borrow(), |nodes| match nodes.get(self.id) {
            Some(node) => node,
            None => panic!("{}", self.get_disposed_panic_message()),
        })
    }

    /// Get a mutable reference to the underlying node.
    #[cfg_attr(debug_assertions, track_caller)]
    pub(crate) fn get_mut(self) -> RefMut<'static, ReactiveNode> {
        RefMut::map(self.scope.nodes.borrow_mut(), |nodes| {
            match nodes.get_mut(self.id) {
                Some(node) => node,
                None => panic!("{}", self.get_disposed_panic_message()),
            }
        })
    }

    /// Returns `true` while the owning scope has not been disposed.
    pub fn is_alive(self) -> bool {
        self.scope.nodes.borrow().get(self.id).is_some()
    }

    fn get_disposed_panic_message(self) -> String {
        #[cfg(not(debug_assertions))]
        return "signal of a disposed scope".to_string();

        #[cfg(debug_assertions)]
        return format!("signal of a disposed scope. Created at {}", self.created_at);
    }

    /// Get the value of the signal without tracking it. The type must
    /// implement [`Copy`]. If this is not the case, use
    /// [`ReadSignal::get_clone_untracked`] or [`ReadSignal::with_untracked`]
    /// instead.
    #[cfg_attr(debug_assertions, track_caller)]
    pub fn get_untracked(self) -> T
    where
        T: Copy,
    {
        self.with_untracked(|value| *value)
    }

    /// Get the value of the signal without tracking it. The value is
    /// [`Clone`]-ed automatically.
    #[cfg_attr(debug_assertions, track_caller)]
    pub fn get_clone_untracked(self) -> T
    where
        T: Clone,
    {
        self.with_untracked(Clone::clone)
    }

    /// Get the value of the signal. The type must implement [`Copy`]. If
    /// this is not the case, use [`ReadSignal::get_clone`] or
    /// [`ReadSignal::with`] instead.
    ///
    /// When called inside a tracking frame, the signal is registered as a
    /// dependency of the evaluating node.
    #[cfg_attr(debug_assertions, track_caller)]
    pub fn get(self) -> T
    where
        T: Copy,
    {
        self.track();
        self.get_untracked()
    }

    /// Get the value of the signal. The value is [`Clone`]-ed automatically.
    ///
    /// When called inside a tracking frame, the signal is registered as a
    /// dependency of the evaluating node.
    #[cfg_attr(debug_assertions, track_caller)]
    pub fn get_clone(self) -> T
    where
        T: Clone,
    {
        self.track();
        self.get_clone_untracked()
    }

    /// Get a value from the signal without tracking it.
    #[cfg_attr(debug_assertions, track_caller)]
    pub fn with_untracked<U>(self, f: impl FnOnce(&T) -> U) -> U {
        let node = self.get_ref();
        let value = node.value.as_ref().expect("value is being updated");
        f(value.downcast_ref().expect("wrong value type"))
    }

    /// Get a value from the signal.
    ///
    /// When called inside a tracking frame, the signal is registered as a
    /// dependency of the evaluating node.
    #[cfg_attr(debug_assertions, track_caller)]
    pub fn with<U>(self, f: impl FnOnce(&T) -> U) -> U {
        self.track();
        self.with_untracked(f)
    }

    /// Register the signal as a dependency of the node that is currently
    /// evaluating, at most once per evaluation. This is done automatically
    /// by [`ReadSignal::get`] and the other tracked accessors.
    ///
    /// Does nothing outside a tracking frame.
    pub fn track(self) {
        if let Some(tracker) = &mut *self.scope.tracker.borrow_mut() {
            if !tracker.dependencies.contains(&self.id) {
                tracker.dependencies.push(self.id);
            }
        }
    }
}

impl<T> Signal<T> {
    /// Set a new value for the signal.
    ///
    /// The equality predicate is invoked exactly once with the previous and
    /// the new value. If it reports them equal, the old value is kept and
    /// nothing propagates. Otherwise the value is replaced and every
    /// dependent is brought up to date before this call returns.
    #[cfg_attr(debug_assertions, track_caller)]
    pub fn set(self, new: T) {
        let scope = self.0.scope;
        let mut nodes = scope.nodes.borrow_mut();
        let Some(node) = nodes.get_mut(self.0.id) else {
            panic!("{}", self.0.get_disposed_panic_message());
        };
        let equals = node.equals.take().expect("node is not writable");
        let prev = node.value.take().expect("value is being updated");
        drop(nodes);

        // The predicate is user code; the guard gives the node its value and
        // predicate back when the predicate panics, and on the equal path.
        let mut guard = WriteGuard {
            scope,
            id: self.0.id,
            prev: Some(prev),
            equals: Some(equals),
        };
        let next: Box<dyn Any> = Box::new(new);
        let equal = (guard.equals.as_mut().unwrap())(guard.prev.as_deref().unwrap(), &*next);
        if equal {
            return; // the guard restores the old value and the predicate
        }

        let equals = guard.equals.take().unwrap();
        guard.prev = None; // discard the old value
        let mut nodes = scope.nodes.borrow_mut();
        let node = &mut nodes[self.0.id];
        node.equals = Some(equals);
        scope.clock.set(scope.clock.get() + 1);
        node.version = scope.clock.get();
        node.value = Some(next);
        // Writing a derivation overrides its cache until an upstream change
        // next makes it recompute.
        if node.kind == NodeKind::Derived {
            node.overridden = true;
        }
        drop(nodes);
        scope.schedule(self.0.id);
    }

    /// Set a new value computed from the current one. The updater reads the
    /// current value untracked; the write itself behaves like
    /// [`Signal::set`].
    ///
    /// # Example
    /// ```rust
    /// # use ripple_reactive::*;
    /// # let _ = create_scope(|| {
    /// let state = create_signal(13);
    /// state.set_fn(|n| n + 1);
    /// assert_eq!(state.get(), 14);
    /// # });
    /// ```
    #[cfg_attr(debug_assertions, track_caller)]
    pub fn set_fn(self, f: impl FnOnce(&T) -> T) {
        let next = self.with_untracked(|value| f(value));
        self.set(next);
    }
}

/// Gives a written node its value and equality predicate back when they are
/// not consumed by the write, in particular when the predicate panics.
struct WriteGuard {
    scope: &'static Scope,
    id: NodeId,
    prev: Option<Box<dyn Any>>,
    equals: Option<EqualsFn>,
}

impl Drop for WriteGuard {
    fn drop(&mut self) {
        if self.prev.is_none() && self.equals.is_none() {
            return;
        }
        let mut nodes = self.scope.nodes.borrow_mut();
        let node = &mut nodes[self.id];
        if let Some(prev) = self.prev.take() {
            node.value = Some(prev);
        }
        if let Some(equals) = self.equals.take() {
            node.equals = Some(equals);
        }
    }
}

/// We manually implement `Clone` + `Copy` for `Signal` so that we don't get
/// extra bounds on `T`.
impl<T> Clone for ReadSignal<T> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<T> Copy for ReadSignal<T> {}

impl<T> Clone for Signal<T> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<T> Copy for Signal<T> {}

impl<T> Deref for Signal<T> {
    type Target = ReadSignal<T>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

// Formatting implementations for `ReadSignal` and `Signal`.
impl<T: fmt::Debug> fmt::Debug for ReadSignal<T> {
    #[cfg_attr(debug_assertions, track_caller)]
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        self.with(|value| value.fmt(f))
    }
}
impl<T: fmt::Debug> fmt::Debug for Signal<T> {
    #[cfg_attr(debug_assertions, track_caller)]
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        self.with(|value| value.fmt(f))
    }
}

impl<T: fmt::Display> fmt::Display for ReadSignal<T> {
    #[cfg_attr(debug_assertions, track_caller)]
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        self.with(|value| value.fmt(f))
    }
}
impl<T: fmt::Display> fmt::Display for Signal<T> {
    #[cfg_attr(debug_assertions, track_caller)]
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        self.with(|value| value.fmt(f))
    }
}

// Serde implementations for `ReadSignal` and `Signal`.
#[cfg(feature = "serde")]
impl<T: serde::Serialize> serde::Serialize for ReadSignal<T> {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.with(|value| value.serialize(serializer))
    }
}
#[cfg(feature = "serde")]
impl<'de, T: serde::Deserialize<'de> + PartialEq> serde::Deserialize<'de> for ReadSignal<T> {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(*create_signal(T::deserialize(deserializer)?))
    }
}
#[cfg(feature = "serde")]
impl<T: serde::Serialize> serde::Serialize for Signal<T> {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.with(|value| value.serialize(serializer))
    }
}
#[cfg(feature = "serde")]
impl<'de, T: serde::Deserialize<'de> + PartialEq> serde::Deserialize<'de> for Signal<T> {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(create_signal(T::deserialize(deserializer)?))
    }
}
