//! Derivations (eagerly cached computations over other nodes).

use std::any::Any;
use std::fmt;
use std::fmt::Formatter;
use std::ops::Deref;

use crate::node::NodeKind;
use crate::scope::Scope;
use crate::signal::{create_empty_signal, Signal};

/// A cached value computed from other nodes.
///
/// A `Derived` reads like a [`ReadSignal`](crate::ReadSignal): the cache is
/// returned without re-running the computation. It also writes like a
/// [`Signal`]: a write *overrides* the cache, and the override holds until a
/// dependency next changes, at which point the computation runs again.
pub struct Derived<T: 'static>(pub(crate) Signal<T>);

/// Creates a derivation from some reactive inputs, using the output type's
/// [`PartialEq`] implementation to decide whether a recompute produced a
/// change.
///
/// The computation runs once, immediately, to establish the initial value
/// and dependency set. It runs again only when one of the inputs it actually
/// read reports a change; if the new output is equal to the cached one,
/// nothing downstream re-runs.
///
/// # Example
/// ```
/// # use ripple_reactive::*;
/// # let _ = create_scope(|| {
/// let state = create_signal(0);
/// let double = create_derived(move || state.get() * 2);
///
/// assert_eq!(double.get(), 0);
/// state.set(1);
/// assert_eq!(double.get(), 2);
/// # });
/// ```
#[cfg_attr(debug_assertions, track_caller)]
pub fn create_derived<T: PartialEq>(compute: impl FnMut() -> T + 'static) -> Derived<T> {
    create_derived_with(compute, T::eq)
}

/// Creates a derivation with a custom equality predicate.
///
/// The predicate compares `(prev, next)` after every recompute and on every
/// override write; returning `true` prunes all downstream work. To use the
/// output type's [`PartialEq`] instead, use [`create_derived`].
#[cfg_attr(debug_assertions, track_caller)]
pub fn create_derived_with<T>(
    mut compute: impl FnMut() -> T + 'static,
    mut equals: impl FnMut(&T, &T) -> bool + 'static,
) -> Derived<T> {
    let scope = Scope::global();
    let signal = create_empty_signal::<T>(NodeKind::Derived);
    let id = signal.0.id;

    let (initial, tracker) = scope.tracked_scope(id, || compute());
    tracker.create_dependency_link(scope, id);

    let mut node = signal.get_mut();
    node.value = Some(Box::new(initial));
    node.compute = Some(Box::new(move || Box::new(compute()) as Box<dyn Any>));
    node.equals = Some(Box::new(move |prev: &dyn Any, next: &dyn Any| {
        equals(
            prev.downcast_ref().expect("wrong value type"),
            next.downcast_ref().expect("wrong value type"),
        )
    }));
    node.checked = scope.clock.get();
    drop(node);

    Derived(signal)
}

/// We manually implement `Clone` + `Copy` for `Derived` so that we don't get
/// extra bounds on `T`.
impl<T> Clone for Derived<T> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<T> Copy for Derived<T> {}

impl<T> Deref for Derived<T> {
    type Target = Signal<T>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<T: fmt::Debug> fmt::Debug for Derived<T> {
    #[cfg_attr(debug_assertions, track_caller)]
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        self.with(|value| value.fmt(f))
    }
}

impl<T: fmt::Display> fmt::Display for Derived<T> {
    #[cfg_attr(debug_assertions, track_caller)]
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        self.with(|value| value.fmt(f))
    }
}

// A derivation cannot be deserialized because it has no compute callback to
// go with the value, so only `Serialize` is provided.
#[cfg(feature = "serde")]
impl<T: serde::Serialize> serde::Serialize for Derived<T> {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.with(|value| value.serialize(serializer))
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;
    use std::rc::Rc;

    use crate::*;

    #[test]
    fn derived() {
        let _ = create_scope(|| {
            let state = create_signal(0);
            let double = create_derived(move || state.get() * 2);

            assert_eq!(double.get(), 0);
            state.set(1);
            assert_eq!(double.get(), 2);
            state.set(2);
            assert_eq!(double.get(), 4);
        });
    }

    /// Make sure the value is cached rather than recomputed on demand.
    #[test]
    fn derived_computes_once_per_change() {
        let _ = create_scope(|| {
            let state = create_signal(0);
            let evals = Rc::new(Cell::new(0));
            let double = create_derived({
                let evals = Rc::clone(&evals);
                move || {
                    evals.set(evals.get() + 1);
                    state.get() * 2
                }
            });

            assert_eq!(evals.get(), 1); // once for the initial value

            state.set(2);
            assert_eq!(evals.get(), 2);
            assert_eq!(double.get(), 4);
            assert_eq!(evals.get(), 2); // still 2 after the read
        });
    }

    #[test]
    fn dependency_on_derived() {
        let _ = create_scope(|| {
            let state = create_signal(0);
            let double = create_derived(move || state.get() * 2);
            let quadruple = create_derived(move || double.get() * 2);

            assert_eq!(quadruple.get(), 0);
            state.set(1);
            assert_eq!(quadruple.get(), 4);
        });
    }

    #[test]
    fn diamond_updates_each_node_once() {
        let _ = create_scope(|| {
            let name = create_signal("John Doe".to_string());
            let first =
                create_derived(move || name.with(|n| n.split(' ').next().unwrap().to_string()));
            let last =
                create_derived(move || name.with(|n| n.split(' ').nth(1).unwrap().to_string()));
            let joins = Rc::new(Cell::new(0));
            let full = create_derived({
                let joins = Rc::clone(&joins);
                move || {
                    joins.set(joins.get() + 1);
                    format!("{}/{}", first.get_clone(), last.get_clone())
                }
            });

            assert_eq!(full.get_clone(), "John/Doe");
            assert_eq!(joins.get(), 1);

            name.set("Bob Fisher".to_string());
            assert_eq!(full.get_clone(), "Bob/Fisher");
            assert_eq!(joins.get(), 2);
        });
    }

    #[test]
    fn unchanged_derived_prunes_downstream() {
        let _ = create_scope(|| {
            let state = create_signal(1);
            let parity = create_derived(move || state.get() % 2);
            let evals = Rc::new(Cell::new(0));
            let label = create_derived({
                let evals = Rc::clone(&evals);
                move || {
                    evals.set(evals.get() + 1);
                    if parity.get() == 0 { "even" } else { "odd" }
                }
            });

            assert_eq!(label.get(), "odd");
            assert_eq!(evals.get(), 1);

            // Parity recomputes but its output is unchanged.
            state.set(3);
            assert_eq!(label.get(), "odd");
            assert_eq!(evals.get(), 1);

            state.set(2);
            assert_eq!(label.get(), "even");
            assert_eq!(evals.get(), 2);
        });
    }

    #[test]
    fn writable_derived_override_and_rejoin() {
        let _ = create_scope(|| {
            let a = create_signal(13);
            let b = create_derived(move || a.get() * 2);
            let seen = Rc::new(std::cell::RefCell::new(Vec::new()));
            create_watcher({
                let seen = Rc::clone(&seen);
                move || seen.borrow_mut().push(b.get())
            });
            assert_eq!(b.get(), 26);
            assert_eq!(*seen.borrow(), [26]);

            b.set(100);
            assert_eq!(b.get(), 100);
            assert_eq!(*seen.borrow(), [26, 100]);

            // An upstream change clears the override.
            a.set(26);
            assert_eq!(b.get(), 52);
            assert_eq!(*seen.borrow(), [26, 100, 52]);
        });
    }

    #[test]
    fn override_reruns_readers_but_not_siblings() {
        let _ = create_scope(|| {
            let a = create_signal(0);
            let b = create_derived(move || a.get());
            let sibling_evals = Rc::new(Cell::new(0));
            let sibling = create_derived({
                let evals = Rc::clone(&sibling_evals);
                move || {
                    evals.set(evals.get() + 1);
                    a.get()
                }
            });
            let reader_evals = Rc::new(Cell::new(0));
            let reader = create_derived({
                let evals = Rc::clone(&reader_evals);
                move || {
                    evals.set(evals.get() + 1);
                    b.get()
                }
            });
            assert_eq!(sibling_evals.get(), 1);
            assert_eq!(reader_evals.get(), 1);

            b.set(123);
            assert_eq!(sibling_evals.get(), 1);
            assert_eq!(reader_evals.get(), 2);
            assert_eq!(reader.get(), 123);

            a.set(124);
            assert_eq!(sibling_evals.get(), 2);
            assert_eq!(reader_evals.get(), 3);
            assert_eq!(sibling.get(), 124);
            assert_eq!(reader.get(), 124);
        });
    }

    #[test]
    fn derived_recreates_dependencies_each_time() {
        let _ = create_scope(|| {
            let condition = create_signal(true);
            let state1 = create_signal(0);
            let state2 = create_signal(10);

            let evals = Rc::new(Cell::new(0));
            let _switch = create_derived({
                let evals = Rc::clone(&evals);
                move || {
                    evals.set(evals.get() + 1);
                    if condition.get() {
                        state1.track();
                    } else {
                        state2.track();
                    }
                }
            });

            assert_eq!(evals.get(), 1);

            state1.set(1);
            assert_eq!(evals.get(), 2);

            state2.set(11);
            assert_eq!(evals.get(), 2); // not tracked

            condition.set(false);
            assert_eq!(evals.get(), 3);

            state1.set(2);
            assert_eq!(evals.get(), 3); // not tracked

            state2.set(12);
            assert_eq!(evals.get(), 4); // tracked after condition flipped
        });
    }

    #[test]
    fn derived_with_custom_equality() {
        let _ = create_scope(|| {
            let state = create_signal(1);
            // Compare by absolute value.
            let magnitude =
                create_derived_with(move || state.get(), |a: &i32, b: &i32| a.abs() == b.abs());
            let evals = Rc::new(Cell::new(0));
            let _downstream = create_derived({
                let evals = Rc::clone(&evals);
                move || {
                    evals.set(evals.get() + 1);
                    magnitude.get()
                }
            });
            assert_eq!(evals.get(), 1);

            state.set(-1);
            assert_eq!(evals.get(), 1); // |-1| == |1|

            state.set(2);
            assert_eq!(evals.get(), 2);
        });
    }
}
