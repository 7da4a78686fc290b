//! A few handy utilities.

use crate::{Derived, ReadSignal, Signal};

/// An explicit dependency list for [`on`]: a handle, or a tuple of handles
/// (up to six), that can be tracked as a unit.
pub trait Dependencies {
    /// Track every handle in the list.
    fn track_deps(&self);
}

impl<T> Dependencies for Signal<T> {
    fn track_deps(&self) {
        self.track();
    }
}

impl<T> Dependencies for ReadSignal<T> {
    fn track_deps(&self) {
        self.track();
    }
}

impl<T> Dependencies for Derived<T> {
    fn track_deps(&self) {
        self.track();
    }
}

macro_rules! impl_dependencies_for_tuple {
    ($($T:tt),*) => {
        paste::paste! {
            impl<$($T,)*> Dependencies for ($($T,)*)
            where
                $($T: Dependencies,)*
            {
                fn track_deps(&self) {
                    let ($([<$T:lower>],)*) = self;
                    $(
                        [<$T:lower>].track_deps();
                    )*
                }
            }
        }
    }
}

impl_dependencies_for_tuple!(A);
impl_dependencies_for_tuple!(A, B);
impl_dependencies_for_tuple!(A, B, C);
impl_dependencies_for_tuple!(A, B, C, D);
impl_dependencies_for_tuple!(A, B, C, D, E);
impl_dependencies_for_tuple!(A, B, C, D, E, F);

/// A helper function for making dependencies explicit.
///
/// The returned closure tracks `deps` and runs `f` with tracking suspended,
/// so `f` re-runs exactly when one of `deps` changes, whatever it reads.
///
/// # Params
/// * `deps` - A list of signals/derivations that are tracked. This can be a
///   single handle or a tuple of handles.
/// * `f` - The callback function.
///
/// # Example
/// ```
/// # use ripple_reactive::*;
/// # let _ = create_scope(|| {
/// let state = create_signal(0);
///
/// create_watcher(on(state, move || {
///     println!("State changed. New state value = {}", state.get_untracked());
/// }));
/// // Prints "State changed. New state value = 0"
///
/// state.set(1);
/// // Prints "State changed. New state value = 1"
/// # });
/// ```
pub fn on<T>(
    deps: impl Dependencies + 'static,
    mut f: impl FnMut() -> T + 'static,
) -> impl FnMut() -> T + 'static {
    move || {
        deps.track_deps();
        crate::untrack(|| f())
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;
    use std::rc::Rc;

    use crate::*;

    #[test]
    fn on_tracks_only_the_explicit_deps() {
        let _ = create_scope(|| {
            let tracked = create_signal(0);
            let untracked = create_signal(0);
            let runs = Rc::new(Cell::new(0));
            create_watcher(on(tracked, {
                let runs = Rc::clone(&runs);
                move || {
                    // Read, but not a dependency.
                    let _ = untracked.get();
                    runs.set(runs.get() + 1);
                }
            }));
            assert_eq!(runs.get(), 1);

            untracked.set(1);
            assert_eq!(runs.get(), 1);

            tracked.set(1);
            assert_eq!(runs.get(), 2);
        });
    }

    #[test]
    fn on_accepts_tuples() {
        let _ = create_scope(|| {
            let a = create_signal(0);
            let b = create_derived(move || a.get() + 1);
            let c = create_signal(0);
            let runs = Rc::new(Cell::new(0));
            create_watcher(on((a, b, c), {
                let runs = Rc::clone(&runs);
                move || runs.set(runs.get() + 1)
            }));
            assert_eq!(runs.get(), 1);

            a.set(1);
            assert_eq!(runs.get(), 2);

            c.set(1);
            assert_eq!(runs.get(), 3);
        });
    }
}
