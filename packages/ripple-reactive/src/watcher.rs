//! Watchers (imperative observers with side effects).

use crate::node::{CleanupFn, NodeKind};
use crate::scope::Scope;

/// Creates a watcher over the reactive values read inside the closure.
///
/// The closure runs once immediately. Afterwards it re-runs whenever one of
/// the values it read emits a change that survives its equality predicate —
/// at most once per update, however many of its inputs changed.
///
/// # Example
/// ```
/// # use ripple_reactive::*;
/// # let _ = create_scope(|| {
/// let state = create_signal(0);
///
/// create_watcher(move || {
///     println!("new state = {}", state.get());
/// });
/// // Prints "new state = 0"
///
/// state.set(1);
/// // Prints "new state = 1"
/// # });
/// ```
///
/// `create_watcher` should only be used for side effects. State that is
/// *computed* from other state belongs in a
/// [`create_derived`](crate::create_derived) instead.
#[cfg_attr(debug_assertions, track_caller)]
pub fn create_watcher(mut f: impl FnMut() + 'static) {
    create_watcher_with_cleanup(move || {
        f();
        None
    });
}

/// Creates a watcher that can return a cleanup callback.
///
/// The returned cleanup runs exactly once: before the watcher's next run, or
/// at scope disposal, whichever comes first. Cleanups run outside any
/// tracking frame, so reads inside them establish no dependencies.
///
/// [`on_cleanup`](crate::on_cleanup) registers the same kind of callback
/// from anywhere inside the watcher body.
///
/// # Example
/// ```
/// # use ripple_reactive::*;
/// # let _ = create_scope(|| {
/// let connected = create_signal(true);
/// create_watcher_with_cleanup(move || {
///     if connected.get() {
///         println!("opening connection");
///         Some(Box::new(|| println!("closing connection")) as CleanupFn)
///     } else {
///         None
///     }
/// });
/// connected.set(false); // Prints "closing connection"
/// # });
/// ```
#[cfg_attr(debug_assertions, track_caller)]
pub fn create_watcher_with_cleanup(f: impl FnMut() -> Option<CleanupFn> + 'static) {
    let scope = Scope::global();
    let id = scope.insert_node(NodeKind::Watcher);
    scope.nodes.borrow_mut()[id].run = Some(Box::new(f));
    scope.evaluate_watcher(id);
}
