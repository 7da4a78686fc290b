//! Scopes and the update scheduler.

use std::cell::{Cell, RefCell};
use std::mem;

use slotmap::{Key, SlotMap};
use smallvec::SmallVec;

use crate::node::{NodeId, NodeKind, ReactiveNode};

/// Upper bound on mark-and-propagate passes within a single digest. A digest
/// that keeps producing new roots past this point is not converging.
const MAX_PASSES: usize = 100;

/// The struct managing the state of a reactive graph. One per scope.
///
/// This is intended to be leaked to be able to get a `&'static Scope`. The
/// `Scope` is also `dispose`-able, meaning that any resources allocated in it
/// will get deallocated; only the `Scope` struct itself stays behind, and it
/// is expected to live for the whole duration of the program.
pub(crate) struct Scope {
    /// If this is `Some`, we are tracking reads into it.
    pub tracker: RefCell<Option<DependencyTracker>>,
    /// The node that is currently being evaluated, or the "null" key.
    pub current: Cell<NodeId>,
    /// All the nodes created in this `Scope`.
    pub nodes: RefCell<SlotMap<NodeId, ReactiveNode>>,
    /// Monotonic clock, bumped on every accepted value change. Node
    /// `version`/`checked` stamps are values of this clock.
    pub clock: Cell<u64>,
    /// Generation counter for the mark phase, bumped once per pass.
    pub generation: Cell<u64>,
    /// Creation rank handed to the next node.
    pub next_rank: Cell<u32>,
    /// Roots written during the current digest, drained as the next pass.
    pub pending: RefCell<Vec<NodeId>>,
    /// Whether a digest is currently draining.
    pub digesting: Cell<bool>,
    /// Set once the scope has been disposed.
    pub disposed: Cell<bool>,
    /// A temporary buffer used by the propagation phase to prevent
    /// allocating a new Vec on every pass.
    pub schedule_buf: RefCell<Vec<NodeId>>,
}

thread_local! {
    /// The current reactive scope.
    static GLOBAL_SCOPE: Cell<Option<&'static Scope>> = const { Cell::new(None) };
}

impl Scope {
    /// Get the current reactive scope. Panics if no scope is installed.
    #[cfg_attr(debug_assertions, track_caller)]
    pub fn global() -> &'static Scope {
        GLOBAL_SCOPE.with(|scope| scope.get()).expect("no current scope found")
    }

    /// Sets the current reactive scope. Returns the previous one.
    pub fn set_global(scope: Option<&'static Scope>) -> Option<&'static Scope> {
        GLOBAL_SCOPE.with(|s| s.replace(scope))
    }

    /// Create a new scope. The scope is leaked and so lives until the end of
    /// the program.
    pub fn new_static() -> &'static Self {
        let this = Self {
            tracker: RefCell::new(None),
            current: Cell::new(NodeId::null()),
            nodes: RefCell::new(SlotMap::default()),
            clock: Cell::new(0),
            generation: Cell::new(0),
            next_rank: Cell::new(0),
            pending: RefCell::new(Vec::new()),
            digesting: Cell::new(false),
            disposed: Cell::new(false),
            schedule_buf: RefCell::new(Vec::new()),
        };
        Box::leak(Box::new(this))
    }

    /// Insert a fresh node and assign it the next creation rank.
    pub fn insert_node(&self, kind: NodeKind) -> NodeId {
        let rank = self.next_rank.get();
        self.next_rank.set(rank + 1);
        self.nodes.borrow_mut().insert(ReactiveNode::new(kind, rank))
    }

    /// Run `f` with `node` installed as the currently evaluating node,
    /// recording every tracked read into a fresh [`DependencyTracker`].
    pub fn tracked_scope<T>(&self, node: NodeId, f: impl FnOnce() -> T) -> (T, DependencyTracker) {
        /// Restores the current-node cell even when the evaluation panics, so
        /// later cleanups cannot attach to the dead frame.
        struct CurrentGuard<'a> {
            scope: &'a Scope,
            prev: NodeId,
        }
        impl Drop for CurrentGuard<'_> {
            fn drop(&mut self) {
                self.scope.current.set(self.prev);
            }
        }

        let prev_tracker = self.tracker.replace(Some(DependencyTracker::default()));
        let guard = CurrentGuard {
            scope: self,
            prev: self.current.replace(node),
        };
        let ret = f();
        drop(guard);
        (ret, self.tracker.replace(prev_tracker).unwrap())
    }

    /// Whether some dependency of `id` accepted a change after `id` was last
    /// evaluated. Distinguishes "an upstream might have changed" (the dirty
    /// mark) from "an upstream did change".
    fn inputs_changed(&self, id: NodeId) -> bool {
        let nodes = self.nodes.borrow();
        let node = &nodes[id];
        node.dependencies.iter().any(|&dep| nodes[dep].version > node.checked)
    }

    /// Unlink `id` from the dependents list of every node it read during its
    /// last evaluation, clearing its own dependency list.
    fn clear_dependencies(&self, id: NodeId) {
        let dependencies = mem::take(&mut self.nodes.borrow_mut()[id].dependencies);
        let mut nodes = self.nodes.borrow_mut();
        for dependency in dependencies {
            nodes[dependency].dependents.retain(|&dependent| dependent != id);
        }
    }

    /// Run the cleanups registered by the last evaluation of the watcher
    /// `id`, outside of any tracking frame.
    fn run_cleanups(&'static self, id: NodeId) {
        let cleanups = mem::take(&mut self.nodes.borrow_mut()[id].cleanups);
        untrack_in_scope(
            move || {
                for cb in cleanups {
                    cb();
                }
            },
            self,
        );
    }

    /// Re-evaluate the derived node `id`, recreating its dependency links and
    /// bumping its version if the new value survives the equality predicate.
    ///
    /// Skips the recompute entirely (keeping the cache, and any override)
    /// when no dependency actually changed since the last evaluation.
    #[cfg_attr(feature = "trace", tracing::instrument(skip(self)))]
    fn update_derived(&'static self, id: NodeId) {
        if !self.inputs_changed(id) {
            return;
        }

        self.clear_dependencies(id);

        // The callback and value are taken out because evaluating requires
        // access to the rest of the graph.
        let mut nodes_mut = self.nodes.borrow_mut();
        let node = &mut nodes_mut[id];
        node.overridden = false;
        let mut compute = node.compute.take().unwrap();
        let mut equals = node.equals.take().unwrap();
        let prev = node.value.take().unwrap();
        drop(nodes_mut);

        let (new, tracker) = self.tracked_scope(id, || compute());
        tracker.create_dependency_link(self, id);

        let changed = !equals(&*prev, &*new);

        let mut nodes_mut = self.nodes.borrow_mut();
        let node = &mut nodes_mut[id];
        node.compute = Some(compute);
        node.equals = Some(equals);
        if changed {
            self.clock.set(self.clock.get() + 1);
            node.version = self.clock.get();
            node.value = Some(new);
        } else {
            node.value = Some(prev);
        }
        node.checked = self.clock.get();
    }

    /// Evaluate the watcher node `id`: run its cleanups, execute its body
    /// under tracking, relink dependencies, and store a returned cleanup.
    #[cfg_attr(feature = "trace", tracing::instrument(skip(self)))]
    pub fn evaluate_watcher(&'static self, id: NodeId) {
        self.clear_dependencies(id);
        self.run_cleanups(id);

        let mut run = self.nodes.borrow_mut()[id].run.take().unwrap();
        let (cleanup, tracker) = self.tracked_scope(id, || run());
        tracker.create_dependency_link(self, id);

        let mut nodes_mut = self.nodes.borrow_mut();
        let node = &mut nodes_mut[id];
        node.run = Some(run);
        if let Some(cleanup) = cleanup {
            node.cleanups.push(cleanup);
        }
        node.checked = self.clock.get();
    }

    /// Re-run the watcher `id` if one of its dependencies actually changed in
    /// this digest.
    fn update_watcher(&'static self, id: NodeId) {
        if self.inputs_changed(id) {
            self.evaluate_watcher(id);
        }
    }

    /// Transitively mark every dependent reachable from `root` with the
    /// current generation, collecting the marked nodes into `schedule`.
    fn mark_dependents(&self, root: NodeId, schedule: &mut Vec<NodeId>) {
        let generation = self.generation.get();
        let mut stack: SmallVec<[NodeId; 8]> = SmallVec::new();
        stack.push(root);
        let mut nodes = self.nodes.borrow_mut();
        while let Some(id) = stack.pop() {
            // Take the `dependents` field out temporarily to avoid the
            // borrow checker.
            let dependents = mem::take(&mut nodes[id].dependents);
            for &dependent in &dependents {
                let node = &mut nodes[dependent];
                if node.dirty_at != generation {
                    node.dirty_at = generation;
                    schedule.push(dependent);
                    stack.push(dependent);
                }
            }
            nodes[id].dependents = dependents;
        }
    }

    /// One mark-and-propagate pass: mark everything downstream of `roots`,
    /// then process the marked nodes in ascending creation rank, which is a
    /// topological order of the live edges.
    fn run_pass(&'static self, roots: &[NodeId]) {
        self.generation.set(self.generation.get() + 1);

        let mut schedule = self.schedule_buf.take();
        schedule.clear();
        for &root in roots {
            self.mark_dependents(root, &mut schedule);
        }
        {
            let nodes = self.nodes.borrow();
            schedule.sort_unstable_by_key(|&id| nodes[id].rank);
        }
        #[cfg(feature = "trace")]
        tracing::trace!("pass schedule len: {}", schedule.len());

        for &id in &schedule {
            let kind = self.nodes.borrow()[id].kind;
            match kind {
                // Sources never read anything, so they are never dependents.
                NodeKind::Source => unreachable!("source node scheduled"),
                NodeKind::Derived => self.update_derived(id),
                NodeKind::Watcher => self.update_watcher(id),
            }
        }

        *self.schedule_buf.borrow_mut() = schedule;
    }

    /// Drain a full digest triggered by a write to `root`. Writes performed
    /// by watchers during a pass accumulate in `pending` and are drained as
    /// the roots of a subsequent pass, until a pass produces no new roots.
    #[cfg_attr(feature = "trace", tracing::instrument(skip(self)))]
    fn digest(&'static self, root: NodeId) {
        debug_assert!(!self.digesting.get(), "digest started while digesting");
        self.digesting.set(true);
        // The digest itself never records dependencies, even when the
        // triggering write happened inside a tracking frame.
        let guard = DigestGuard {
            scope: self,
            prev_tracker: self.tracker.take(),
            prev_global: Scope::set_global(Some(self)),
        };

        let mut roots = vec![root];
        let mut passes = 0;
        while !roots.is_empty() {
            passes += 1;
            if passes > MAX_PASSES {
                panic!("digest did not settle after {MAX_PASSES} passes");
            }
            self.run_pass(&roots);
            roots = self.pending.take();
        }

        drop(guard);
    }

    /// Call this after `root` has accepted a new value. Starts a digest, or
    /// extends the running one with another root.
    pub fn schedule(&'static self, root: NodeId) {
        if self.disposed.get() {
            return;
        }
        if self.digesting.get() {
            self.pending.borrow_mut().push(root);
        } else {
            self.digest(root);
        }
    }

    /// Dispose of all the resources held by this scope.
    ///
    /// Cleanups run first, in node creation order and outside any tracking
    /// frame, while node values are still readable; the node arena is
    /// dropped afterwards.
    pub fn dispose(&'static self) {
        if self.disposed.replace(true) {
            return;
        }
        let mut order: Vec<(u32, NodeId)> = self
            .nodes
            .borrow()
            .iter()
            .filter(|(_, node)| node.kind == NodeKind::Watcher)
            .map(|(id, node)| (node.rank, id))
            .collect();
        order.sort_unstable_by_key(|&(rank, _)| rank);
        untrack_in_scope(
            || {
                for (_, id) in order {
                    let cleanups = mem::take(&mut self.nodes.borrow_mut()[id].cleanups);
                    for cb in cleanups {
                        cb();
                    }
                }
            },
            self,
        );

        let _ = self.nodes.take();
        let _ = self.pending.take();
        let _ = self.schedule_buf.take();
        let _ = self.tracker.take();
        self.current.set(NodeId::null());
    }
}

/// Restores scheduler state when a digest ends, including by a panic in user
/// code, so that a future write re-enters a clean state.
struct DigestGuard {
    scope: &'static Scope,
    prev_tracker: Option<DependencyTracker>,
    prev_global: Option<&'static Scope>,
}

impl Drop for DigestGuard {
    fn drop(&mut self) {
        self.scope.digesting.set(false);
        self.scope.pending.borrow_mut().clear();
        *self.scope.tracker.borrow_mut() = self.prev_tracker.take();
        Scope::set_global(self.prev_global);
    }
}

/// Tracks nodes that are read inside a tracking frame.
#[derive(Default)]
pub(crate) struct DependencyTracker {
    /// The nodes that were read, each at most once.
    pub dependencies: SmallVec<[NodeId; 1]>,
}

impl DependencyTracker {
    /// Sets the `dependents` field for all the nodes that have been tracked
    /// and replaces the `dependencies` of the dependent.
    pub fn create_dependency_link(self, scope: &Scope, dependent: NodeId) {
        let mut nodes = scope.nodes.borrow_mut();
        for &node in &self.dependencies {
            nodes[node].dependents.push(dependent);
        }
        nodes[dependent].dependencies = self.dependencies;
    }
}

/// A handle to a reactive scope. This lets you run further code inside the
/// scope or dispose it for resource cleanup.
///
/// This is obtained from [`create_scope`].
#[derive(Clone, Copy)]
pub struct ScopeHandle {
    _ref: &'static Scope,
}

impl ScopeHandle {
    /// Destroy everything that was created in this scope.
    ///
    /// Every cleanup stored on a watcher runs exactly once, in watcher
    /// creation order. Reading a handle of this scope afterwards panics.
    ///
    /// # Panics
    ///
    /// Panics if called from inside a watcher of the same scope, since the
    /// running digest still holds the node arena.
    pub fn dispose(self) {
        self._ref.dispose();
    }

    /// Runs the closure with this scope installed as the current one, so
    /// that new nodes can be created outside the [`create_scope`] closure.
    pub fn run_in<T>(&self, f: impl FnOnce() -> T) -> T {
        let prev = Scope::set_global(Some(self._ref));
        let ret = f();
        Scope::set_global(prev);
        ret
    }
}

/// Creates a new reactive scope and runs the closure inside it. The returned
/// [`ScopeHandle`] can be used to [`dispose`](ScopeHandle::dispose) the scope.
///
/// # Example
/// ```rust
/// # use ripple_reactive::*;
/// let scope = create_scope(|| {
///     let greeting = create_signal("Hello".to_string());
///     create_watcher(move || println!("{}", greeting.get_clone()));
/// });
/// scope.dispose();
/// ```
#[must_use = "scope should be disposed"]
pub fn create_scope(f: impl FnOnce()) -> ScopeHandle {
    let _ref = Scope::new_static();
    {
        /// An unsafe wrapper around a raw pointer which we promise to never
        /// touch, effectively making it thread-safe.
        #[allow(dead_code)]
        struct UnsafeSendPtr<T>(*const T);
        /// We never ever touch the pointer inside so surely this is safe!
        unsafe impl<T> Send for UnsafeSendPtr<T> {}

        /// A static variable to keep on holding to the allocated `Scope`s to
        /// prevent Miri and Valgrind from complaining.
        static KEEP_ALIVE: std::sync::Mutex<Vec<UnsafeSendPtr<Scope>>> =
            std::sync::Mutex::new(Vec::new());
        KEEP_ALIVE
            .lock()
            .unwrap()
            .push(UnsafeSendPtr(_ref as *const Scope));
    }

    let prev = Scope::set_global(Some(_ref));
    f();
    Scope::set_global(prev);
    ScopeHandle { _ref }
}

/// Adds a callback that is called before the next run of the watcher
/// currently being evaluated, and at scope disposal — whichever comes first.
/// Each registered callback runs exactly once, outside any tracking frame.
///
/// Cleanups belong to watchers: the call does nothing when no node is being
/// evaluated or when the evaluating node is a derivation.
///
/// # Example
/// ```rust
/// # use ripple_reactive::*;
/// # let _ = create_scope(|| {
/// let generation = create_signal(0);
/// create_watcher(move || {
///     generation.track();
///     on_cleanup(|| println!("tearing down the previous run"));
/// });
/// generation.set(1); // Prints "tearing down the previous run"
/// # });
/// ```
pub fn on_cleanup(f: impl FnOnce() + 'static) {
    let scope = Scope::global();
    let current = scope.current.get();
    if current.is_null() {
        return;
    }
    let mut nodes = scope.nodes.borrow_mut();
    let node = &mut nodes[current];
    if node.kind == NodeKind::Watcher {
        node.cleanups.push(Box::new(f));
    }
}

/// Run the passed closure inside an untracked scope.
///
/// See also [`ReadSignal::get_untracked`](crate::ReadSignal::get_untracked).
///
/// # Example
///
/// ```
/// # use ripple_reactive::*;
/// # let _ = create_scope(|| {
/// let state = create_signal(1);
/// let double = create_derived(move || untrack(|| state.get() * 2));
/// assert_eq!(double.get(), 2);
///
/// state.set(2);
/// // double still has its old value because state was read untracked.
/// assert_eq!(double.get(), 2);
/// # });
/// ```
pub fn untrack<T>(f: impl FnOnce() -> T) -> T {
    untrack_in_scope(f, Scope::global())
}

/// Same as [`untrack`] but for a specific [`Scope`].
pub(crate) fn untrack_in_scope<T>(f: impl FnOnce() -> T, scope: &'static Scope) -> T {
    let prev = scope.tracker.replace(None);
    let ret = f();
    scope.tracker.replace(prev);
    ret
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use crate::*;

    #[test]
    fn dispose_runs_cleanups_in_creation_order() {
        let order = Rc::new(RefCell::new(Vec::new()));
        let scope = create_scope(|| {
            let first = Rc::clone(&order);
            create_watcher_with_cleanup(move || {
                let first = Rc::clone(&first);
                Some(Box::new(move || first.borrow_mut().push("first")) as CleanupFn)
            });
            let second = Rc::clone(&order);
            create_watcher_with_cleanup(move || {
                let second = Rc::clone(&second);
                Some(Box::new(move || second.borrow_mut().push("second")) as CleanupFn)
            });
        });
        assert!(order.borrow().is_empty());
        scope.dispose();
        assert_eq!(*order.borrow(), ["first", "second"]);
    }

    #[test]
    fn dispose_invalidates_handles() {
        let mut handle = None;
        let scope = create_scope(|| {
            handle = Some(create_signal(123));
        });
        let handle = handle.unwrap();
        assert!(handle.is_alive());
        assert_eq!(handle.get(), 123);
        scope.dispose();
        assert!(!handle.is_alive());
    }

    #[test]
    fn dispose_stops_watchers() {
        let mut trigger = None;
        let runs = Rc::new(RefCell::new(0));
        let scope = create_scope(|| {
            let t = create_signal(0);
            trigger = Some(t);
            let runs = Rc::clone(&runs);
            create_watcher(move || {
                t.track();
                *runs.borrow_mut() += 1;
            });
        });
        let trigger = trigger.unwrap();
        assert_eq!(*runs.borrow(), 1);
        trigger.set(1);
        assert_eq!(*runs.borrow(), 2);
        scope.dispose();
    }

    #[test]
    #[should_panic(expected = "disposed")]
    fn write_after_dispose_panics() {
        let mut handle = None;
        let scope = create_scope(|| {
            handle = Some(create_signal(0));
        });
        scope.dispose();
        handle.unwrap().set(1);
    }

    #[test]
    fn run_in_creates_nodes_after_the_scope_closure() {
        let scope = create_scope(|| {});
        let (state, double) = scope.run_in(|| {
            let state = create_signal(1);
            let double = create_derived(move || state.get() * 2);
            (state, double)
        });
        assert_eq!(double.get(), 2);
        state.set(3);
        assert_eq!(double.get(), 6);
    }

    #[test]
    fn untrack_suppresses_dependencies() {
        let _ = create_scope(|| {
            let state = create_signal(1);
            let double = create_derived(move || untrack(|| state.get() * 2));
            assert_eq!(double.get(), 2);

            state.set(2);
            assert_eq!(double.get(), 2);
        });
    }

    #[test]
    fn cleanup_outside_any_node_is_ignored() {
        let _ = create_scope(|| {
            on_cleanup(|| panic!("should never run"));
        });
    }

    #[test]
    fn cleanup_inside_derived_compute_is_ignored() {
        let scope = create_scope(|| {
            let state = create_signal(0);
            let doubled = create_derived(move || {
                on_cleanup(|| panic!("should never run"));
                state.get() * 2
            });
            state.set(1);
            assert_eq!(doubled.get(), 2);
        });
        scope.dispose();
    }
}
