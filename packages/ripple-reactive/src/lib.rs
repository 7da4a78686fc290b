//! Fine-grained reactive state primitives for Ripple.
//!
//! A [scope](create_scope) owns a graph of three kinds of nodes:
//! [signals](create_signal) hold externally written values,
//! [derivations](create_derived) cache computations over other nodes, and
//! [watchers](create_watcher) run side effects. Dependencies are discovered
//! by observing which nodes are read during evaluation, and a write
//! propagates through the graph glitch-free: every dependent runs at most
//! once per update and never sees a half-updated combination of its inputs.
//!
//! ```rust
//! use ripple_reactive::*;
//!
//! let scope = create_scope(|| {
//!     let count = create_signal(0);
//!     let parity = create_derived(move || if count.get() % 2 == 0 { "even" } else { "odd" });
//!     create_watcher(move || println!("count is {}", parity.get()));
//!     // Prints "count is even"
//!
//!     count.set(1); // Prints "count is odd"
//!     count.set(3); // Parity is unchanged, so the watcher does not re-run.
//! });
//! scope.dispose();
//! ```

#![warn(missing_docs)]

mod derived;
mod node;
mod scope;
mod signal;
mod utils;
mod watcher;

pub use derived::*;
pub use node::CleanupFn;
pub use scope::{create_scope, on_cleanup, untrack, ScopeHandle};
pub use signal::*;
pub use utils::*;
pub use watcher::*;
