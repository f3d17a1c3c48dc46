//! Cascade: a concurrent runtime for Petri nets.
//!
//! A net is a directed graph of [`Action`]s (places) connected by
//! [`Transition`]s (edges). Each action carries a token counter and an
//! optional user handler; each transition carries a user predicate evaluated
//! against the result of its source action. Running a [`Net`] drives the
//! graph with a growable worker pool so that independent actions execute in
//! parallel, while a manager thread preserves the firing semantics: tokens
//! accumulate at an action until its threshold is met, at which point the
//! threshold is deducted and the action is activated.
//!
//! The [`debug`] module couples a running net to an external debugger UI
//! over a framed TCP protocol with pause, resume, breakpoints, and live
//! active-state reporting.

pub mod action;
pub mod debug;
pub mod net;
pub mod observer;
pub mod transition;

mod runner;

pub use action::{Action, ActionHandler, ActionId, ActionResult};
pub use net::Net;
pub use observer::NetObserver;
pub use transition::{DEFAULT_EVALUATION_DELAY, Transition, TransitionId, TransitionPredicate};

pub(crate) type HashMap<K, V> = rustc_hash::FxHashMap<K, V>;
pub(crate) type HashSet<T> = rustc_hash::FxHashSet<T>;
pub(crate) type IndexMap<K, V> = indexmap::IndexMap<K, V, rustc_hash::FxBuildHasher>;
pub(crate) type IndexSet<T> = indexmap::IndexSet<T, rustc_hash::FxBuildHasher>;
