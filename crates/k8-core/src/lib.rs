//! K8 Core -- declarative component composition with a transactional round
//! scheduler.
//!
//! Component types are described by metadata: names, factories, hosted
//! children, bus terminals and signals, and interconnects between them.
//! The runtime turns that metadata into a tree of live components wired
//! through shared bit storage, then steps the tree forward one round at a
//! time, settling signal dependencies with commit / rollback / delay
//! semantics.
//!
//! # Round Pipeline
//!
//! Each call to [`runtime::Runtime::step`] runs one round:
//!
//! 1. **Collect** -- Apply queued stimulus to the round overlay and pick the
//!    handlers whose terminals changed, that were never evaluated, or that
//!    were woken.
//! 2. **Evaluate** -- Hand each handler a [`transaction::Transaction`] in
//!    graph preorder. Commits are visible to later handlers, rollbacks are
//!    dropped, delays are retried after everyone else.
//! 3. **Decide** -- If a handler exhausts its attempts the whole round is
//!    discarded and [`scheduler::RoundError::NonConvergence`] is returned.
//! 4. **Apply** -- Write the overlay into committed storage.
//! 5. **Settle** -- Clear latched signals whose reset reads high, then fire
//!    Mirror links.
//! 6. **Bookkeeping** -- Record changed nets for the next round and advance
//!    the round id.
//!
//! # Loading
//!
//! ```rust,ignore
//! let mut rt = Runtime::new(Arc::new(catalog), SchedulerConfig::default());
//! let board = rt.load_root("board")?;
//! let cpu = rt.graph().resolve_path("~/cpu").unwrap();
//! ```
//!
//! Loading stages the whole subtree before attaching anything; a failure
//! anywhere in it leaves the runtime unchanged.
//!
//! # Key Types
//!
//! - [`catalog::Catalog`] -- Immutable table of component types (frozen at
//!   startup).
//! - [`metadata::ComponentMeta`] -- Declarative description of one type.
//! - [`graph::ComponentGraph`] -- Single-rooted tree with cached paths.
//! - [`terminal::TerminalBank`] -- Terminals and their shared bit storage.
//! - [`link::Linker`] -- Bridge, Mirror and Copy interconnects.
//! - [`scheduler::Scheduler`] -- The round protocol.
//! - [`runtime::Runtime`] -- Facade tying everything together.

pub mod bus;
pub mod catalog;
pub mod component;
#[cfg(feature = "data-loader")]
pub mod data_loader;
pub mod dirty;
pub mod graph;
pub mod id;
pub mod link;
pub mod loader;
pub mod metadata;
pub mod registry;
pub mod round;
pub mod runtime;
pub mod scheduler;
pub mod terminal;
pub mod transaction;
pub mod validation;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
