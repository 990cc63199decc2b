// ===================================================================================================
// yangstore - YANG-Modeled Configuration Datastore Engine
// ===================================================================================================
//
// This library implements the core of a YANG-modeled configuration datastore:
// it tracks installed modules and their inter-module dependencies in shared
// memory, mediates concurrent access from many connections and sessions,
// applies edits with diff computation and cross-module validation, composes
// operational data from running configuration, stored overlays, and live
// provider callouts, and routes change/operational/RPC/notification events
// to subscribers over a shared-memory rendezvous.
//
// ## KEY DESIGN PRINCIPLES
//
// ### 1. Deadlock Freedom by Construction
// Every operation assembles its module working set first, closes it under
// dependencies, and sorts it by descriptor offset. Locks are only ever taken
// in that canonical order, so concurrent operations cannot form lock cycles.
//
// ### 2. Crash Resilience
// All shared state lives in file-backed shared memory guarded by in-arena
// lock records. Liveness is a per-connection flock; any WRITE acquirer of
// the global lock reclaims the locks, subscriptions, and overlay entries of
// connections that died without cleaning up.
//
// ### 3. Version-Checked Caching
// Running data is cached per connection and validated against the module
// descriptor's monotonic version on every use; a running write bumps the
// version only after the file is safely in place.
//
// ### 4. Bounded Waiting
// Every blocking primitive takes an absolute deadline: lock acquisition,
// provider rendezvous, upgrade waits. Deadline expiry rolls the operation
// back and surfaces a timeout, never a partial state.
//
// ===================================================================================================

// ===== FOUNDATIONS =====
pub mod config;   // TOML configuration, repository/SHM layout, env overrides
pub mod error;    // Error taxonomy shared by every component
pub mod logging;  // tracing-based logging setup and helpers

// ===== DATA MODEL =====
pub mod schema;   // Process-local module schemas, validation, defaults
pub mod tree;     // Data tree, diff algebra, merge policies
pub mod xpath;    // Location-path subset and static disjointness

// ===== SHARED STATE =====
pub mod registry; // Module descriptors, install/uninstall, defragmentation
pub mod rwlock;   // In-arena RW locks with deadlines, liveness lock files
pub mod shm;      // Main/Ext shared-memory arenas
pub mod subscr;   // Subscription tables and event pipes

// ===== ENGINE =====
pub mod cache;    // Version-checked running-data cache
pub mod edit;     // Edit application, diff merging, validation contracts
pub mod modinfo;  // Per-operation working set, closure, locking protocol
pub mod oper;     // Operational composer and internal-module state
pub mod store;    // Datastore files, loader, writer
pub mod rendezvous; // Provider request/reply over SHM slots + FIFOs

// ===== API SURFACE =====
pub mod conn;     // Connection lifecycle and recovery
pub mod notify;   // Config-change notifications and replay
pub mod session;  // Sessions, commits, subscriptions, RPC routing

/// Internal monitoring module: generated state, never editable.
pub const MONITORING_MODULE: &str = "yangstore-monitoring";

/// The yang-library module whose state is generated from the registry.
pub const YANG_LIBRARY_MODULE: &str = "ietf-yang-library";

/// Module carrying the standardized config-change notification.
pub const NOTIF_MODULE: &str = "ietf-netconf-notifications";

pub use cache::RunningCache;
pub use config::Config;
pub use conn::Connection;
pub use error::{ErrorKind, StoreError, StoreResult};
pub use rendezvous::{CallbackError, ChangeEvent, NotifEvent, OperRequest, RpcRequest};
pub use schema::{DepTag, ModuleDef, ModuleSchema, NodeSchema, SchemaNodeKind};
pub use session::{Session, Subscription};
pub use store::{Datastore, GetOpts};
pub use subscr::{OperSubKind, SUB_OPER_MERGE, SUB_PASSIVE};
pub use tree::{DiffOp, EditOp, MoveAnchor, Node, Origin, Tree};
pub use xpath::XPath;
