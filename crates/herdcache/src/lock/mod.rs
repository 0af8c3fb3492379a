//! Distributed leases over the remote store.
//!
//! ## Protocol
//!
//! ```text
//! acquire:  SET lock:<key> <token> NX PX <lease_timeout>   (poll until acquire_timeout)
//! release:  DEL lock:<key>      if GET lock:<key> == <token>  (one script)
//! extend:   PEXPIRE lock:<key>  if GET lock:<key> == <token>  (one script)
//! ```
//!
//! The provider never fails the caller because the store is down: store errors
//! during acquisition simply mean "not acquired". Only cancellation and a
//! re-entrant request on a lease the task already holds are reported as errors.

mod handle;
pub(crate) mod held;
mod provider;

pub use handle::LeaseHandle;
pub use held::is_held_by_current_task;
pub use provider::LockProvider;
pub(crate) use provider::LeaseMiss;
