//! rebal-membership: the controller's view of cluster membership.
//!
//! Holds the machine roster loaded from the cluster config, decides which
//! machines participate in the current partition, and escalates machines
//! that stop reporting telemetry or stop accepting config into membership
//! changes.
//!
//! # Architecture
//!
//! ```text
//! MembershipView
//!   ├── roster (machine id → address, capacity)
//!   ├── select_participating_machines() → lowest ids, bounded
//!   ├── on_membership_change() → Joined / Left, flags repartition
//!   └── miss / delivery-failure counters → presumed-lost escalation
//! ```

pub mod membership;

pub use membership::{MembershipChange, MembershipView};
