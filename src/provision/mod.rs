//! Declarative limits provisioning
//!
//! A YAML manifest describes the desired system, resource, and
//! entity×resource limits of one namespace. The differ compares it with
//! the previously applied managed set (persisted in the `#PROVISIONER`
//! record) and the applier executes the resulting create/update/delete
//! list, finishing by rewriting the managed set and a content hash.
//! Re-applying an unchanged manifest is detected by the hash and
//! produces zero changes.

pub mod applier;
pub mod differ;
pub mod manifest;

pub use applier::{Applier, ApplyResult};
pub use differ::{compute_diff, Change, ChangeAction, ChangeData, ChangeLevel};
pub use manifest::{
    decls_to_limits, EntityDecl, EntityResourceDecl, LimitDecl, LimitsManifest, ManagedSet,
    ResourceDecl, SystemDecl,
};
