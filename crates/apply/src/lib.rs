//! Hydro apply: turns a declarative set of objects into create-or-update
//! calls against a resource store, prunes orphaned children and supports
//! rollback through a symmetrical delete.

#![forbid(unsafe_code)]

pub mod callbacks;
pub mod deploy;
pub mod manifest;
pub mod operator;

pub use callbacks::{fire, Chain, IgnoreNotFound, Interceptor, LogStatus, StatusSlot};
pub use deploy::{deploy, safe_delete};
pub use manifest::{load_manifests, parse_manifests, parse_manifests_with, ManifestLimits};
pub use operator::{ApplyOptions, DeleteOptions, Operator};
