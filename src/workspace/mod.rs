//! Workspace Module
//! Mission: Multi-tenant workspaces with role-based team membership

pub mod api;
pub mod models;
pub mod permissions;
pub mod store;

pub use models::{Membership, Role, Workspace};
pub use permissions::{member_access, member_access_or_forbidden, WorkspaceAccess};
pub use store::WorkspaceStore;
