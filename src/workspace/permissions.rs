//! Role checks for workspace-scoped endpoints.

use crate::error::{ApiError, ApiResult};
use crate::workspace::models::{Membership, Workspace};
use crate::workspace::store::WorkspaceStore;
use uuid::Uuid;

/// A workspace together with the caller's membership in it.
#[derive(Debug, Clone)]
pub struct WorkspaceAccess {
    pub workspace: Workspace,
    pub membership: Membership,
}

impl WorkspaceAccess {
    pub fn is_admin(&self) -> bool {
        self.membership.role.is_admin()
    }

    /// Ownership follows `owner_id`, not the membership row.
    pub fn is_owner(&self) -> bool {
        self.workspace.owner_id == self.membership.user_id
    }

    pub fn require_admin(&self) -> ApiResult<()> {
        if self.is_admin() {
            Ok(())
        } else {
            Err(ApiError::forbidden(
                "Only workspace owners and admins can perform this action",
            ))
        }
    }

    pub fn require_owner(&self) -> ApiResult<()> {
        if self.is_owner() {
            Ok(())
        } else {
            Err(ApiError::forbidden(
                "Only the workspace owner can perform this action",
            ))
        }
    }
}

async fn resolve(
    store: &WorkspaceStore,
    workspace_id: Uuid,
    user_id: Uuid,
) -> ApiResult<(Option<Workspace>, Option<Membership>)> {
    let Some(workspace) = store.get(workspace_id).await? else {
        return Ok((None, None));
    };
    let membership = store.membership(workspace_id, user_id).await?;
    Ok((Some(workspace), membership))
}

/// Workspace visible to a member. Non-members get the same 404 as a missing
/// workspace so ids of other tenants are not disclosed.
pub async fn member_access(
    store: &WorkspaceStore,
    workspace_id: Uuid,
    user_id: Uuid,
) -> ApiResult<WorkspaceAccess> {
    match resolve(store, workspace_id, user_id).await? {
        (Some(workspace), Some(membership)) => Ok(WorkspaceAccess {
            workspace,
            membership,
        }),
        _ => Err(ApiError::not_found("Workspace not found")),
    }
}

/// Like [`member_access`] but answers 403 for an existing workspace the
/// caller does not belong to. Used by the billing and integration endpoints.
pub async fn member_access_or_forbidden(
    store: &WorkspaceStore,
    workspace_id: Uuid,
    user_id: Uuid,
) -> ApiResult<WorkspaceAccess> {
    match resolve(store, workspace_id, user_id).await? {
        (Some(workspace), Some(membership)) => Ok(WorkspaceAccess {
            workspace,
            membership,
        }),
        (Some(_), None) => Err(ApiError::forbidden(
            "You are not a member of this workspace",
        )),
        _ => Err(ApiError::not_found("Workspace not found")),
    }
}
