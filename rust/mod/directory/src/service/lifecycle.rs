//! User lifecycle: lock, isolate into quarantine, unlock, restore, move.
//!
//! Every transition is guarded by the current state, so repeating a call
//! after it took effect changes nothing.

use chrono::Utc;
use tracing::{info, warn};

use orgsync_ldap::dn::normalize_dn;
use orgsync_ldap::memory::PASSWORD_ATTRIBUTE;
use orgsync_ldap::Modification;

use crate::model::{DirectoryData, LockMarker, User};
use crate::service::delegation::Rights;
use crate::service::graph::PPOLICY_LOCKED_ATTRIBUTE;
use crate::service::{DirectoryError, DirectoryService, mirror};

fn user<'a>(data: &'a DirectoryData, id: &str) -> Result<&'a User, DirectoryError> {
    data.users
        .get(id)
        .ok_or_else(|| DirectoryError::unknown("user", id))
}

/// Company a user belongs to, including while isolated.
pub(crate) fn home_company(user: &User) -> Option<&str> {
    user.isolated.as_deref().or(user.company.as_deref())
}

/// Resolve a user the principal may write, through its home company.
fn lifecycle_target(rights: &Rights, data: &DirectoryData, id: &str) -> Result<String, DirectoryError> {
    let id = orgsync_ldap::dn::normalize(id);
    let target = user(data, &id)?;
    let allowed = home_company(target).is_some_and(|c| rights.can_write_company(data, c));
    if !allowed {
        warn!(user = %id, "lifecycle change outside of the principal's scope");
        return Err(DirectoryError::unknown("user", id));
    }
    Ok(id)
}

impl DirectoryService {
    fn write_marker(&self, dn: &str, marker: &LockMarker) -> Result<(), DirectoryError> {
        self.ldap.modify(
            dn,
            &[
                Modification::replace(
                    &self.config.locked_attribute,
                    vec![marker.encode(&self.config.locked_value)],
                ),
                Modification::replace(PASSWORD_ATTRIBUTE, Vec::new()),
            ],
        )?;
        Ok(())
    }

    /// Lock a user and clear its password. No-op when already locked.
    pub(crate) fn lock_in(
        &self,
        data: &mut DirectoryData,
        principal: &str,
        id: &str,
        isolated: Option<String>,
    ) -> Result<bool, DirectoryError> {
        let current = user(data, id)?;
        if current.locked.is_some() {
            return Ok(false);
        }
        let marker = LockMarker {
            locked: Utc::now(),
            locked_by: principal.to_string(),
            isolated,
        };
        self.write_marker(&current.dn, &marker)?;

        if let Some(u) = data.users.get_mut(id) {
            u.locked = Some(marker.locked);
            u.locked_by = Some(marker.locked_by);
            u.secured = false;
        }
        info!(user = id, principal, "user locked");
        Ok(true)
    }

    /// Lock a user and move it to the quarantine company. No-op when
    /// already isolated.
    pub(crate) fn isolate_in(
        &self,
        data: &mut DirectoryData,
        principal: &str,
        id: &str,
    ) -> Result<bool, DirectoryError> {
        let current = user(data, id)?;
        if current.isolated.is_some() {
            return Ok(false);
        }
        let previous = current
            .company
            .clone()
            .ok_or_else(|| DirectoryError::unknown("company", format!("of user {id}")))?;

        match (current.locked, current.locked_by.clone()) {
            (Some(locked), Some(locked_by)) => {
                // Already locked: keep the lock, record the previous company.
                let marker = LockMarker {
                    locked,
                    locked_by,
                    isolated: Some(previous.clone()),
                };
                self.write_marker(&current.dn, &marker)?;
            }
            _ => {
                self.lock_in(data, principal, id, Some(previous.clone()))?;
            }
        }

        let quarantine = orgsync_ldap::dn::to_rdn(&self.config.quarantine_dn);
        self.move_user_in(data, id, &quarantine)?;
        if let Some(u) = data.users.get_mut(id) {
            u.isolated = Some(previous.clone());
        }
        info!(user = id, principal, from = %previous, "user isolated");
        Ok(true)
    }

    /// Remove the lock marker. No-op unless locked and not isolated. The
    /// password stays cleared.
    pub(crate) fn unlock_in(
        &self,
        data: &mut DirectoryData,
        id: &str,
    ) -> Result<bool, DirectoryError> {
        let current = user(data, id)?;
        if current.isolated.is_some() || current.locked.is_none() {
            return Ok(false);
        }
        self.ldap.modify(
            &current.dn,
            &[
                Modification::replace(&self.config.locked_attribute, Vec::new()),
                Modification::replace(PPOLICY_LOCKED_ATTRIBUTE, Vec::new()),
            ],
        )?;
        if let Some(u) = data.users.get_mut(id) {
            u.locked = None;
            u.locked_by = None;
        }
        info!(user = id, "user unlocked");
        Ok(true)
    }

    /// Move an isolated user back to its previous company, then unlock it.
    pub(crate) fn restore_in(
        &self,
        data: &mut DirectoryData,
        id: &str,
    ) -> Result<bool, DirectoryError> {
        let Some(previous) = user(data, id)?.isolated.clone() else {
            return Ok(false);
        };
        if !data.companies.contains_key(&previous) {
            return Err(DirectoryError::unknown("company", previous));
        }
        self.move_user_in(data, id, &previous)?;
        if let Some(u) = data.users.get_mut(id) {
            u.isolated = None;
        }
        self.unlock_in(data, id)?;
        info!(user = id, to = %previous, "user restored");
        Ok(true)
    }

    /// Rename a user entry into `company` and follow it in every group.
    pub(crate) fn move_user_in(
        &self,
        data: &mut DirectoryData,
        id: &str,
        company: &str,
    ) -> Result<(), DirectoryError> {
        let current = user(data, id)?.clone();
        let target = data
            .companies
            .get(company)
            .ok_or_else(|| DirectoryError::unknown("company", company))?;
        let new_dn = format!("{}={},{}", self.config.uid_attribute, current.id, target.dn);
        if normalize_dn(&new_dn) == normalize_dn(&current.dn) {
            return Ok(());
        }

        self.ldap.rename(&current.dn, &new_dn)?;
        for group in &current.groups {
            let Some(group_dn) = data.groups.get(group).map(|g| g.dn.clone()) else {
                continue;
            };
            self.update_member_dn(group, &group_dn, &current.dn, &new_dn)?;
        }

        if let Some(u) = data.users.get_mut(id) {
            u.dn = new_dn.clone();
            u.company = Some(company.to_string());
        }
        if let Some(u) = data.users.get(id) {
            mirror::update_user(self.sql.as_ref(), u, data)?;
        }
        info!(user = id, from = %current.dn, to = %new_dn, "user moved");
        Ok(())
    }

    pub fn lock_user(&self, principal: &str, id: &str) -> Result<(), DirectoryError> {
        let rights = self.rights(principal)?;
        self.write(|data| {
            let id = lifecycle_target(&rights, data, id)?;
            self.lock_in(data, principal, &id, None).map(|_| ())
        })
    }

    pub fn isolate_user(&self, principal: &str, id: &str) -> Result<(), DirectoryError> {
        let rights = self.rights(principal)?;
        self.write(|data| {
            let id = lifecycle_target(&rights, data, id)?;
            self.isolate_in(data, principal, &id).map(|_| ())
        })
    }

    pub fn unlock_user(&self, principal: &str, id: &str) -> Result<(), DirectoryError> {
        let rights = self.rights(principal)?;
        self.write(|data| {
            let id = lifecycle_target(&rights, data, id)?;
            self.unlock_in(data, &id).map(|_| ())
        })
    }

    pub fn restore_user(&self, principal: &str, id: &str) -> Result<(), DirectoryError> {
        let rights = self.rights(principal)?;
        self.write(|data| {
            let id = lifecycle_target(&rights, data, id)?;
            self.restore_in(data, &id).map(|_| ())
        })
    }
}
