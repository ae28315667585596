//! User settings and granted permissions. Both are server-owned: no local
//! mutators, only snapshots and events.

use std::collections::BTreeSet;
use std::sync::Arc;

use anyhow::Result;
use redb::{TableDefinition, WriteTransaction};

use super::{EntityFamily, EventStore};
use crate::db::{self, LocalDb, RowTable};
use crate::events::{Permission, SyncEvent, UserSetting};
use crate::observe::{Observable, Subscription};

const SETTINGS: RowTable = TableDefinition::new("settings");
const PERMISSIONS: RowTable = TableDefinition::new("permissions");

pub struct SettingsStore {
    db: Arc<LocalDb>,
    settings: Observable<Vec<UserSetting>>,
    permissions: Observable<BTreeSet<Permission>>,
}

impl SettingsStore {
    pub fn new(db: Arc<LocalDb>) -> Result<Self> {
        let store = Self {
            db,
            settings: Observable::default(),
            permissions: Observable::default(),
        };
        store.refresh()?;
        Ok(store)
    }

    pub fn observe_settings(&self) -> Subscription<Vec<UserSetting>> {
        self.settings.subscribe()
    }

    pub fn observe_permissions(&self) -> Subscription<BTreeSet<Permission>> {
        self.permissions.subscribe()
    }

    pub fn setting(&self, key: &str) -> Result<Option<UserSetting>> {
        self.db.get(SETTINGS, key)
    }

    pub fn permissions(&self) -> BTreeSet<Permission> {
        self.permissions.get()
    }

    pub fn has_permission(&self, permission: Permission) -> bool {
        self.permissions.get().contains(&permission)
    }

    pub fn replace_settings_in(&self, txn: &WriteTransaction, settings: &[UserSetting]) -> Result<()> {
        db::clear(txn, SETTINGS)?;
        for setting in settings {
            db::put(txn, SETTINGS, setting.key(), setting)?;
        }
        Ok(())
    }

    pub fn replace_permissions_in(&self, txn: &WriteTransaction, permissions: &[Permission]) -> Result<()> {
        db::clear(txn, PERMISSIONS)?;
        for p in permissions {
            db::put(txn, PERMISSIONS, p.as_str(), p)?;
        }
        Ok(())
    }

    pub fn replace_settings(&self, settings: &[UserSetting]) -> Result<()> {
        self.db.write(|txn| self.replace_settings_in(txn, settings))?;
        self.refresh()
    }

    pub fn replace_permissions(&self, permissions: &[Permission]) -> Result<()> {
        self.db.write(|txn| self.replace_permissions_in(txn, permissions))?;
        self.refresh()
    }
}

impl EventStore for SettingsStore {
    fn db(&self) -> &LocalDb {
        &self.db
    }

    /// Permissions live here too; snapshots replace them separately.
    fn family(&self) -> EntityFamily {
        EntityFamily::Settings
    }

    fn apply_event_in(&self, txn: &WriteTransaction, event: &SyncEvent) -> Result<bool> {
        match event {
            SyncEvent::SettingChanged { setting } => db::put(txn, SETTINGS, setting.key(), setting)?,
            SyncEvent::PermissionGranted { permission } => {
                db::put(txn, PERMISSIONS, permission.as_str(), permission)?
            }
            SyncEvent::PermissionRevoked { permission } => {
                db::remove(txn, PERMISSIONS, permission.as_str())?;
            }
            SyncEvent::PermissionsReset { permissions } => self.replace_permissions_in(txn, permissions)?,
            _ => return Ok(false),
        }
        Ok(true)
    }

    fn refresh(&self) -> Result<()> {
        let settings = self
            .db
            .scan::<UserSetting>(SETTINGS)?
            .into_iter()
            .map(|(_, s)| s)
            .collect();
        let permissions = self
            .db
            .scan::<Permission>(PERMISSIONS)?
            .into_iter()
            .map(|(_, p)| p)
            .collect();
        self.settings.publish(settings);
        self.permissions.publish(permissions);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> SettingsStore {
        SettingsStore::new(Arc::new(LocalDb::in_memory().unwrap())).unwrap()
    }

    #[test]
    fn test_permission_events() {
        let store = store();
        store
            .replace_permissions(&[Permission::AccessCatalog, Permission::LikeContent])
            .unwrap();

        store
            .apply_event(&SyncEvent::PermissionGranted {
                permission: Permission::OwnPlaylists,
            })
            .unwrap();
        store
            .apply_event(&SyncEvent::PermissionRevoked {
                permission: Permission::LikeContent,
            })
            .unwrap();
        assert!(store.has_permission(Permission::OwnPlaylists));
        assert!(!store.has_permission(Permission::LikeContent));

        store
            .apply_event(&SyncEvent::PermissionsReset {
                permissions: vec![Permission::ServerAdmin],
            })
            .unwrap();
        assert_eq!(store.permissions().into_iter().collect::<Vec<_>>(), vec![Permission::ServerAdmin]);
    }

    #[test]
    fn test_setting_changed_overwrites() {
        let store = store();
        store
            .replace_settings(&[UserSetting::ExternalSearchEnabled(false)])
            .unwrap();
        let event = SyncEvent::SettingChanged {
            setting: UserSetting::ExternalSearchEnabled(true),
        };
        store.apply_event(&event).unwrap();
        store.apply_event(&event).unwrap();
        assert_eq!(
            store.setting("enable_external_search").unwrap(),
            Some(UserSetting::ExternalSearchEnabled(true))
        );
        assert_eq!(store.observe_settings().borrow().len(), 1);
    }
}
