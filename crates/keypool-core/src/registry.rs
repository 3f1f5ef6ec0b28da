use std::collections::HashMap;
use std::sync::RwLock;

use crate::profile::ServiceProfile;
use crate::service::ServiceKind;

/// Runtime registry of service profiles.
///
/// Loaded once at startup with per-service defaults; mutable only through
/// explicit reconfiguration. A service that was never configured falls back
/// to the conservative generic profile.
#[derive(Debug)]
pub struct ProfileRegistry {
    profiles: RwLock<HashMap<ServiceKind, ServiceProfile>>,
}

impl Default for ProfileRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl ProfileRegistry {
    /// Registry pre-populated with the tuned default for every known kind.
    pub fn with_defaults() -> Self {
        let profiles = ServiceKind::ALL
            .into_iter()
            .map(|kind| (kind, ServiceProfile::default_for(kind)))
            .collect();
        Self {
            profiles: RwLock::new(profiles),
        }
    }

    /// Empty registry; every lookup resolves to the generic fallback until
    /// profiles are configured.
    pub fn empty() -> Self {
        Self {
            profiles: RwLock::new(HashMap::new()),
        }
    }

    pub fn profile_for(&self, service: ServiceKind) -> ServiceProfile {
        self.lock_read()
            .get(&service)
            .cloned()
            .unwrap_or_else(|| ServiceProfile::generic(service))
    }

    /// Replace the profile for one service. Returns the previous profile
    /// when one was configured.
    pub fn configure(&self, profile: ServiceProfile) -> Option<ServiceProfile> {
        self.lock_write().insert(profile.service, profile)
    }

    pub fn configured_services(&self) -> Vec<ServiceKind> {
        self.lock_read().keys().copied().collect()
    }

    fn lock_read(
        &self,
    ) -> std::sync::RwLockReadGuard<'_, HashMap<ServiceKind, ServiceProfile>> {
        self.profiles
            .read()
            .expect("profile registry lock is not poisoned")
    }

    fn lock_write(
        &self,
    ) -> std::sync::RwLockWriteGuard<'_, HashMap<ServiceKind, ServiceProfile>> {
        self.profiles
            .write()
            .expect("profile registry lock is not poisoned")
    }
}
