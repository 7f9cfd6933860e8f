//! In-memory calendar store.

use std::collections::BTreeMap;
use std::sync::RwLock;

use async_trait::async_trait;

use crate::ical::Calendar;
use crate::services::{CalendarStore, ServiceError, ServiceResult};

/// (home uid, resource name)
type ResourceKey = (String, String);

/// [`CalendarStore`] keeping every resource in memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    resources: RwLock<BTreeMap<ResourceKey, Calendar>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, home_uid: &str, name: &str, calendar: Calendar) -> ServiceResult<()> {
        self.resources
            .write()
            .map_err(|_| ServiceError::message("store lock poisoned"))?
            .insert((home_uid.to_string(), name.to_string()), calendar);
        Ok(())
    }

    pub fn remove(&self, home_uid: &str, name: &str) -> ServiceResult<Option<Calendar>> {
        Ok(self
            .resources
            .write()
            .map_err(|_| ServiceError::message("store lock poisoned"))?
            .remove(&(home_uid.to_string(), name.to_string())))
    }

    pub fn get(&self, home_uid: &str, name: &str) -> ServiceResult<Option<Calendar>> {
        Ok(self
            .resources
            .read()
            .map_err(|_| ServiceError::message("store lock poisoned"))?
            .get(&(home_uid.to_string(), name.to_string()))
            .cloned())
    }

    fn find_in_home(
        &self,
        home_uid: &str,
        uid: &str,
        skip: Option<&str>,
    ) -> ServiceResult<Option<Calendar>> {
        let resources = self
            .resources
            .read()
            .map_err(|_| ServiceError::message("store lock poisoned"))?;
        Ok(resources
            .iter()
            .filter(|((home, name), _)| home == home_uid && Some(name.as_str()) != skip)
            .map(|(_, calendar)| calendar)
            .find(|calendar| calendar.resource_uid() == Some(uid))
            .cloned())
    }
}

#[async_trait]
impl CalendarStore for MemoryStore {
    async fn has_uid_elsewhere(
        &self,
        home_uid: &str,
        uid: &str,
        resource_name: Option<&str>,
    ) -> ServiceResult<bool> {
        Ok(self.find_in_home(home_uid, uid, resource_name)?.is_some())
    }

    async fn organizer_copy(&self, organizer_uid: &str, uid: &str) -> ServiceResult<Option<Calendar>> {
        self.find_in_home(organizer_uid, uid, None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ical::{Component, Property};

    fn event(uid: &str) -> Calendar {
        let mut component = Component::new("VEVENT");
        component.add_property(Property::new("UID", uid));
        let mut calendar = Calendar::new();
        calendar.add_component(component);
        calendar
    }

    #[tokio::test]
    async fn test_uid_elsewhere_skips_same_resource() {
        let store = MemoryStore::new();
        store.put("alice", "a.ics", event("uid-1")).unwrap();

        assert!(!store.has_uid_elsewhere("alice", "uid-1", Some("a.ics")).await.unwrap());
        assert!(store.has_uid_elsewhere("alice", "uid-1", Some("b.ics")).await.unwrap());
        assert!(!store.has_uid_elsewhere("bob", "uid-1", None).await.unwrap());
    }

    #[tokio::test]
    async fn test_organizer_copy_lookup() {
        let store = MemoryStore::new();
        store.put("org", "x.ics", event("uid-2")).unwrap();

        assert!(store.organizer_copy("org", "uid-2").await.unwrap().is_some());
        assert!(store.organizer_copy("org", "uid-3").await.unwrap().is_none());
        assert!(store.remove("org", "x.ics").unwrap().is_some());
        assert!(store.get("org", "x.ics").unwrap().is_none());
    }
}
