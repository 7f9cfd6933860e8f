//! A fixed, in-memory principal directory.

use std::path::Path;

use crate::config::DirectoryConfig;
use crate::error::SchedulingResult;
use crate::services::{Directory, Principal};

/// [`Directory`] over a fixed list of principals.
#[derive(Debug, Clone, Default)]
pub struct StaticDirectory {
    principals: Vec<Principal>,
}

impl StaticDirectory {
    pub fn new(principals: Vec<Principal>) -> Self {
        StaticDirectory { principals }
    }

    pub fn from_config(config: DirectoryConfig) -> Self {
        Self::new(config.principals)
    }

    pub fn load(path: &Path) -> SchedulingResult<Self> {
        Ok(Self::from_config(DirectoryConfig::load(path)?))
    }

    pub fn principals(&self) -> &[Principal] {
        &self.principals
    }
}

impl Directory for StaticDirectory {
    fn principal_for_address(&self, address: &str) -> Option<Principal> {
        self.principals
            .iter()
            .find(|p| p.has_address(address))
            .cloned()
    }

    fn principal_for_uid(&self, uid: &str) -> Option<Principal> {
        self.principals.iter().find(|p| p.uid == uid).cloned()
    }
}
