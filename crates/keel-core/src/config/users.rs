//! User directory file.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use super::ConfigError;
use crate::user::{StaticUserDirectory, User};

/// Contents of a users file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UsersFile {
    #[serde(default)]
    pub users: Vec<User>,
}

impl UsersFile {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path.as_ref())?;
        Self::from_yaml(&content)
    }

    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        let file: UsersFile = serde_yaml::from_str(content)?;
        let mut seen = std::collections::BTreeSet::new();
        for user in &file.users {
            if !seen.insert(user.name.as_str()) {
                return Err(ConfigError::Config(format!(
                    "user '{}' is defined more than once",
                    user.name
                )));
            }
        }
        Ok(file)
    }

    pub fn into_directory(self) -> StaticUserDirectory {
        StaticUserDirectory::new(self.users)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::user::{RoleId, UserDirectory};

    #[test]
    fn roles_default_to_all_namespaces() {
        let file = UsersFile::from_yaml("users:\n  - name: root\n    roles:\n      - role: domain-admin\n")
            .unwrap();
        let directory = file.into_directory();
        let root = directory.get_user("root").unwrap();
        assert_eq!(root.roles[0].role, RoleId::DomainAdmin);
        assert_eq!(root.roles[0].namespaces, vec!["*".to_string()]);
    }

    #[test]
    fn duplicate_users_are_rejected() {
        let err = UsersFile::from_yaml("users:\n  - name: a\n  - name: a\n").unwrap_err();
        assert!(err.to_string().contains("more than once"));
    }
}
