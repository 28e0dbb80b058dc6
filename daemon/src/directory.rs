use std::collections::HashMap;
use std::path::PathBuf;

use crate::config::DirectoryConfig;

/// Maps the name of a scan's owning folder to that user's home directory.
///
/// Implementations may fail silently: `None` covers both "unknown user" and
/// "directory service unreachable". Callers neither retry nor cache.
pub trait HomeDirectoryResolver: Send + Sync {
    fn resolve_home_directory(&self, user: &str) -> Option<PathBuf>;
}

/// Resolver backed by the `[directory]` section of the config file.
///
/// Explicit entries in `users` win; otherwise `home_template` is expanded with
/// `{user}` replaced by the folder name. Names are matched case-insensitively.
#[derive(Debug, Clone, Default)]
pub struct ConfiguredDirectory {
    users: HashMap<String, PathBuf>,
    home_template: Option<String>,
}

impl ConfiguredDirectory {
    pub fn from_config(config: &DirectoryConfig) -> Self {
        Self {
            users: config
                .users
                .iter()
                .map(|(name, home)| (name.to_lowercase(), home.clone()))
                .collect(),
            home_template: config
                .home_template
                .clone()
                .filter(|t| !t.trim().is_empty()),
        }
    }
}

impl HomeDirectoryResolver for ConfiguredDirectory {
    fn resolve_home_directory(&self, user: &str) -> Option<PathBuf> {
        let user = user.trim();
        if user.is_empty() {
            return None;
        }
        if let Some(home) = self.users.get(&user.to_lowercase()) {
            return Some(home.clone());
        }
        self.home_template
            .as_ref()
            .map(|template| PathBuf::from(template.replace("{user}", user)))
    }
}
