//! Active component registry.
//!
//! Tells the exclusion policy which theme and plugin directories are in use.
//! Only consulted when an "exclude inactive" option is set.

use crate::config::RegistryConfig;
use std::collections::HashSet;

pub trait ComponentRegistry {
    fn is_active_theme(&self, slug: &str) -> bool;
    fn is_active_plugin(&self, slug: &str) -> bool;
}

/// Registry backed by fixed slug lists.
#[derive(Debug, Clone, Default)]
pub struct StaticRegistry {
    themes: HashSet<String>,
    plugins: HashSet<String>,
}

impl StaticRegistry {
    pub fn new<I, J, S, T>(themes: I, plugins: J) -> Self
    where
        I: IntoIterator<Item = S>,
        J: IntoIterator<Item = T>,
        S: Into<String>,
        T: Into<String>,
    {
        Self {
            themes: themes.into_iter().map(Into::into).collect(),
            plugins: plugins.into_iter().map(Into::into).collect(),
        }
    }

    pub fn from_config(config: &RegistryConfig) -> Self {
        Self::new(config.active_themes.iter().cloned(), config.active_plugins.iter().cloned())
    }
}

impl ComponentRegistry for StaticRegistry {
    fn is_active_theme(&self, slug: &str) -> bool {
        self.themes.contains(slug)
    }

    /// Plugin slugs may be given as `dir` or `dir/main-file.ext`.
    fn is_active_plugin(&self, slug: &str) -> bool {
        self.plugins.contains(slug)
            || self
                .plugins
                .iter()
                .any(|p| p.split('/').next() == Some(slug))
    }
}
