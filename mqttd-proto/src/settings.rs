use std::collections::HashMap;

/// Abstract settings provider.
///
/// Configuration sources (files, environment, fixtures) sit behind this
/// trait; the runtime never parses configuration formats itself.
pub trait Settings: Send + Sync {
    /// A numeric attribute under `path`, or -1 when absent.
    fn get_number(&self, path: &str, attr: &str) -> i64;

    /// A string attribute under `path`.
    fn get_string(&self, path: &str, attr: &str) -> Option<String>;

    /// Whether an attribute holds an affirmative value (`yes`, `true`, `1`).
    fn is_attr_positive(&self, path: &str, attr: &str) -> bool {
        match self.get_string(path, attr) {
            Some(value) => matches!(value.as_str(), "yes" | "true" | "1"),
            None => false,
        }
    }
}

/// In-memory settings, used by tests and embedders without a config file.
#[derive(Debug, Default)]
pub struct StaticSettings {
    entries: HashMap<(String, String), String>,
}

impl StaticSettings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set<P, A, V>(&mut self, path: P, attr: A, value: V)
    where
        P: Into<String>,
        A: Into<String>,
        V: Into<String>,
    {
        self.entries.insert((path.into(), attr.into()), value.into());
    }
}

impl Settings for StaticSettings {
    fn get_number(&self, path: &str, attr: &str) -> i64 {
        self.get_string(path, attr)
            .and_then(|value| value.parse().ok())
            .unwrap_or(-1)
    }

    fn get_string(&self, path: &str, attr: &str) -> Option<String> {
        self.entries
            .get(&(path.to_owned(), attr.to_owned()))
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_static_settings() {
        let mut settings = StaticSettings::new();
        settings.set("global-settings/connections", "max-limit", "1024");
        settings.set("global-settings/tls", "enabled", "yes");

        assert_eq!(settings.get_number("global-settings/connections", "max-limit"), 1024);
        assert_eq!(settings.get_number("global-settings/connections", "missing"), -1);
        assert!(settings.is_attr_positive("global-settings/tls", "enabled"));
        assert!(!settings.is_attr_positive("global-settings/tls", "missing"));
    }
}
