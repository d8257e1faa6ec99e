use std::env;
use std::path::PathBuf;

/// Hub settings, read once from the environment at start-up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct HubConfig {
    /// `BMC_DATA_DIR`: holds the `local` and `sync` stores.
    pub(crate) data_dir: PathBuf,
    /// `BMC_EXTENSION_ORIGIN`: when set, peers from other origins are refused.
    pub(crate) extension_origin: Option<String>,
    /// `BMC_TOP_ORIGIN`: extra origin trusted next to the extension's own.
    pub(crate) top_origin: Option<String>,
    /// `BMC_ALLOW_DUPLICATE_LABELS`: skip the label collision check on register.
    pub(crate) allow_duplicate_labels: bool,
}

impl HubConfig {
    pub(crate) fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let non_empty = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());
        Self {
            data_dir: non_empty("BMC_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(".bookmycomics")),
            extension_origin: non_empty("BMC_EXTENSION_ORIGIN"),
            top_origin: non_empty("BMC_TOP_ORIGIN"),
            allow_duplicate_labels: non_empty("BMC_ALLOW_DUPLICATE_LABELS")
                .is_some_and(|value| matches!(value.to_ascii_lowercase().as_str(), "1" | "true" | "yes")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(pairs: &[(&str, &str)]) -> HubConfig {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(key, value)| ((*key).to_owned(), (*value).to_owned()))
            .collect();
        HubConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_apply_to_missing_and_blank_values() {
        let defaults = config(&[("BMC_TOP_ORIGIN", "  ")]);
        assert_eq!(defaults.data_dir, PathBuf::from(".bookmycomics"));
        assert_eq!(defaults.top_origin, None);
        assert!(!defaults.allow_duplicate_labels);
    }

    #[test]
    fn values_are_taken_from_the_environment() {
        let set = config(&[
            ("BMC_DATA_DIR", "/var/lib/bmc"),
            ("BMC_EXTENSION_ORIGIN", "chrome-extension://abc/"),
            ("BMC_ALLOW_DUPLICATE_LABELS", "TRUE"),
        ]);
        assert_eq!(set.data_dir, PathBuf::from("/var/lib/bmc"));
        assert_eq!(set.extension_origin.as_deref(), Some("chrome-extension://abc/"));
        assert!(set.allow_duplicate_labels);
    }
}
