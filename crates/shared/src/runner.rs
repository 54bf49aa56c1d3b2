//! The record injected into each cloned image and consumed by the in-VM
//! agent at boot. The agent registers an ephemeral runner with these values
//! and powers the VM off when its single job completes.

use serde_with::skip_serializing_none;

/// File name of the injected record, at the root of the main partition.
pub const RUNNER_CONFIG_FILE_NAME: &str = "runner-config.json";

/// Labels every pool runner carries, ahead of any user labels.
pub const DEFAULT_LABELS: [&str; 4] = ["self-hosted", "Windows", "X64", "ephemeral"];

#[skip_serializing_none]
#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunnerConfig {
    /// Short-lived registration token for the runner registry.
    pub token: String,
    /// Organization or user the runner registers under.
    pub account: String,
    /// Repository for repository-scoped runners.
    pub repository: Option<String>,
    /// Runner name, equal to the owning slot's name.
    pub name: String,
    /// Comma-joined labels, defaults first.
    pub labels: String,
    /// Runner group, only meaningful for account-scoped runners.
    pub runner_group: Option<String>,
    /// Base URL of the action cache proxy, trailing slash included.
    pub cache_url: Option<String>,
}

impl RunnerConfig {
    /// Serialize as the guest expects it: a single UTF-8 JSON document, no BOM.
    pub fn to_json_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

/// Join the default labels with the user-supplied ones.
///
/// User labels are kept verbatim, duplicates included.
pub fn join_labels(user_labels: &[String]) -> String {
    let mut labels: Vec<&str> = DEFAULT_LABELS.to_vec();
    labels.extend(user_labels.iter().map(String::as_str));
    labels.join(",")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> RunnerConfig {
        RunnerConfig {
            token: "AABBCC".into(),
            account: "acme".into(),
            repository: None,
            name: "runner-1".into(),
            labels: join_labels(&["gpu".into()]),
            runner_group: Some("default".into()),
            cache_url: Some("http://cache.local/".into()),
        }
    }

    #[test]
    fn json_round_trip() {
        let cfg = sample();
        let bytes = cfg.to_json_bytes().unwrap();
        let back: RunnerConfig = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(back, cfg);
    }

    #[test]
    fn optional_fields_are_omitted_when_absent() {
        let mut cfg = sample();
        cfg.repository = None;
        cfg.runner_group = None;
        cfg.cache_url = None;
        let text = String::from_utf8(cfg.to_json_bytes().unwrap()).unwrap();
        assert!(!text.contains("repository"));
        assert!(!text.contains("runnerGroup"));
        assert!(!text.contains("cacheUrl"));
    }

    #[test]
    fn labels_keep_defaults_first_and_do_not_deduplicate() {
        let joined = join_labels(&["ephemeral".into(), "big".into()]);
        assert_eq!(joined, "self-hosted,Windows,X64,ephemeral,ephemeral,big");
    }

    #[test]
    fn serialized_field_names_are_camel_case() {
        let text = String::from_utf8(sample().to_json_bytes().unwrap()).unwrap();
        assert!(text.contains("\"runnerGroup\""));
        assert!(text.contains("\"cacheUrl\""));
        assert!(text.contains("\"token\""));
    }
}
