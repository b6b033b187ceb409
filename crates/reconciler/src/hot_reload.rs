//! Hot-reload classification of configuration deltas.
//!
//! Critical fields carry the worker's identity with the platform and the
//! assistant backend. A worker must never keep running with a stale one, so
//! any critical change forces a restart. Everything else can be pushed to
//! the running worker.

use fleet_core::{ConfigSnapshot, DesiredBotConfig, MutableSettings};
use serde::Serialize;

/// A field of a bot's configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfigField {
    ExternalToken,
    ExternalAssistantId,
    Prompt,
    Model,
    DisplayName,
}

impl ConfigField {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::ExternalToken => "external_token",
            Self::ExternalAssistantId => "external_assistant_id",
            Self::Prompt => "prompt",
            Self::Model => "model",
            Self::DisplayName => "display_name",
        }
    }

    #[must_use]
    pub const fn is_critical(&self) -> bool {
        matches!(self, Self::ExternalToken | Self::ExternalAssistantId)
    }
}

/// How a desired config differs from what a worker runs with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigDelta {
    Unchanged,
    /// Only mutable settings changed; push `settings` in place.
    Mutable {
        settings: MutableSettings,
        fields: Vec<ConfigField>,
    },
    /// At least one critical field changed; `fields` lists every change.
    Critical { fields: Vec<ConfigField> },
}

impl ConfigDelta {
    #[must_use]
    pub fn fields(&self) -> &[ConfigField] {
        match self {
            Self::Unchanged => &[],
            Self::Mutable { fields, .. } | Self::Critical { fields } => fields,
        }
    }

    #[must_use]
    pub const fn requires_restart(&self) -> bool {
        matches!(self, Self::Critical { .. })
    }
}

/// Fields whose values differ between the snapshot and the desired config.
#[must_use]
pub fn changed_fields(current: &ConfigSnapshot, desired: &DesiredBotConfig) -> Vec<ConfigField> {
    let checks = [
        (
            ConfigField::ExternalToken,
            current.credentials.external_token != desired.external_token,
        ),
        (
            ConfigField::ExternalAssistantId,
            current.credentials.external_assistant_id != desired.external_assistant_id,
        ),
        (
            ConfigField::Prompt,
            current.settings.prompt != desired.settings.prompt,
        ),
        (
            ConfigField::Model,
            current.settings.model != desired.settings.model,
        ),
        (
            ConfigField::DisplayName,
            current.settings.display_name != desired.settings.display_name,
        ),
    ];

    checks
        .into_iter()
        .filter_map(|(field, changed)| changed.then_some(field))
        .collect()
}

/// Classify the delta between a running worker's snapshot and its desired config.
#[must_use]
pub fn classify(current: &ConfigSnapshot, desired: &DesiredBotConfig) -> ConfigDelta {
    let fields = changed_fields(current, desired);

    if fields.is_empty() {
        ConfigDelta::Unchanged
    } else if fields.iter().any(ConfigField::is_critical) {
        ConfigDelta::Critical { fields }
    } else {
        ConfigDelta::Mutable {
            settings: desired.settings.clone(),
            fields,
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::panic)]

    use super::*;
    use fleet_core::BotId;

    fn base() -> DesiredBotConfig {
        DesiredBotConfig::new(BotId::new(1), "tok-1", "asst-1").with_settings(MutableSettings {
            prompt: "hello".to_string(),
            model: "small".to_string(),
            display_name: "Bot".to_string(),
        })
    }

    #[test]
    fn test_identical_config_is_unchanged() {
        let config = base();
        assert_eq!(classify(&config.snapshot(), &config), ConfigDelta::Unchanged);
    }

    #[test]
    fn test_prompt_only_change_is_mutable() {
        let running = base().snapshot();
        let mut desired = base();
        desired.settings.prompt = "goodbye".to_string();

        match classify(&running, &desired) {
            ConfigDelta::Mutable { settings, fields } => {
                assert_eq!(fields, vec![ConfigField::Prompt]);
                assert_eq!(settings.prompt, "goodbye");
            }
            other => panic!("expected mutable delta, got {other:?}"),
        }
    }

    #[test]
    fn test_token_change_is_critical() {
        let running = base().snapshot();
        let mut desired = base();
        desired.external_token = "tok-2".to_string();

        let delta = classify(&running, &desired);
        assert!(delta.requires_restart());
        assert_eq!(delta.fields(), &[ConfigField::ExternalToken]);
    }

    #[test]
    fn test_mixed_change_is_critical_and_lists_everything() {
        let running = base().snapshot();
        let mut desired = base();
        desired.external_assistant_id = "asst-2".to_string();
        desired.settings.model = "large".to_string();

        assert_eq!(
            classify(&running, &desired),
            ConfigDelta::Critical {
                fields: vec![ConfigField::ExternalAssistantId, ConfigField::Model]
            }
        );
    }
}
