//! Connection profiles as consumed by the core. Persistence lives with the
//! application shell.

use serde::{Deserialize, Serialize};

use pubsub_console_emulator_manager::EmulatorConfig;

/// A named connection configuration selectable by the user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Profile {
    pub id: String,
    pub project_id: String,
    /// Alternate service endpoint, e.g. an emulator not managed by us.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    /// When set, connect through a managed local emulator instance.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub emulator: Option<EmulatorConfig>,
}

impl Profile {
    /// Profile pointed at the real remote service.
    pub fn remote(id: impl Into<String>, project_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            project_id: project_id.into(),
            endpoint: None,
            emulator: None,
        }
    }

    /// Profile backed by a managed local emulator.
    pub fn emulated(
        id: impl Into<String>,
        project_id: impl Into<String>,
        emulator: EmulatorConfig,
    ) -> Self {
        Self {
            id: id.into(),
            project_id: project_id.into(),
            endpoint: None,
            emulator: Some(emulator),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn profiles_round_trip_through_serde() {
        let profile = Profile::emulated(
            "local",
            "demo-project",
            EmulatorConfig {
                port: Some(8085),
                ..EmulatorConfig::default()
            },
        );
        let json = serde_json::to_string(&profile).unwrap();
        let parsed: Profile = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, profile);
    }
}
