use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::config::{AuthFlowConfig, RetryPolicy, titles};
use crate::errors::Result;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlowKind {
    #[default]
    Direct,
    Federated,
    Combined,
}

/// On-disk (TOML) form of an [`AuthFlowConfig`]
///
/// ```toml
/// flow = "federated"
/// application_id = "389b1b32-b5d5-43b2-bddc-84ce938d6737"
/// relying_party = "rp://api.minecraftservices.com/"
///
/// [retry]
/// attempts = 3
/// delay_ms = 500
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlowSettings {
    pub flow: FlowKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub application_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authority: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scopes: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub relying_party: Option<String>,
    pub force_refresh: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device: Option<DeviceSettings>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetrySettings>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceSettings {
    pub device_type: String,
    pub version: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetrySettings {
    pub attempts: u32,
    pub delay_ms: u64,
}

impl FlowSettings {
    pub async fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read settings file {}", path.display()))?;
        Self::from_toml_str(&content)
            .with_context(|| format!("Failed to parse settings file {}", path.display()))
    }

    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(content)?)
    }

    pub async fn save(&self, path: impl AsRef<Path>) -> anyhow::Result<()> {
        let toml = toml::to_string_pretty(self).context("Failed to serialize settings to TOML")?;
        tokio::fs::write(path.as_ref(), toml)
            .await
            .context("Failed to write settings file")?;
        Ok(())
    }

    /// Build and validate the runtime configuration
    ///
    /// Without an `application_id` the direct and combined flows use the
    /// Nintendo Switch title and the federated flow the default public client.
    pub fn into_config(self) -> Result<AuthFlowConfig> {
        let mut config = match self.flow {
            FlowKind::Direct => AuthFlowConfig::direct(
                self.application_id
                    .unwrap_or_else(|| titles::MINECRAFT_NINTENDO_SWITCH.to_string()),
            ),
            FlowKind::Federated => AuthFlowConfig::federated(
                self.application_id
                    .unwrap_or_else(|| titles::FEDERATED_DEFAULT_CLIENT.to_string()),
            ),
            FlowKind::Combined => AuthFlowConfig::combined(
                self.application_id
                    .unwrap_or_else(|| titles::MINECRAFT_NINTENDO_SWITCH.to_string()),
            ),
        };

        if let Some(authority) = self.authority {
            config = config.with_authority(authority);
        }
        if let Some(scopes) = self.scopes {
            config = config.with_scopes(scopes);
        }
        if let Some(device) = self.device {
            config = config.with_device(device.device_type, device.version);
        }
        if let Some(relying_party) = self.relying_party {
            config = config.with_relying_party(relying_party);
        }
        if let Some(user_agent) = self.user_agent {
            config = config.with_user_agent(user_agent);
        }
        if let Some(retry) = self.retry {
            config = config.with_retry(RetryPolicy {
                max_attempts: retry.attempts,
                delay: Duration::from_millis(retry.delay_ms),
            });
        }
        config = config.with_force_refresh(self.force_refresh);

        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Flow, relying_party};
    use crate::errors::AuthError;
    use tempfile::TempDir;

    #[test]
    fn test_empty_file_is_direct_flow() {
        let config = FlowSettings::from_toml_str("").unwrap().into_config().unwrap();
        assert_eq!(config.flow.client_id(), titles::MINECRAFT_NINTENDO_SWITCH);
        assert!(matches!(config.flow, Flow::Direct { .. }));
        assert_eq!(config.retry, RetryPolicy::default());
    }

    #[test]
    fn test_federated_settings() {
        let settings = FlowSettings::from_toml_str(
            r#"
            flow = "federated"
            authority = "https://login.microsoftonline.com/common"
            scopes = ["XboxLive.signin", "XboxLive.offline_access"]
            relying_party = "rp://api.minecraftservices.com/"
            force_refresh = true

            [retry]
            attempts = 3
            delay_ms = 500
            "#,
        )
        .unwrap();

        let config = settings.into_config().unwrap();
        assert_eq!(config.flow.client_id(), titles::FEDERATED_DEFAULT_CLIENT);
        assert_eq!(
            config.flow,
            Flow::Federated {
                client_id: titles::FEDERATED_DEFAULT_CLIENT.to_string(),
                authority: "https://login.microsoftonline.com/common".to_string(),
                scopes: vec!["XboxLive.signin".to_string(), "XboxLive.offline_access".to_string()],
            }
        );
        assert_eq!(config.relying_party, relying_party::MINECRAFT_JAVA);
        assert!(config.force_refresh);
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.retry.delay, Duration::from_millis(500));
    }

    #[test]
    fn test_invalid_values_rejected() {
        let result = FlowSettings::from_toml_str("flow = \"combined\"\napplication_id = \"\"")
            .unwrap()
            .into_config();
        assert!(matches!(result, Err(AuthError::InvalidInput(_))));

        assert!(FlowSettings::from_toml_str("flow = \"sideways\"").is_err());
    }

    #[tokio::test]
    async fn test_save_then_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("flow.toml");
        let settings = FlowSettings {
            flow: FlowKind::Combined,
            device: Some(DeviceSettings {
                device_type: "Win32".to_string(),
                version: "10.0.0".to_string(),
            }),
            ..Default::default()
        };

        settings.save(&path).await.unwrap();
        let loaded = FlowSettings::load(&path).await.unwrap();
        assert_eq!(loaded, settings);

        let config = loaded.into_config().unwrap();
        assert_eq!(config.device.device_type, "Win32");
    }

    #[tokio::test]
    async fn test_load_missing_file_has_context() {
        let dir = TempDir::new().unwrap();
        let error = FlowSettings::load(dir.path().join("absent.toml")).await.unwrap_err();
        assert!(error.to_string().contains("Failed to read settings file"));
    }
}
