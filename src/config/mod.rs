pub mod enhance;
pub mod types;

use anyhow::{Context, Result};
use std::path::Path;

pub use types::{
    BanConfig, Config, CredentialsConfig, LimitsConfig, LogConfig, RelayConfig, ServerConfig, TranslationConfig,
    UpstreamConfig,
};

pub fn load_config(path: &str) -> Result<Config> {
    let content = load_config_content(path)?;
    let config: Config =
        serde_yml::from_str(&content).with_context(|| format!("failed to parse {}", path))?;
    config.validate()?;
    Ok(config)
}

pub fn load_config_content(path: &str) -> Result<String> {
    let raw_content = std::fs::read_to_string(Path::new(path))
        .with_context(|| format!("failed to read {}", path))?;
    Ok(enhance::expand_env_vars(&raw_content))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_config_expands_env_and_validates() {
        let dir = tempfile::tempdir().unwrap();
        std::env::set_var("EG_TEST_LOAD_UUID", "d342d11e-d424-4583-b36e-524ab1f0afa4");

        let config_path = dir.path().join("config.yaml");
        std::fs::write(
            &config_path,
            "server:\n  port: ${EG_TEST_LOAD_PORT:-9443}\ncredentials:\n  uuid: $EG_TEST_LOAD_UUID\nrelay:\n  default: relay.example:443\n",
        )
        .unwrap();

        let config = load_config(config_path.to_str().unwrap()).unwrap();
        assert_eq!(config.server.port, 9443);
        assert_eq!(config.credentials.uuid, "d342d11e-d424-4583-b36e-524ab1f0afa4");
        assert_eq!(config.relay.default.as_deref(), Some("relay.example:443"));
    }

    #[test]
    fn load_config_rejects_missing_uuid() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("config.yaml");
        std::fs::write(&config_path, "server:\n  port: 8080\n").unwrap();
        assert!(load_config(config_path.to_str().unwrap()).is_err());
    }

    #[test]
    fn load_config_missing_file() {
        assert!(load_config("/nonexistent/edgegate.yaml").is_err());
    }
}
