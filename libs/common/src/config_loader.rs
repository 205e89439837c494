//! Configuration loading helper functions
//!
//! Layers a config file (format picked by extension) under prefixed
//! environment variables. Nested keys use `__` in the variable name,
//! e.g. `WIREDSRV_BUS__CENTRAL_ADDRESS`.

use crate::{Error, Result};
use figment::{
    providers::{Env, Format, Json, Serialized, Toml, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, info};

/// Build a figment for a service: defaults, then the file, then `PREFIX_*` env vars.
pub fn service_figment<T, P>(defaults: &T, path: Option<P>, env_prefix: &str) -> Result<Figment>
where
    T: Serialize,
    P: AsRef<Path>,
{
    let mut figment = Figment::from(Serialized::defaults(defaults));

    if let Some(path) = path {
        let path = path.as_ref();
        if path.exists() {
            let extension = path
                .extension()
                .and_then(|s| s.to_str())
                .ok_or_else(|| Error::config("Config file must have an extension"))?;

            figment = match extension {
                "toml" => figment.merge(Toml::file(path)),
                "yaml" | "yml" => figment.merge(Yaml::file(path)),
                "json" => figment.merge(Json::file(path)),
                _ => {
                    return Err(Error::config(format!(
                        "Unsupported config file format: {}",
                        extension
                    )))
                },
            };
            info!("Loading configuration from {}", path.display());
        } else {
            debug!(
                "Config file {} not found, using defaults and environment",
                path.display()
            );
        }
    }

    Ok(figment.merge(Env::prefixed(env_prefix).split("__")))
}

/// Load a typed configuration: defaults < file < environment.
pub fn load_config<T, P>(path: Option<P>, env_prefix: &str) -> Result<T>
where
    T: Serialize + for<'de> Deserialize<'de> + Default,
    P: AsRef<Path>,
{
    service_figment(&T::default(), path, env_prefix)?
        .extract()
        .map_err(|e| Error::config(format!("Failed to load configuration: {}", e)))
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use std::io::Write;

    #[derive(Debug, Default, Serialize, Deserialize, PartialEq)]
    #[serde(default)]
    struct Sample {
        name: String,
        retries: u32,
        nested: Nested,
    }

    #[derive(Debug, Default, Serialize, Deserialize, PartialEq)]
    #[serde(default)]
    struct Nested {
        address: u32,
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let cfg: Sample =
            load_config(Some("/nonexistent/sample.yaml"), "CFGLOADER_MISSING_").unwrap();
        assert_eq!(cfg, Sample::default());
    }

    #[test]
    fn test_yaml_file_overrides_defaults() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(file, "name: hub\nnested:\n  address: 7").unwrap();

        let cfg: Sample = load_config(Some(file.path()), "CFGLOADER_YAML_").unwrap();
        assert_eq!(cfg.name, "hub");
        assert_eq!(cfg.retries, 0);
        assert_eq!(cfg.nested.address, 7);
    }

    #[test]
    fn test_unknown_extension_rejected() {
        let file = tempfile::Builder::new().suffix(".ini").tempfile().unwrap();
        let result: Result<Sample> = load_config(Some(file.path()), "CFGLOADER_INI_");
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_env_overrides_file() {
        figment::Jail::expect_with(|jail| {
            jail.create_file("svc.toml", "name = \"file\"\nretries = 2\n")?;
            jail.set_env("CFGLOADER_ENV_NAME", "env");
            jail.set_env("CFGLOADER_ENV_NESTED__ADDRESS", "9");

            let cfg: Sample = load_config(Some("svc.toml"), "CFGLOADER_ENV_")
                .map_err(|e| e.to_string())?;
            assert_eq!(cfg.name, "env");
            assert_eq!(cfg.retries, 2);
            assert_eq!(cfg.nested.address, 9);
            Ok(())
        });
    }
}
