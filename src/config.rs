//! Credential & configuration store: named provider profiles plus a small
//! set of global defaults, persisted as YAML under the user's config
//! directory (`spec.md` §4.1, §6).

use std::collections::HashMap;
use std::io::Write as _;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{MgitError, Result};
use crate::provider::ProviderKind;

/// A masked display form for a secret — never the real value.
pub const SECRET_MASK: &str = "********";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderProfile {
    #[serde(skip)]
    pub name: String,
    pub kind: ProviderKind,
    #[serde(rename = "url")]
    pub base_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(rename = "token")]
    pub secret: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub extras: HashMap<String, String>,
}

impl ProviderProfile {
    /// Resolves a `env:VAR`-shaped secret from the process environment.
    /// Invariant (ii) from `spec.md` §4.1.
    pub fn resolve_secret(mut self) -> Result<Self> {
        if let Some(var) = self.secret.strip_prefix("env:") {
            let value = std::env::var(var).map_err(|_| {
                MgitError::ConfigError(format!("secret references unset env var {var:?}"))
            })?;
            self.secret = value;
        }
        Ok(self)
    }

    /// A fixed masked form safe to print; never the real secret.
    pub fn masked_secret(&self) -> &'static str {
        SECRET_MASK
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GlobalSettings {
    #[serde(default)]
    pub default_concurrency: Option<usize>,
    #[serde(default)]
    pub default_update_mode: Option<String>,
    #[serde(default)]
    pub default_provider: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub global: GlobalSettings,
    #[serde(default)]
    pub providers: HashMap<String, ProviderProfile>,
}

const DEFAULT_CONFIG_YAML: &str = r#"# mgit configuration — see `mgit generate-env` for a fresh copy.
global:
  default_concurrency: 4
  default_update_mode: skip
  # default_provider: az1

providers: {}
  # az1:
  #   kind: azuredevops
  #   url: https://dev.azure.com/acme
  #   token: env:AZUREDEVOPS_TOKEN
  # gh1:
  #   kind: github
  #   url: https://api.github.com
  #   token: env:GITHUB_TOKEN
  # bb1:
  #   kind: bitbucket
  #   url: https://api.bitbucket.org/2.0
  #   user: alice
  #   token: env:BITBUCKET_APP_PASSWORD
  #   workspace: acme
"#;

/// `$XDG_CONFIG_HOME/mgit/config.yaml`, falling back to `~/.config`.
pub fn config_path() -> PathBuf {
    if let Ok(explicit) = std::env::var("MGIT_CONFIG") {
        return PathBuf::from(explicit);
    }
    let base = std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            std::env::var("HOME")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("."))
                .join(".config")
        });
    base.join("mgit").join("config.yaml")
}

impl ConfigFile {
    /// Loads the config file, resolving `env:VAR` secrets. If no file is
    /// present, falls back to synthesizing a profile from well-known
    /// environment variables (invariant (iii), `spec.md` §4.1).
    pub fn load() -> Result<Self> {
        let path = config_path();
        if !path.exists() {
            return Ok(Self::from_env_fallback());
        }
        Self::load_from(&path)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let mut parsed: ConfigFile = serde_yaml::from_str(&raw)
            .map_err(|e| MgitError::ConfigError(format!("{}: {e}", path.display())))?;
        for (name, profile) in parsed.providers.iter_mut() {
            profile.name = name.clone();
        }
        let mut resolved = HashMap::with_capacity(parsed.providers.len());
        for (name, profile) in parsed.providers {
            resolved.insert(name, profile.resolve_secret()?);
        }
        parsed.providers = resolved;
        Ok(parsed)
    }

    /// Synthesizes a single in-memory profile from per-kind environment
    /// variables when no config file exists at all.
    fn from_env_fallback() -> Self {
        let mut providers = HashMap::new();
        if let (Ok(token), Ok(url)) = (
            std::env::var("AZUREDEVOPS_TOKEN"),
            std::env::var("AZUREDEVOPS_ORG_URL"),
        ) {
            providers.insert(
                "azuredevops".to_string(),
                ProviderProfile {
                    name: "azuredevops".to_string(),
                    kind: ProviderKind::AzureDevOps,
                    base_url: url,
                    user: None,
                    secret: token,
                    workspace: None,
                    extras: HashMap::new(),
                },
            );
        }
        if let Ok(token) = std::env::var("GITHUB_TOKEN") {
            providers.insert(
                "github".to_string(),
                ProviderProfile {
                    name: "github".to_string(),
                    kind: ProviderKind::GitHub,
                    base_url: std::env::var("GITHUB_API_URL")
                        .unwrap_or_else(|_| "https://api.github.com".to_string()),
                    user: None,
                    secret: token,
                    workspace: None,
                    extras: HashMap::new(),
                },
            );
        }
        if let (Ok(user), Ok(pass)) = (
            std::env::var("BITBUCKET_USER"),
            std::env::var("BITBUCKET_APP_PASSWORD"),
        ) {
            providers.insert(
                "bitbucket".to_string(),
                ProviderProfile {
                    name: "bitbucket".to_string(),
                    kind: ProviderKind::BitBucket,
                    base_url: "https://api.bitbucket.org/2.0".to_string(),
                    user: Some(user),
                    secret: pass,
                    workspace: std::env::var("BITBUCKET_WORKSPACE").ok(),
                    extras: HashMap::new(),
                },
            );
        }

        let default_concurrency = std::env::var("MGIT_DEFAULT_CONCURRENCY")
            .ok()
            .and_then(|s| s.parse().ok());

        ConfigFile {
            global: GlobalSettings {
                default_concurrency,
                default_update_mode: None,
                default_provider: None,
            },
            providers,
        }
    }

    pub fn list_profiles(&self) -> Vec<&ProviderProfile> {
        self.providers.values().collect()
    }

    pub fn load_profile(&self, name: &str) -> Result<&ProviderProfile> {
        self.providers
            .get(name)
            .ok_or_else(|| MgitError::ProfileNotFound(name.to_string()))
    }

    /// Returns the explicitly-marked default, else the single profile of
    /// the requested kind, else `AmbiguousDefault`.
    pub fn resolve_default_profile(&self, kind: Option<ProviderKind>) -> Result<&ProviderProfile> {
        if let Some(name) = &self.global.default_provider {
            return self.load_profile(name);
        }
        let candidates: Vec<&ProviderProfile> = self
            .providers
            .values()
            .filter(|p| kind.is_none_or(|k| p.kind == k))
            .collect();
        match candidates.as_slice() {
            [single] => Ok(single),
            [] => Err(MgitError::ProfileNotFound(
                kind.map(|k| k.to_string()).unwrap_or_else(|| "<any>".to_string()),
            )),
            multiple => Err(MgitError::AmbiguousDefault(
                multiple.iter().map(|p| p.name.clone()).collect(),
            )),
        }
    }

    /// Overwrites a profile by name and persists atomically.
    pub fn save_profile(&mut self, profile: ProviderProfile) -> Result<()> {
        self.providers.insert(profile.name.clone(), profile);
        self.write()
    }

    pub fn remove_profile(&mut self, name: &str) -> Result<()> {
        if self.providers.remove(name).is_none() {
            return Err(MgitError::ProfileNotFound(name.to_string()));
        }
        self.write()
    }

    pub fn set_global(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "default_concurrency" => {
                self.global.default_concurrency = Some(value.parse().map_err(|_| {
                    MgitError::ConfigError(format!(
                        "default_concurrency must be an integer, got {value:?}"
                    ))
                })?);
            }
            "default_update_mode" => self.global.default_update_mode = Some(value.to_string()),
            "default_provider" => self.global.default_provider = Some(value.to_string()),
            other => return Err(MgitError::ConfigError(format!("unknown global key {other:?}"))),
        }
        self.write()
    }

    pub fn get_global(&self, key: &str) -> Option<String> {
        match key {
            "default_concurrency" => self.global.default_concurrency.map(|n| n.to_string()),
            "default_update_mode" => self.global.default_update_mode.clone(),
            "default_provider" => self.global.default_provider.clone(),
            _ => None,
        }
    }

    /// Write-then-rename atomic persistence, restricted to owner
    /// read/write (mode 0600 on unix).
    pub fn write(&self) -> Result<()> {
        self.write_to(&config_path())
    }

    pub fn write_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let yaml = serde_yaml::to_string(self)
            .map_err(|e| MgitError::ConfigError(format!("serializing config: {e}")))?;

        let tmp_path = path.with_extension("yaml.tmp");
        {
            let mut tmp = std::fs::File::create(&tmp_path)?;
            tmp.write_all(yaml.as_bytes())?;
        }
        restrict_permissions(&tmp_path)?;
        std::fs::rename(&tmp_path, path)?;
        Ok(())
    }

    /// Writes the commented default template if no file exists yet.
    pub fn write_default_if_missing() -> Result<PathBuf> {
        let path = config_path();
        if path.exists() {
            return Ok(path);
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, DEFAULT_CONFIG_YAML)?;
        restrict_permissions(&path)?;
        Ok(path)
    }
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let mut perms = std::fs::metadata(path)?.permissions();
    perms.set_mode(0o600);
    std::fs::set_permissions(path, perms)?;
    Ok(())
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) -> Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample_yaml() -> &'static str {
        r#"
global:
  default_concurrency: 8
  default_provider: az1
providers:
  az1:
    kind: azuredevops
    url: https://dev.azure.com/acme
    token: PAT_X
  gh1:
    kind: github
    url: https://api.github.com
    token: env:TEST_GH_TOKEN
"#
    }

    #[test]
    fn loads_and_resolves_env_secret() {
        std::env::set_var("TEST_GH_TOKEN", "resolved-token");
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, sample_yaml()).unwrap();

        let cfg = ConfigFile::load_from(&path).unwrap();
        let gh = cfg.load_profile("gh1").unwrap();
        assert_eq!(gh.secret, "resolved-token");
        let az = cfg.load_profile("az1").unwrap();
        assert_eq!(az.secret, "PAT_X");
    }

    #[test]
    fn missing_env_secret_is_config_error() {
        std::env::remove_var("TEST_MISSING_TOKEN");
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(
            &path,
            "providers:\n  x:\n    kind: github\n    url: https://api.github.com\n    token: env:TEST_MISSING_TOKEN\n",
        )
        .unwrap();
        assert!(ConfigFile::load_from(&path).is_err());
    }

    #[test]
    fn resolve_default_profile_explicit() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::env::set_var("TEST_GH_TOKEN", "x");
        std::fs::write(&path, sample_yaml()).unwrap();
        let cfg = ConfigFile::load_from(&path).unwrap();
        let default = cfg.resolve_default_profile(None).unwrap();
        assert_eq!(default.name, "az1");
    }

    #[test]
    fn resolve_default_profile_ambiguous() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(
            &path,
            "providers:\n  a:\n    kind: github\n    url: https://api.github.com\n    token: t1\n  b:\n    kind: github\n    url: https://api.github.com\n    token: t2\n",
        )
        .unwrap();
        let cfg = ConfigFile::load_from(&path).unwrap();
        let err = cfg
            .resolve_default_profile(Some(ProviderKind::GitHub))
            .unwrap_err();
        assert!(matches!(err, MgitError::AmbiguousDefault(_)));
    }

    #[test]
    fn save_profile_round_trips_and_is_atomic() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        let mut cfg = ConfigFile::default();
        cfg.providers.insert(
            "gh1".to_string(),
            ProviderProfile {
                name: "gh1".to_string(),
                kind: ProviderKind::GitHub,
                base_url: "https://api.github.com".to_string(),
                user: None,
                secret: "tok".to_string(),
                workspace: None,
                extras: HashMap::new(),
            },
        );
        cfg.write_to(&path).unwrap();
        assert!(!path.with_extension("yaml.tmp").exists());

        let reloaded = ConfigFile::load_from(&path).unwrap();
        assert_eq!(reloaded.load_profile("gh1").unwrap().secret, "tok");
    }

    #[test]
    fn env_fallback_synthesizes_github_profile() {
        std::env::set_var("GITHUB_TOKEN", "fallback-token");
        let cfg = ConfigFile::from_env_fallback();
        let gh = cfg.load_profile("github").unwrap();
        assert_eq!(gh.secret, "fallback-token");
        std::env::remove_var("GITHUB_TOKEN");
    }
}
