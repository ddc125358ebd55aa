#![forbid(unsafe_code)]

use anyhow::{Context, Result, anyhow, bail};
use std::{
    collections::HashMap,
    env, fs,
    path::{Path, PathBuf},
};

pub const DEFAULT_ENV_PATH: &str = ".env";
pub const SUPABASE_URL_KEY: &str = "SUPABASE_URL";
pub const SUPABASE_KEY_KEY: &str = "SUPABASE_KEY";

/// Supabase project URL and service key.
#[derive(Clone)]
pub struct Credentials {
    pub supabase_url: String,
    pub supabase_key: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("supabase_url", &self.supabase_url)
            .field("supabase_key", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone, Default)]
pub struct CredentialOverrides {
    pub supabase_url: Option<String>,
    pub supabase_key: Option<String>,
    pub env_path: Option<PathBuf>,
}

/// Layering, highest first: explicit overrides, process environment, env file.
pub fn resolve_credentials(overrides: CredentialOverrides) -> Result<Credentials> {
    let env_path = overrides
        .env_path
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_ENV_PATH));
    let file_vars = read_env_file(&env_path)?;
    build_credentials_with_overrides(&file_vars, env_var_string, overrides)
        .with_context(|| format!("Loading credentials (env file {})", env_path.display()))
}

#[cfg(test)]
fn build_credentials(
    file_vars: &HashMap<String, String>,
    env_lookup: impl Fn(&str) -> Option<String>,
) -> Result<Credentials> {
    build_credentials_with_overrides(file_vars, env_lookup, CredentialOverrides::default())
}

fn build_credentials_with_overrides(
    file_vars: &HashMap<String, String>,
    env_lookup: impl Fn(&str) -> Option<String>,
    overrides: CredentialOverrides,
) -> Result<Credentials> {
    let supabase_url = overrides
        .supabase_url
        .and_then(non_blank)
        .or_else(|| lookup_value(SUPABASE_URL_KEY, file_vars, &env_lookup))
        .ok_or_else(|| anyhow!("{SUPABASE_URL_KEY} not set"))?;
    let supabase_key = overrides
        .supabase_key
        .and_then(non_blank)
        .or_else(|| lookup_value(SUPABASE_KEY_KEY, file_vars, &env_lookup))
        .ok_or_else(|| anyhow!("{SUPABASE_KEY_KEY} not set"))?;

    if !(supabase_url.starts_with("https://") || supabase_url.starts_with("http://")) {
        bail!("{SUPABASE_URL_KEY} must be an http(s) URL, got {supabase_url:?}");
    }

    Ok(Credentials {
        supabase_url: supabase_url.trim_end_matches('/').to_string(),
        supabase_key,
    })
}

fn non_blank(value: String) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn env_var_string(key: &str) -> Option<String> {
    env::var(key).ok().and_then(non_blank)
}

fn lookup_value(
    key: &str,
    file_vars: &HashMap<String, String>,
    env_lookup: &impl Fn(&str) -> Option<String>,
) -> Option<String> {
    env_lookup(key).or_else(|| file_vars.get(key).cloned().and_then(non_blank))
}

/// Reads `KEY=value` lines. A missing file is an empty set, not an error.
pub fn read_env_file(path: &Path) -> Result<HashMap<String, String>> {
    let mut vars = HashMap::new();
    if !path.exists() {
        return Ok(vars);
    }
    let content =
        fs::read_to_string(path).with_context(|| format!("Reading {}", path.display()))?;
    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let line = trimmed.strip_prefix("export ").unwrap_or(trimmed);
        let Some((key, value_raw)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        let value = value_raw.trim();
        let value = value
            .strip_prefix('"')
            .and_then(|value| value.strip_suffix('"'))
            .or_else(|| {
                value
                    .strip_prefix('\'')
                    .and_then(|value| value.strip_suffix('\''))
            })
            .unwrap_or(value);
        vars.insert(key.to_string(), value.to_string());
    }
    Ok(vars)
}
