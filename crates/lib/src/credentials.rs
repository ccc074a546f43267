//! Loading registry credentials from `KEY=VALUE` files, and the environment
//! the registry client is configured from.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::sync::OnceLock;

use anyhow::{Context, Result};
use camino::Utf8Path;
use fn_error_context::context;
use regex::Regex;

/// The variable the tenant given on the command line is stored in.
pub const TENANT_VAR: &str = "OS_TENANT_NAME";
/// The identity v3 name for the tenant; takes precedence over [`TENANT_VAR`].
pub const PROJECT_VAR: &str = "OS_PROJECT_NAME";

fn line_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(?:export )?(\w+)=(.+)").expect("valid regex"))
}

/// Parse a credentials file: shell-style `KEY=VALUE` lines, optionally
/// prefixed with `export `. Blank lines and `#` comments are skipped.
///
/// All quote characters are removed from values, wherever they appear.
pub fn load(reader: impl BufRead) -> Result<BTreeMap<String, String>> {
    let re = line_regex();
    let mut r = BTreeMap::new();
    for (i, line) in reader.lines().enumerate() {
        let line = line?;
        let line = line.trim_start();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let caps = re
            .captures(line)
            .ok_or_else(|| anyhow::anyhow!("Invalid line {}: expected KEY=VALUE", i + 1))?;
        let value: String = caps[2]
            .trim()
            .chars()
            .filter(|c| !matches!(c, '"' | '\''))
            .collect();
        r.insert(caps[1].to_owned(), value);
    }
    Ok(r)
}

/// Parse the credentials file at `path`.
#[context("Loading credentials from {path}")]
pub fn load_file(path: &Utf8Path) -> Result<BTreeMap<String, String>> {
    let f = File::open(path)
        .with_context(|| format!("Opening {path}"))
        .map(BufReader::new)?;
    load(f)
}

/// A snapshot of the process environment with credentials overlaid.
///
/// The registry client reads its configuration from here rather than from
/// the process environment.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct RegistryEnv(BTreeMap<String, String>);

impl std::fmt::Debug for RegistryEnv {
    // Values are credentials; only show the keys
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.0.keys()).finish()
    }
}

impl RegistryEnv {
    /// Capture the current process environment.
    pub fn from_process() -> Self {
        Self(std::env::vars().collect())
    }

    /// Overlay `vars`, replacing any existing values.
    ///
    /// A tenant in `vars` without a project also replaces any inherited
    /// project, so the overlaid tenant is the one authenticated against.
    pub fn overlay(&mut self, vars: BTreeMap<String, String>) {
        let tenant = match (vars.get(TENANT_VAR), vars.contains_key(PROJECT_VAR)) {
            (Some(tenant), false) => Some(tenant.clone()),
            _ => None,
        };
        self.0.extend(vars);
        if let Some(tenant) = tenant {
            self.set(PROJECT_VAR, tenant);
        }
    }

    /// Set the tenant (project) to authenticate against.
    pub fn set_tenant(&mut self, tenant: &str) {
        self.set(TENANT_VAR, tenant);
        self.set(PROJECT_VAR, tenant);
    }

    /// Set a single variable.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    /// Look up a variable; empty values count as unset.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(|s| s.as_str()).filter(|s| !s.is_empty())
    }

    /// Look up a variable that must be set.
    pub fn require(&self, key: &str) -> Result<&str> {
        self.get(key)
            .ok_or_else(|| anyhow::anyhow!("Missing environment variable {key}"))
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for RegistryEnv {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}
