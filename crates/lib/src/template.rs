//! Locating template sets, either in a local directory or in a git repository.

use std::process::Command;

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;
use ozite_utils::CommandRunExt;

use crate::workspace::Workspace;

/// The template repository used when none is given.
pub const DEFAULT_REPO: &str = "http://gitgw.cern.ch/git/ai-image-templates";

/// Recipe extensions, in order of preference.
const RECIPE_EXTENSIONS: &[&str] = &["ks", "xml"];

/// Where template sets are looked up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TemplateSource {
    /// Use template sets from this directory.
    Local(Utf8PathBuf),
    /// Shallow-clone this git repository and use its toplevel.
    Git(String),
}

/// A template directory `<root>/<name>/` holding `<name>.tdl` and optionally
/// an unattended installation recipe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateSet {
    root: Utf8PathBuf,
    name: String,
}

impl TemplateSet {
    /// The template set name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The directory containing the template set directory.
    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    fn file(&self, extension: &str) -> Utf8PathBuf {
        self.root
            .join(&self.name)
            .join(format!("{}.{extension}", self.name))
    }

    /// Path to the template descriptor.
    pub fn descriptor(&self) -> Utf8PathBuf {
        self.file("tdl")
    }

    /// Find the unattended installation recipe, preferring kickstart over
    /// an answer file. Each candidate that isn't present is warned about.
    pub fn recipe(&self) -> Option<Utf8PathBuf> {
        for ext in RECIPE_EXTENSIONS {
            let candidate = self.file(ext);
            if candidate.is_file() {
                tracing::debug!("Using recipe {candidate}");
                return Some(candidate);
            }
            tracing::warn!("no recipe {candidate} found");
        }
        None
    }
}

/// The directory name `git clone` picks for a repository URL.
fn clone_dir_name(url: &str) -> Option<&str> {
    let name = url.trim_end_matches('/').rsplit(|c| c == '/' || c == ':').next()?;
    let name = name.strip_suffix(".git").unwrap_or(name);
    (!name.is_empty()).then_some(name)
}

/// Prepare the directory holding template set `name`.
#[context("Resolving template set {name}")]
pub fn resolve(name: &str, source: &TemplateSource, workspace: &Workspace) -> Result<TemplateSet> {
    let root = match source {
        TemplateSource::Local(dir) => dir
            .canonicalize_utf8()
            .with_context(|| format!("Resolving {dir}"))?,
        TemplateSource::Git(url) => {
            let dirname = clone_dir_name(url)
                .ok_or_else(|| anyhow::anyhow!("Can't determine checkout name for {url}"))?;
            let tempdir = workspace.create_scratch_dir()?;
            tracing::info!("Cloning {url}");
            Command::new("git")
                .args(["clone", "--depth", "1", url])
                .current_dir(&tempdir)
                .log_debug()
                .run_capture_stderr()?;
            tempdir.join(dirname)
        }
    };

    let templates = TemplateSet {
        root,
        name: name.to_owned(),
    };
    let descriptor = templates.descriptor();
    if !descriptor.is_file() {
        anyhow::bail!(
            "Template not found: no {name}/{name}.tdl in {}",
            templates.root
        );
    }
    tracing::debug!("Found template {descriptor}");
    Ok(templates)
}
