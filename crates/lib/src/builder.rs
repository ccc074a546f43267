//! Build a disk image with oz-install and convert it to the requested format.

use std::fs;
use std::process::Command;

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use chrono::NaiveDateTime;
use clap::ValueEnum;
use fn_error_context::context;
use ozite_utils::CommandRunExt;

use crate::template::TemplateSet;
use crate::workspace::Workspace;

/// The installer binary used when none is configured.
pub const DEFAULT_INSTALLER: &str = "oz-install";

/// Supported output image formats
#[derive(Debug, Clone, Copy, ValueEnum, PartialEq, Eq)]
pub enum ImageFormat {
    /// Compressed QEMU Copy On Write 2 image
    Qcow2,
    /// Virtual Hard Disk, as used by Hyper-V
    Vhd,
    /// The raw image as produced by the installer
    Rawimg,
}

impl ImageFormat {
    /// The name used on the command line and as the file extension.
    pub fn as_str(&self) -> &'static str {
        match self {
            ImageFormat::Qcow2 => "qcow2",
            ImageFormat::Vhd => "vhd",
            ImageFormat::Rawimg => "rawimg",
        }
    }

    /// The disk format name the image registry knows this format by.
    pub fn disk_format(&self) -> &'static str {
        match self {
            ImageFormat::Qcow2 => "qcow2",
            ImageFormat::Vhd => "vhd",
            ImageFormat::Rawimg => "raw",
        }
    }

    /// The command converting the raw image at `raw` into `out`.
    fn convert_command(&self, raw: &Utf8Path, out: &Utf8Path) -> Command {
        let (program, args): (&str, Vec<&str>) = match self {
            ImageFormat::Qcow2 => (
                "qemu-img",
                vec!["convert", "-p", "-c", "-O", "qcow2", raw.as_str(), out.as_str()],
            ),
            ImageFormat::Vhd => (
                "VBoxManage",
                vec!["convertfromraw", raw.as_str(), out.as_str(), "--format=VHD"],
            ),
            ImageFormat::Rawimg => ("mv", vec![raw.as_str(), out.as_str()]),
        };
        let mut cmd = Command::new(program);
        cmd.args(args);
        cmd
    }
}

impl std::fmt::Display for ImageFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The file name a finished image is published under.
pub fn output_file_name(name: &str, format: ImageFormat, timestamp: NaiveDateTime) -> String {
    format!("{name}-{}.{format}", timestamp.format("%Y%m%d-%H%M"))
}

/// Runs the installer and converter for a template set.
#[derive(Debug, Clone)]
pub struct Builder {
    installer: String,
    output_root: Utf8PathBuf,
}

impl Builder {
    /// Create a builder running `installer` and placing images in `output_root`.
    pub fn new(installer: impl Into<String>, output_root: impl Into<Utf8PathBuf>) -> Self {
        Self {
            installer: installer.into(),
            output_root: output_root.into(),
        }
    }

    fn installer_command(
        &self,
        templates: &TemplateSet,
        recipe: Option<&Utf8Path>,
        raw: &Utf8Path,
    ) -> Command {
        let mut cmd = Command::new(&self.installer);
        cmd.args(["-d", "4", "-s", raw.as_str()]);
        if let Some(recipe) = recipe {
            cmd.args(["-a", recipe.as_str()]);
        }
        cmd.arg(templates.descriptor().as_str());
        cmd.current_dir(templates.root());
        cmd
    }

    /// Build the image for `templates` and return the path of the converted image.
    pub fn build(
        &self,
        templates: &TemplateSet,
        format: ImageFormat,
        workspace: &Workspace,
    ) -> Result<Utf8PathBuf> {
        self.build_at(templates, format, workspace, || {
            chrono::Local::now().naive_local()
        })
    }

    /// Like [`Self::build`]; `clock` gives the time the output file is named
    /// after, read once conversion has finished.
    #[context("Building {format} image for {}", templates.name())]
    fn build_at(
        &self,
        templates: &TemplateSet,
        format: ImageFormat,
        workspace: &Workspace,
        clock: impl FnOnce() -> NaiveDateTime,
    ) -> Result<Utf8PathBuf> {
        let name = templates.name();
        let tempdir = workspace.create_scratch_dir()?;
        let raw = tempdir.join(format!("{name}.raw"));
        let recipe = templates.recipe();

        tracing::info!("Installing {name} into {raw}");
        self.installer_command(templates, recipe.as_deref(), &raw)
            .log_debug()
            .run_inherited_with_cmd_context()
            .context("Running installer")?;

        let converted = tempdir.join(format!("{name}.{format}"));
        tracing::info!("Converting {raw} to {format}");
        format
            .convert_command(&raw, &converted)
            .log_debug()
            .run_inherited_with_cmd_context()
            .context("Converting image")?;

        let exported = self
            .output_root
            .join(output_file_name(name, format, clock()));
        move_file(&converted, &exported)?;
        Ok(exported)
    }
}

/// Move a file, falling back to a copy when a rename isn't possible
/// (e.g. across filesystems).
#[context("Moving {src} to {dst}")]
fn move_file(src: &Utf8Path, dst: &Utf8Path) -> Result<()> {
    if let Err(e) = fs::rename(src, dst) {
        tracing::debug!("rename failed ({e}), copying instead");
        fs::copy(src, dst).context("Copying")?;
        fs::remove_file(src).context("Removing source")?;
    }
    Ok(())
}

/// Write a stand-in for oz-install into `dir`, which just writes the image
/// given by `-s`.
#[cfg(test)]
pub(crate) fn write_fake_installer(dir: &Utf8Path) -> Result<Utf8PathBuf> {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join("fake-oz-install");
    fs::write(
        &path,
        indoc::indoc! {r#"
            #!/bin/sh
            while [ $# -gt 0 ]; do
                if [ "$1" = "-s" ]; then
                    shift
                    echo rawdata > "$1"
                fi
                shift
            done
        "#},
    )?;
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755))?;
    Ok(path)
}
