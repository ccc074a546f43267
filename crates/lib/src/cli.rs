//! # Command line interface
//!
//! Argument definitions, validation of flag combinations, and the driver
//! running a build and/or upload.

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use clap::Parser;
use indoc::indoc;

use crate::builder::{Builder, ImageFormat, DEFAULT_INSTALLER};
use crate::credentials::{self, RegistryEnv, PROJECT_VAR, TENANT_VAR};
use crate::registry::{self, GlanceClient, ImageRegistry, OsTag};
use crate::template::{self, TemplateSource, DEFAULT_REPO};
use crate::workspace::{Workspace, DEFAULT_TMPROOT};

const ABOUT: &str = indoc! {"
    Generate disk images from oz templates and upload them to the image registry.

    Based on an oz template (tdl) and an unattended installation recipe (ks or xml),
    this generates an image and optionally uploads it to Glance. Templates come from
    a git repository or from the current directory. oz-install drives qemu-kvm, so
    image generation must run as root; use `sudo -E` to keep OS_* credentials from
    the environment.
"};

const EXAMPLES: &str = indoc! {r#"
    Examples:

      Create a qcow2 image for slc6 from the default template repository:
          $ sudo ozite -d -n slc6 -f qcow2

      Create a qcow2 image for slc6 from templates in the current directory
      (slc6/slc6.tdl and slc6/slc6.ks must exist):
          $ sudo ozite -n slc6 -l -f qcow2

      Build slc6, upload it as "SLC6 image" to tenant "my project", then remove
      the local file:
          $ sudo -E ozite -n slc6 -f qcow2 -u -p -o linux -g "SLC6 image" -t "my project"

      Build and upload using credentials from a file:
          $ sudo ozite -n slc6 -f qcow2 -u -o linux -c ./os_creds

      Upload an existing image file:
          $ ozite -i /var/tmp/slc6.qcow2 -f qcow2 -o linux -t "my project"

      Build a VHD from windows2012/windows2012.{tdl,xml} and upload it:
          $ sudo -E ozite -n windows2012 -f vhd -u -p -o windows -t "my project"
"#};

fn existing_file(s: &str) -> Result<Utf8PathBuf, String> {
    let path = Utf8PathBuf::from(s);
    if !path.is_file() {
        return Err(format!("{s} is not a file"));
    }
    Ok(path)
}

/// Build disk images from templates and publish them
#[derive(Debug, Parser, PartialEq, Eq)]
#[clap(name = "ozite", version, about = ABOUT, after_help = EXAMPLES)]
pub struct Opts {
    /// Name of the template set to use; a directory of that name must exist
    /// either in the current directory or in the template repository
    #[clap(short = 'n', long)]
    pub name: Option<String>,

    /// Git repository to get the templates from [default: http://gitgw.cern.ch/git/ai-image-templates]
    #[clap(short = 'r', long)]
    pub repo: Option<String>,

    /// Name for the image in the registry (default: the image file name)
    #[clap(short = 'g', long = "glance_name", alias = "glance-name")]
    pub glance_name: Option<String>,

    /// Use the template directory in the current directory instead of cloning
    #[clap(short = 'l', long)]
    pub local: bool,

    /// Remove the image file from local disk after the upload
    #[clap(short = 'p', long)]
    pub purge: bool,

    /// Display debug messages
    #[clap(short = 'd', long)]
    pub debug: bool,

    /// Upload the generated image to the registry
    #[clap(
        short = 'u',
        long = "upload_generated_image",
        alias = "upload-generated-image"
    )]
    pub upload_generated_image: bool,

    /// Upload the given image file to the registry instead of building one
    #[clap(
        short = 'i',
        long = "upload_existing_image",
        alias = "upload-existing-image",
        value_name = "IMAGE_FILE",
        value_parser = existing_file
    )]
    pub upload_existing_image: Option<Utf8PathBuf>,

    /// Operating system the image is tagged with
    #[clap(short = 'o', long, value_enum)]
    pub os: Option<OsTag>,

    /// Format of the disk image
    #[clap(short = 'f', long = "image_format", alias = "image-format", value_enum)]
    pub image_format: ImageFormat,

    /// Tenant (project) to upload the image to
    #[clap(short = 't', long)]
    pub tenant: Option<String>,

    /// File with KEY=VALUE lines of OpenStack credentials, used instead of
    /// credentials from the environment
    #[clap(
        short = 'c',
        long = "os_credentials",
        alias = "os-credentials",
        value_name = "FILE_WITH_CREDENTIALS",
        value_parser = existing_file
    )]
    pub os_credentials: Option<Utf8PathBuf>,

    /// Directory for scratch directories and generated images
    #[clap(long, env = "OZITE_TMPROOT", default_value = DEFAULT_TMPROOT, hide = true)]
    pub tmp_root: Utf8PathBuf,

    /// The image installer to run
    #[clap(long, env = "OZITE_INSTALLER", default_value = DEFAULT_INSTALLER, hide = true)]
    pub installer: String,
}

/// Invalid combinations of command line flags.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum UsageError {
    /// Template options given together with an existing image
    #[error("There is no point passing --name, --repo or --local when you only want to upload an existing image")]
    TemplateWithExistingImage,
    /// Uploading without an OS tag
    #[error("If you want to upload the image, you must supply the OS in -o/--os")]
    MissingOs,
    /// Both a tenant and a credentials file
    #[error("Don't pass -t/--tenant when supplying credentials from a file; set OS_TENANT_NAME in the file instead")]
    TenantWithCredentials,
    /// Uploading without a tenant or credentials file
    #[error("You must set either -t/--tenant or -c/--os_credentials when uploading an image")]
    MissingTenantOrCredentials,
    /// `--tenant` without uploading
    #[error("There is no point passing -t/--tenant when you don't intend to upload the image")]
    TenantWithoutUpload,
    /// `--purge` without uploading
    #[error("There is no point passing -p/--purge when you don't intend to upload the image")]
    PurgeWithoutUpload,
    /// `--glance_name` without uploading
    #[error("There is no point passing -g/--glance_name when you don't intend to upload the image")]
    GlanceNameWithoutUpload,
    /// `--os` without uploading
    #[error("There is no point passing -o/--os when you don't intend to upload the image")]
    OsWithoutUpload,
    /// Building without a template name
    #[error("You must pass -n/--name if you want to generate an image")]
    MissingName,
}

/// Where the image to publish comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageSource {
    /// Build an image from a template set
    Build {
        /// Template set name
        name: String,
        /// Where the template set lives
        templates: TemplateSource,
    },
    /// Use an existing image file
    Existing(Utf8PathBuf),
}

/// How to authenticate to the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryAuth {
    /// Overlay credentials from this file on the environment
    CredentialsFile(Utf8PathBuf),
    /// Use the environment, with this tenant
    Tenant(String),
}

/// What to do with the image once it exists.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadPlan {
    /// OS tag for the image properties
    pub os: OsTag,
    /// Image name override
    pub name: Option<String>,
    /// Registry authentication
    pub auth: RegistryAuth,
    /// Remove the local image file at the end
    pub purge: bool,
}

/// A validated set of options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Plan {
    /// The image to publish
    pub source: ImageSource,
    /// Image format
    pub format: ImageFormat,
    /// Upload settings, if uploading
    pub upload: Option<UploadPlan>,
    /// Parent of scratch directories, and where built images land
    pub tmp_root: Utf8PathBuf,
    /// The installer binary
    pub installer: String,
}

impl Opts {
    fn uploading(&self) -> bool {
        self.upload_generated_image || self.upload_existing_image.is_some()
    }

    /// Check the flag combination, returning what to do.
    pub fn validate(&self) -> Result<Plan, UsageError> {
        if self.upload_existing_image.is_some()
            && (self.name.is_some() || self.repo.is_some() || self.local)
        {
            return Err(UsageError::TemplateWithExistingImage);
        }

        let upload = if self.uploading() {
            let os = self.os.ok_or(UsageError::MissingOs)?;
            let auth = match (&self.os_credentials, &self.tenant) {
                (Some(_), Some(_)) => return Err(UsageError::TenantWithCredentials),
                (None, None) => return Err(UsageError::MissingTenantOrCredentials),
                (Some(path), None) => RegistryAuth::CredentialsFile(path.clone()),
                (None, Some(tenant)) => RegistryAuth::Tenant(tenant.clone()),
            };
            Some(UploadPlan {
                os,
                name: self.glance_name.clone(),
                auth,
                purge: self.purge,
            })
        } else {
            if self.tenant.is_some() {
                return Err(UsageError::TenantWithoutUpload);
            }
            if self.purge {
                return Err(UsageError::PurgeWithoutUpload);
            }
            if self.glance_name.is_some() {
                return Err(UsageError::GlanceNameWithoutUpload);
            }
            if self.os.is_some() {
                return Err(UsageError::OsWithoutUpload);
            }
            None
        };

        let source = match (&self.upload_existing_image, &self.name) {
            (Some(path), _) => ImageSource::Existing(path.clone()),
            (None, None) => return Err(UsageError::MissingName),
            (None, Some(name)) => {
                let templates = if self.local {
                    TemplateSource::Local(".".into())
                } else {
                    TemplateSource::Git(self.repo.as_deref().unwrap_or(DEFAULT_REPO).to_owned())
                };
                ImageSource::Build {
                    name: name.clone(),
                    templates,
                }
            }
        };

        Ok(Plan {
            source,
            format: self.image_format,
            upload,
            tmp_root: self.tmp_root.clone(),
            installer: self.installer.clone(),
        })
    }
}

/// The registry environment: `base` with the credentials file or tenant applied.
fn registry_env(auth: &RegistryAuth, mut base: RegistryEnv) -> Result<RegistryEnv> {
    match auth {
        RegistryAuth::CredentialsFile(path) => base.overlay(credentials::load_file(path)?),
        RegistryAuth::Tenant(tenant) => {
            tracing::debug!("Setting {TENANT_VAR} and {PROJECT_VAR} to {tenant}");
            tracing::warn!("No credentials file supplied, using credentials from the environment");
            base.set_tenant(tenant);
        }
    }
    Ok(base)
}

/// Connect to the registry and verify it is usable.
fn connect_registry(upload: &UploadPlan) -> Result<GlanceClient> {
    let env = registry_env(&upload.auth, RegistryEnv::from_process())?;
    let client = GlanceClient::connect(&env).context(registry::UNREACHABLE)?;
    registry::check_connectivity(&client)?;
    Ok(client)
}

/// Produce the image (unless it already exists) and upload it if requested.
/// `image` is set as soon as the image file is known.
fn execute(
    plan: &Plan,
    workspace: &Workspace,
    registry: Option<&dyn ImageRegistry>,
    image: &mut Option<Utf8PathBuf>,
) -> Result<()> {
    let path = match &plan.source {
        ImageSource::Existing(path) => path.clone(),
        ImageSource::Build { name, templates } => {
            let templates = template::resolve(name, templates, workspace)?;
            let builder = Builder::new(&plan.installer, &plan.tmp_root);
            let path = builder.build(&templates, plan.format, workspace)?;
            println!("New image in {path}");
            path
        }
    };
    *image = Some(path.clone());

    if let Some(upload) = &plan.upload {
        let registry =
            registry.ok_or_else(|| anyhow::anyhow!("No registry connection for upload"))?;
        registry::upload_image(
            registry,
            &path,
            plan.format,
            upload.name.as_deref(),
            upload.os,
        )?;
    }
    Ok(())
}

fn purge_image(path: &Utf8Path) -> Result<()> {
    if path.is_file() {
        println!("Deleting image file {path}");
        std::fs::remove_file(path).with_context(|| format!("Deleting {path}"))?;
    }
    Ok(())
}

/// Run a validated plan. Whatever happens, scratch directories are removed
/// and, if requested, the image file is purged.
pub fn run_plan(plan: &Plan, registry: Option<&dyn ImageRegistry>) -> Result<()> {
    let workspace = Workspace::new(&plan.tmp_root);
    let mut image = None;
    let r = execute(plan, &workspace, registry, &mut image);

    let purge = plan.upload.as_ref().is_some_and(|u| u.purge);
    let purged = match image.as_deref() {
        Some(path) if purge => purge_image(path),
        _ => Ok(()),
    };
    let cleaned = workspace.cleanup();

    match r {
        Ok(()) => purged.and(cleaned),
        Err(e) => {
            for err in [purged, cleaned].into_iter().filter_map(Result::err) {
                tracing::warn!("{err:#}");
            }
            Err(e)
        }
    }
}

/// Parse the command line and run.
pub fn run() -> Result<()> {
    let opts = Opts::try_parse().unwrap_or_else(|e| {
        // Usage errors exit 1 like any other failure
        let _ = e.print();
        std::process::exit(if e.use_stderr() { 1 } else { 0 })
    });
    ozite_utils::initialize_tracing(opts.debug);
    tracing::trace!("starting {}", ozite_utils::NAME);

    let plan = opts.validate()?;
    // Fail before doing any expensive work if the registry isn't usable
    let registry = plan.upload.as_ref().map(connect_registry).transpose()?;
    run_plan(&plan, registry.as_ref().map(|r| r as &dyn ImageRegistry))
}
