//! Client for the OpenStack image service (Glance), image API v2.

use std::fs::File;
use std::time::Duration;

use anyhow::{Context, Result};
use fn_error_context::context;
use reqwest::blocking::{Body, Client, RequestBuilder, Response};
use serde::Deserialize;

use super::{ImageMetadata, ImageRegistry, ImageSummary};
use crate::credentials::{RegistryEnv, PROJECT_VAR, TENANT_VAR};

const AUTH_TOKEN_HEADER: &str = "X-Auth-Token";
const SUBJECT_TOKEN_HEADER: &str = "X-Subject-Token";
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
/// Keep error messages from the server readable.
const MAX_ERROR_BODY: usize = 512;

#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: Token,
}

#[derive(Debug, Deserialize)]
struct Token {
    #[serde(default)]
    catalog: Vec<CatalogEntry>,
}

#[derive(Debug, Deserialize)]
struct CatalogEntry {
    #[serde(rename = "type")]
    service_type: String,
    endpoints: Vec<Endpoint>,
}

#[derive(Debug, Deserialize)]
struct Endpoint {
    interface: String,
    url: String,
    #[serde(default)]
    region_id: Option<String>,
    #[serde(default)]
    region: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ImageList {
    images: Vec<ImageSummary>,
}

/// The Keystone v3 token URL for an `OS_AUTH_URL`.
fn tokens_url(auth_url: &str) -> String {
    let base = auth_url.trim_end_matches('/');
    let base = base.strip_suffix("/v2.0").unwrap_or(base);
    if base.ends_with("/v3") {
        format!("{base}/auth/tokens")
    } else {
        format!("{base}/v3/auth/tokens")
    }
}

/// Strip any version suffix from an image service endpoint.
fn image_api_base(url: &str) -> String {
    let base = url.trim_end_matches('/');
    base.strip_suffix("/v2").unwrap_or(base).to_owned()
}

/// Pick the public image service endpoint from a service catalog.
fn find_image_endpoint<'a>(catalog: &'a [CatalogEntry], region: Option<&str>) -> Option<&'a str> {
    catalog
        .iter()
        .filter(|e| e.service_type == "image")
        .flat_map(|e| e.endpoints.iter())
        .filter(|e| e.interface == "public")
        .find(|e| match region {
            Some(r) => e.region_id.as_deref() == Some(r) || e.region.as_deref() == Some(r),
            None => true,
        })
        .map(|e| e.url.as_str())
}

/// Turn an unsuccessful response into an error including the server's message.
fn check_response(resp: Response) -> Result<Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().unwrap_or_default();
    let body: String = body.trim().chars().take(MAX_ERROR_BODY).collect();
    anyhow::bail!("{status}: {body}")
}

/// An authenticated connection to the image service.
pub struct GlanceClient {
    http: Client,
    endpoint: String,
    token: String,
}

impl std::fmt::Debug for GlanceClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GlanceClient")
            .field("endpoint", &self.endpoint)
            .finish_non_exhaustive()
    }
}

impl GlanceClient {
    /// Authenticate using the `OS_*` variables in `env`.
    ///
    /// `OS_AUTH_TOKEN` together with `OS_IMAGE_URL` skips the identity
    /// service; otherwise a password token is requested from `OS_AUTH_URL`.
    #[context("Connecting to the image service")]
    pub fn connect(env: &RegistryEnv) -> Result<Self> {
        let http = Client::builder()
            .user_agent(concat!("ozite/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(CONNECT_TIMEOUT)
            // Image uploads can take arbitrarily long
            .timeout(None::<Duration>)
            .build()
            .context("Creating HTTP client")?;

        if let (Some(token), Some(url)) = (env.get("OS_AUTH_TOKEN"), env.get("OS_IMAGE_URL")) {
            tracing::debug!("Using preauthenticated token for {url}");
            return Ok(Self {
                http,
                endpoint: image_api_base(url),
                token: token.to_owned(),
            });
        }

        let (token, catalog) = authenticate(&http, env)?;
        let endpoint = match env.get("OS_IMAGE_URL") {
            Some(url) => url,
            None => find_image_endpoint(&catalog, env.get("OS_REGION_NAME"))
                .ok_or_else(|| anyhow::anyhow!("No public image endpoint in the service catalog"))?,
        };
        tracing::debug!("Using image endpoint {endpoint}");
        Ok(Self {
            http,
            endpoint: image_api_base(endpoint),
            token,
        })
    }

    fn images_url(&self) -> String {
        format!("{}/v2/images", self.endpoint)
    }

    fn request(&self, builder: RequestBuilder) -> Result<Response> {
        let resp = builder.header(AUTH_TOKEN_HEADER, &self.token).send()?;
        check_response(resp)
    }
}

/// The Keystone v3 password authentication request, scoped to the project
/// from `OS_PROJECT_NAME` or `OS_TENANT_NAME`.
fn auth_body(env: &RegistryEnv) -> Result<serde_json::Value> {
    let project = env
        .get(PROJECT_VAR)
        .or_else(|| env.get(TENANT_VAR))
        .ok_or_else(|| anyhow::anyhow!("Missing environment variable {TENANT_VAR}"))?;
    tracing::debug!("Authenticating for project {project}");
    Ok(serde_json::json!({
        "auth": {
            "identity": {
                "methods": ["password"],
                "password": {
                    "user": {
                        "name": env.require("OS_USERNAME")?,
                        "domain": { "name": env.get("OS_USER_DOMAIN_NAME").unwrap_or("Default") },
                        "password": env.require("OS_PASSWORD")?,
                    }
                }
            },
            "scope": {
                "project": {
                    "name": project,
                    "domain": { "name": env.get("OS_PROJECT_DOMAIN_NAME").unwrap_or("Default") },
                }
            }
        }
    }))
}

/// Request a project-scoped token from the identity service.
fn authenticate(http: &Client, env: &RegistryEnv) -> Result<(String, Vec<CatalogEntry>)> {
    let auth_url = env.require("OS_AUTH_URL")?;
    let body = auth_body(env)?;

    let url = tokens_url(auth_url);
    tracing::debug!("Requesting token from {url}");
    let resp = http
        .post(&url)
        .json(&body)
        .send()
        .with_context(|| format!("Requesting token from {url}"))?;
    let resp = check_response(resp).context("Authenticating")?;
    let token = resp
        .headers()
        .get(SUBJECT_TOKEN_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| anyhow::anyhow!("Missing {SUBJECT_TOKEN_HEADER} in response"))?
        .to_owned();
    let parsed: TokenResponse = resp.json().context("Parsing token response")?;
    Ok((token, parsed.token.catalog))
}

impl ImageRegistry for GlanceClient {
    fn list_images(&self, name: Option<&str>) -> Result<Vec<ImageSummary>> {
        let mut req = self.http.get(self.images_url());
        if let Some(name) = name {
            req = req.query(&[("name", name)]);
        }
        let list: ImageList = self
            .request(req)
            .context("Listing images")?
            .json()
            .context("Parsing image list")?;
        Ok(list.images)
    }

    fn delete_image(&self, id: &str) -> Result<()> {
        let url = format!("{}/{id}", self.images_url());
        self.request(self.http.delete(url))
            .with_context(|| format!("Deleting image {id}"))?;
        Ok(())
    }

    fn create_image(&self, metadata: &ImageMetadata, data: File) -> Result<String> {
        let created: ImageSummary = self
            .request(self.http.post(self.images_url()).json(metadata))
            .context("Creating image")?
            .json()
            .context("Parsing created image")?;
        let id = created.id;
        tracing::debug!("Created image {id}, uploading data");

        let url = format!("{}/{id}/file", self.images_url());
        let req = self
            .http
            .put(url)
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(Body::from(data));
        if let Err(e) = self.request(req) {
            // Don't leave an empty image record behind
            if let Err(del) = self.delete_image(&id) {
                tracing::warn!("Failed to remove incomplete image {id}: {del:#}");
            }
            return Err(e.context(format!("Uploading data for image {id}")));
        }
        Ok(id)
    }
}
