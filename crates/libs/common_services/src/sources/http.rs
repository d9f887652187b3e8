use crate::sources::validate::{check_expectations, require_pdf};
use crate::sources::{
    FailureReason, FetchRequest, Payload, SourceAdapter, SourceCapabilities, SourceDescriptor,
};
use app_state::{SourceKind, SourceSettings};
use async_trait::async_trait;
use color_eyre::eyre::{Context, eyre};
use reqwest::header::{self, HeaderMap, HeaderValue};
use reqwest::{Client, Response, StatusCode};
use std::time::Duration;
use tracing::debug;

/// Fills `{dataset}`, `{item}`, `{file_name}` and `{artifact_key}` into a URL template.
#[must_use]
pub fn render_url(template: &str, request: &FetchRequest) -> String {
    template
        .replace("{dataset}", &request.dataset)
        .replace("{item}", &request.item_key)
        .replace("{file_name}", &request.file_name)
        .replace("{artifact_key}", &request.artifact_key)
}

fn map_send_error(err: &reqwest::Error) -> FailureReason {
    if err.is_timeout() {
        FailureReason::Timeout
    } else {
        FailureReason::Transport(err.to_string())
    }
}

fn check_status(status: StatusCode) -> Result<(), FailureReason> {
    match status {
        s if s.is_success() => Ok(()),
        StatusCode::NOT_FOUND | StatusCode::GONE => Err(FailureReason::NotFound),
        StatusCode::TOO_MANY_REQUESTS => Err(FailureReason::RateLimited),
        s => Err(FailureReason::Http(s.as_u16())),
    }
}

/// One HTTP origin: a client configured with the source's timeout and headers, plus its URL template.
#[derive(Debug, Clone)]
struct HttpOrigin {
    client: Client,
    url_template: String,
}

impl HttpOrigin {
    fn from_settings(settings: &SourceSettings) -> color_eyre::Result<Self> {
        let url_template = settings
            .url_template
            .clone()
            .ok_or_else(|| eyre!("Source '{}' has no url_template", settings.name))?;

        let mut headers = HeaderMap::new();
        if let Some(cookie) = &settings.cookie {
            headers.insert(
                header::COOKIE,
                HeaderValue::from_str(cookie).wrap_err("Invalid cookie header")?,
            );
        }
        let mut builder = Client::builder()
            .timeout(Duration::from_secs(settings.timeout_seconds))
            .default_headers(headers);
        if let Some(user_agent) = &settings.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        Ok(Self {
            client: builder.build()?,
            url_template,
        })
    }

    async fn get(&self, request: &FetchRequest, range: Option<&str>) -> Result<Response, FailureReason> {
        let url = render_url(&self.url_template, request);
        debug!("GET {url}");
        let mut req = self.client.get(&url);
        if let Some(range) = range {
            req = req.header(header::RANGE, range);
        }
        let response = req.send().await.map_err(|e| map_send_error(&e))?;
        check_status(response.status())?;
        Ok(response)
    }

    async fn download(&self, request: &FetchRequest) -> Result<Payload, FailureReason> {
        let response = self.get(request, None).await?;
        let content_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(ToOwned::to_owned);
        let bytes = response.bytes().await.map_err(|e| map_send_error(&e))?;
        Ok(Payload { bytes, content_type })
    }
}

/// Public mirror of the datasets (e.g. an archive.org item per dataset).
#[derive(Debug, Clone)]
pub struct MirrorArchiveAdapter {
    descriptor: SourceDescriptor,
    origin: HttpOrigin,
}

impl MirrorArchiveAdapter {
    pub fn from_settings(settings: &SourceSettings) -> color_eyre::Result<Self> {
        Ok(Self {
            descriptor: SourceDescriptor {
                name: settings.name.clone(),
                kind: SourceKind::MirrorArchive,
                priority: settings.priority,
                capabilities: SourceCapabilities {
                    range_fetch: settings.range_fetch,
                    checksum: true,
                },
            },
            origin: HttpOrigin::from_settings(settings)?,
        })
    }
}

#[async_trait]
impl SourceAdapter for MirrorArchiveAdapter {
    fn descriptor(&self) -> &SourceDescriptor {
        &self.descriptor
    }

    async fn fetch(&self, request: &FetchRequest) -> Result<Payload, FailureReason> {
        let payload = self.origin.download(request).await?;
        check_expectations(request, &payload.bytes)?;
        // Without a digest to compare against, the magic bytes are all we can check.
        if request.expected_hash.is_none() {
            require_pdf(&payload.bytes)?;
        }
        Ok(payload)
    }
}

/// The publishing site itself. Slowest and most fragile: age gates and bot checks
/// answer with HTML pages and a 200.
#[derive(Debug, Clone)]
pub struct DirectSiteAdapter {
    descriptor: SourceDescriptor,
    origin: HttpOrigin,
}

impl DirectSiteAdapter {
    pub fn from_settings(settings: &SourceSettings) -> color_eyre::Result<Self> {
        Ok(Self {
            descriptor: SourceDescriptor {
                name: settings.name.clone(),
                kind: SourceKind::DirectSite,
                priority: settings.priority,
                capabilities: SourceCapabilities {
                    range_fetch: settings.range_fetch,
                    checksum: false,
                },
            },
            origin: HttpOrigin::from_settings(settings)?,
        })
    }

    /// Fetches the first bytes only, so an HTML interstitial is detected before downloading a large body.
    async fn probe(&self, request: &FetchRequest) -> Result<(), FailureReason> {
        let response = self.origin.get(request, Some("bytes=0-1023")).await?;
        let head = response.bytes().await.map_err(|e| map_send_error(&e))?;
        require_pdf(&head)
    }
}

#[async_trait]
impl SourceAdapter for DirectSiteAdapter {
    fn descriptor(&self) -> &SourceDescriptor {
        &self.descriptor
    }

    async fn fetch(&self, request: &FetchRequest) -> Result<Payload, FailureReason> {
        if self.descriptor.capabilities.range_fetch {
            self.probe(request).await?;
        }
        let payload = self.origin.download(request).await?;
        let is_pdf_type = payload
            .content_type
            .as_deref()
            .is_some_and(|ct| ct.trim().to_ascii_lowercase().starts_with("application/pdf"));
        if !is_pdf_type {
            return Err(FailureReason::Corrupt(format!(
                "unexpected content type {:?}",
                payload.content_type.as_deref().unwrap_or("none")
            )));
        }
        require_pdf(&payload.bytes)?;
        check_expectations(request, &payload.bytes)?;
        Ok(payload)
    }
}
