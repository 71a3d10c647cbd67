//! HTTP access to a Tigris project's Issuezilla export endpoint.

use async_trait::async_trait;
use base64::Engine;

use crate::error::{FetchError, Result};
use crate::models::{Attachment, AttachmentPayload};
use crate::xml;

/// Read side of the source tracker used by the prober, the batch fetcher and
/// the attachment download step.
#[async_trait]
pub trait TrackerSource: Send + Sync {
    /// Whether the record with `id` exists at the source.
    async fn issue_exists(&self, id: u64) -> Result<bool>;

    /// Raw export document covering the inclusive range `[first, last]`.
    async fn export_range(&self, first: u64, last: u64) -> Result<Vec<u8>>;

    /// Content of one attachment.
    async fn fetch_attachment(&self, attachment: &Attachment) -> Result<Vec<u8>>;
}

/// Client for the `xml.cgi` endpoint of one Tigris project.
#[derive(Clone, Debug)]
pub struct TigrisClient {
    http_client: reqwest::Client,
    endpoint: String,
    include_attachments: bool,
}

impl TigrisClient {
    pub fn new(endpoint: &str) -> Self {
        Self {
            http_client: reqwest::Client::new(),
            endpoint: endpoint.to_string(),
            include_attachments: true,
        }
    }

    /// Client for `http://{project}.tigris.org/issues/xml.cgi`.
    pub fn for_project(project: &str) -> Result<Self> {
        let project = project.trim();
        if project.is_empty() || project.contains(['/', ':', ' ']) {
            return Err(FetchError::InvalidParameters(format!(
                "'{project}' is not a valid project name"
            )));
        }
        Ok(Self::new(&format!(
            "http://{project}.tigris.org/issues/xml.cgi"
        )))
    }

    /// Whether bulk exports embed attachment payloads.
    pub fn with_attachments(mut self, include: bool) -> Self {
        self.include_attachments = include;
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn read_body(response: reqwest::Response) -> Result<Vec<u8>> {
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                status: status.as_u16(),
                body: response.text().await.unwrap_or_default(),
            });
        }
        Ok(response.bytes().await?.to_vec())
    }
}

fn id_param(first: u64, last: u64) -> String {
    if first == last {
        first.to_string()
    } else {
        format!("{first}-{last}")
    }
}

#[async_trait]
impl TrackerSource for TigrisClient {
    async fn issue_exists(&self, id: u64) -> Result<bool> {
        let response = self
            .http_client
            .get(&self.endpoint)
            .query(&[
                ("include_attachments", "false"),
                ("id", id.to_string().as_str()),
            ])
            .send()
            .await?;
        let body = Self::read_body(response).await?;
        xml::issue_present(&body)
    }

    async fn export_range(&self, first: u64, last: u64) -> Result<Vec<u8>> {
        if first == 0 || last < first {
            return Err(FetchError::InvalidParameters(format!(
                "invalid id range {first}-{last}"
            )));
        }
        log::debug!("requesting {first}-{last} from {}", self.endpoint);
        let form = [
            ("include_attachments", self.include_attachments.to_string()),
            ("download_filename", "issues.xml".to_string()),
            ("id", id_param(first, last)),
        ];
        let response = self
            .http_client
            .post(&self.endpoint)
            .form(&form)
            .send()
            .await?;
        Self::read_body(response).await
    }

    async fn fetch_attachment(&self, attachment: &Attachment) -> Result<Vec<u8>> {
        match &attachment.payload {
            Some(AttachmentPayload::Inline(data)) => decode_inline(data),
            Some(AttachmentPayload::Remote(url)) => {
                let response = self.http_client.get(url).send().await?;
                Self::read_body(response).await
            }
            None => Err(FetchError::AttachmentUnavailable {
                attach_id: attachment.attach_id.clone(),
            }),
        }
    }
}

/// Decodes inline base64 content, tolerating the line wrapping used in exports.
pub fn decode_inline(data: &str) -> Result<Vec<u8>> {
    let compact: String = data.chars().filter(|c| !c.is_whitespace()).collect();
    Ok(base64::engine::general_purpose::STANDARD.decode(compact)?)
}
