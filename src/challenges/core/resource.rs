//! Loading of captcha media referenced by a challenge page.

use std::sync::Arc;
use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use url::Url;

use crate::challenges::solvers::SolverError;
use crate::external_deps::BrowserPage;
use crate::transport::{HttpTransport, TransportRequest};

/// Fetches captcha images and audio clips.
///
/// `data:` URIs are decoded inline. Other sources go through the live page
/// when there is one (so cookies and proxy match the challenge session) and
/// through the HTTP transport otherwise.
#[derive(Clone)]
pub struct ResourceLoader {
    transport: Option<Arc<dyn HttpTransport>>,
    timeout: Duration,
}

impl ResourceLoader {
    pub fn new(timeout: Duration) -> Self {
        Self {
            transport: None,
            timeout,
        }
    }

    pub fn with_transport(mut self, transport: Arc<dyn HttpTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub async fn load(
        &self,
        source: &str,
        base_url: &str,
        page: Option<&dyn BrowserPage>,
    ) -> Result<Vec<u8>, SolverError> {
        if source.starts_with("data:") {
            return decode_data_uri(source);
        }

        let absolute = Url::parse(base_url)?.join(source)?;
        if let Some(page) = page {
            return Ok(page.fetch_bytes(absolute.as_str()).await?);
        }

        let transport = self
            .transport
            .as_ref()
            .ok_or(SolverError::MissingResource("transport for captcha media"))?;
        let response = transport
            .execute(TransportRequest::get(absolute, self.timeout))
            .await?;
        if response.status != 200 {
            return Err(SolverError::ResourceStatus(response.status));
        }
        Ok(response.body.to_vec())
    }
}

impl std::fmt::Debug for ResourceLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceLoader")
            .field("has_transport", &self.transport.is_some())
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Decode the payload of a `data:` URI.
pub fn decode_data_uri(uri: &str) -> Result<Vec<u8>, SolverError> {
    let rest = uri.strip_prefix("data:").ok_or(SolverError::InvalidDataUri)?;
    let (meta, payload) = rest.split_once(',').ok_or(SolverError::InvalidDataUri)?;
    if meta.ends_with(";base64") {
        Ok(STANDARD.decode(payload.trim())?)
    } else {
        Ok(payload.as_bytes().to_vec())
    }
}
