use std::io;
use std::time::Duration;

use camino::Utf8Path;
use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::HarvestError;
use crate::workdir::{persist_over, temp_file_beside};

pub const DEFAULT_PORTAL_URL: &str = "https://www.ebi.ac.uk/ena/portal/api/search";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct PortalRequest {
    #[serde(default = "default_url")]
    pub url: String,
    #[serde(default = "default_data_portal")]
    pub data_portal: String,
    pub result: String,
    #[serde(default)]
    pub fields: String,
    #[serde(default)]
    pub query: String,
    #[serde(default)]
    pub offset: u64,
    #[serde(default)]
    pub limit: u64,
}

fn default_url() -> String {
    DEFAULT_PORTAL_URL.to_string()
}

fn default_data_portal() -> String {
    "ena".to_string()
}

impl PortalRequest {
    pub fn to_url(&self, cursor: u64) -> String {
        format!(
            "{}?dataPortal={}&result={}&offset={cursor}&limit={}&fields={}&query={}",
            self.url,
            self.data_portal,
            self.result,
            self.limit,
            self.fields,
            urlencoding::encode(&self.query)
        )
    }
}

pub trait PortalClient: Send + Sync {
    fn download(
        &self,
        request: &PortalRequest,
        cursor: u64,
        destination: &Utf8Path,
    ) -> Result<u64, HarvestError>;
}

#[derive(Clone)]
pub struct PortalHttpClient {
    client: Client,
}

impl PortalHttpClient {
    pub fn new() -> Result<Self, HarvestError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("kira-dwca/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| HarvestError::PortalHttp(err.to_string()))?,
        );
        let client = Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(600))
            .build()
            .map_err(|err| HarvestError::PortalHttp(err.to_string()))?;
        Ok(Self { client })
    }
}

impl PortalClient for PortalHttpClient {
    fn download(
        &self,
        request: &PortalRequest,
        cursor: u64,
        destination: &Utf8Path,
    ) -> Result<u64, HarvestError> {
        let url = request.to_url(cursor);
        info!(url = %url, destination = %destination, "requesting data");
        let mut response = self
            .client
            .get(&url)
            .send()
            .map_err(|err| HarvestError::PortalHttp(err.to_string()))?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let message = response
                .text()
                .unwrap_or_else(|_| "portal request failed".to_string());
            return Err(HarvestError::PortalStatus { status, message });
        }

        let mut temp = temp_file_beside(destination)?;
        let written = io::copy(&mut response, temp.as_file_mut())
            .map_err(|err| HarvestError::PortalHttp(err.to_string()))?;
        persist_over(temp, destination)?;
        debug!(bytes = written, "data written to file");
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_carries_cursor_and_encoded_query() {
        let request = PortalRequest {
            url: DEFAULT_PORTAL_URL.to_string(),
            data_portal: "ena".to_string(),
            result: "sequence".to_string(),
            fields: "accession,location,country".to_string(),
            query: "dataclass=\"STD\" AND tax_tree(2759)".to_string(),
            offset: 0,
            limit: 0,
        };
        assert_eq!(
            request.to_url(500),
            "https://www.ebi.ac.uk/ena/portal/api/search?dataPortal=ena&result=sequence\
             &offset=500&limit=0&fields=accession,location,country\
             &query=dataclass%3D%22STD%22%20AND%20tax_tree%282759%29"
        );
    }

    #[test]
    fn request_defaults_from_json() {
        let request: PortalRequest =
            serde_json::from_str(r#"{"result": "sequence", "query": "x"}"#).unwrap();
        assert_eq!(request.url, DEFAULT_PORTAL_URL);
        assert_eq!(request.data_portal, "ena");
        assert_eq!(request.offset, 0);
        assert_eq!(request.limit, 0);
    }
}
