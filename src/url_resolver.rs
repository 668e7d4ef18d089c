//! URL Resolver (C9, spec §4.9): chooses the regional/shared/dedicated
//! gateway URL via provisioning HTTP calls.

use crate::error::GatewayError;
use serde::Deserialize;
use std::sync::Once;

static DEDICATED_SERVER_NOTICE: Once = Once::new();

#[derive(Deserialize)]
struct RegionsResponse(Vec<String>);

#[derive(Deserialize)]
struct MtClientApiServer {
    url: Option<String>,
    hostname: Option<String>,
    domain: Option<String>,
}

pub struct UrlResolver {
    http: reqwest::Client,
    domain: String,
    region: Option<String>,
    use_shared_client_api: bool,
}

impl UrlResolver {
    pub fn new(domain: String, region: Option<String>, use_shared_client_api: bool) -> Self {
        Self {
            http: reqwest::Client::new(),
            domain,
            region,
            use_shared_client_api,
        }
    }

    /// Resolves the base gateway URL (spec §4.9 steps 1-3).
    pub async fn resolve(&self, token: &str) -> Result<String, GatewayError> {
        let default_region = if let Some(region) = &self.region {
            let regions = self.fetch_regions(token).await?;
            if !regions.contains(region) {
                return Err(GatewayError::NotFound {
                    message: format!("region {region} not found"),
                });
            }
            regions.into_iter().next()
        } else {
            None
        };

        let region = self.region.clone();
        let is_default_region = match (&region, &default_region) {
            (Some(r), Some(d)) => r == d,
            _ => true,
        };

        if self.use_shared_client_api {
            return Ok(match (&region, is_default_region) {
                (Some(r), false) => format!("https://mt-client-api-v1.{r}.{}", self.domain),
                _ => format!("https://mt-client-api-v1.{}", self.domain),
            });
        }

        self.notify_dedicated_server_spinup();
        let server = self.fetch_mt_client_api_server(token).await?;
        match (&region, is_default_region) {
            (_, true) => server.url.ok_or(GatewayError::NotFound {
                message: "mt-client-api server response missing url".into(),
            }),
            (Some(r), false) => {
                let hostname = server.hostname.ok_or(GatewayError::NotFound {
                    message: "mt-client-api server response missing hostname".into(),
                })?;
                let domain = server.domain.ok_or(GatewayError::NotFound {
                    message: "mt-client-api server response missing domain".into(),
                })?;
                Ok(format!("https://{hostname}.{r}.{domain}"))
            }
            (None, false) => unreachable!("is_default_region is true whenever region is None"),
        }
    }

    async fn fetch_regions(&self, token: &str) -> Result<Vec<String>, GatewayError> {
        let url = format!("https://{}/users/current/regions", self.domain);
        let response = self
            .http
            .get(url)
            .header("auth-token", token)
            .send()
            .await
            .map_err(|e| GatewayError::Internal { message: e.to_string() })?;
        let regions: RegionsResponse = response
            .json()
            .await
            .map_err(|e| GatewayError::Internal { message: e.to_string() })?;
        Ok(regions.0)
    }

    async fn fetch_mt_client_api_server(&self, token: &str) -> Result<MtClientApiServer, GatewayError> {
        let url = format!("https://{}/users/current/servers/mt-client-api", self.domain);
        let response = self
            .http
            .get(url)
            .header("auth-token", token)
            .send()
            .await
            .map_err(|e| GatewayError::Internal { message: e.to_string() })?;
        response
            .json()
            .await
            .map_err(|e| GatewayError::Internal { message: e.to_string() })
    }

    fn notify_dedicated_server_spinup(&self) {
        DEDICATED_SERVER_NOTICE.call_once(|| {
            tracing::info!("connecting to a dedicated gateway server; spin-up can take up to 3 minutes");
        });
    }
}
