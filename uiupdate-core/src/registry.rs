//! Package registry client
//!
//! Two calls are needed from the registry: the versions available for the UI
//! package, and the description of one version, which carries the URI of the
//! UI bundle asset. Both are JSON POSTs with versioned media types.

use crate::error::{UiUpdateError, UiUpdateResult};
use crate::types::UiVersion;
use async_trait::async_trait;
use reqwest::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;
use url::Url;

const LIST_VERSIONS_REQUEST: &str =
    "application/vnd.dcos.package.list-versions-request+json;charset=utf-8;version=v1";
const LIST_VERSIONS_RESPONSE: &str =
    "application/vnd.dcos.package.list-versions-response+json;charset=utf-8;version=v1";
const DESCRIBE_REQUEST: &str =
    "application/vnd.dcos.package.describe-request+json;charset=utf-8;version=v1";
const DESCRIBE_RESPONSE: &str =
    "application/vnd.dcos.package.describe-response+json;charset=utf-8;version=v3";

/// Suffix of the asset key holding the UI bundle
const BUNDLE_SUFFIX: &str = "-bundle";

/// Registry connection settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    pub url: String,
    pub package_name: String,
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
    /// Authorization header sent when the caller provides none
    pub authorization: Option<String>,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:7070".to_string(),
            package_name: "dcos-ui".to_string(),
            request_timeout: Duration::from_secs(60),
            authorization: None,
        }
    }
}

/// Queries about UI packages
#[async_trait]
pub trait PackageRegistry: Send + Sync {
    /// Versions of the UI package known to the registry
    async fn list_versions(&self, authorization: Option<&str>) -> UiUpdateResult<Vec<UiVersion>>;

    /// URI of the UI bundle of `version`
    async fn bundle_uri(
        &self,
        version: &UiVersion,
        authorization: Option<&str>,
    ) -> UiUpdateResult<Url>;

    /// Whether the registry knows `version`
    async fn has_version(
        &self,
        version: &UiVersion,
        authorization: Option<&str>,
    ) -> UiUpdateResult<bool> {
        Ok(self.list_versions(authorization).await?.contains(version))
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ListVersionsRequest<'a> {
    package_name: &'a str,
    include_package_versions: bool,
}

#[derive(Debug, Deserialize)]
struct ListVersionsResponse {
    results: HashMap<String, String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct DescribeRequest<'a> {
    package_name: &'a str,
    package_version: &'a str,
}

#[derive(Debug, Deserialize)]
struct DescribeResponse {
    package: DescribedPackage,
}

#[derive(Debug, Default, Deserialize)]
struct DescribedPackage {
    #[serde(default)]
    resource: Resource,
}

#[derive(Debug, Default, Deserialize)]
struct Resource {
    #[serde(default)]
    assets: Assets,
}

#[derive(Debug, Default, Deserialize)]
struct Assets {
    #[serde(default)]
    uris: HashMap<String, String>,
}

/// HTTP client for a Cosmos-style package registry
pub struct CosmosClient {
    http: reqwest::Client,
    base: String,
    package_name: String,
    authorization: Option<String>,
}

impl CosmosClient {
    pub fn new(config: &RegistryConfig) -> UiUpdateResult<Self> {
        Url::parse(&config.url).map_err(|e| UiUpdateError::ConfigurationError {
            component: "registry".to_string(),
            message: format!("invalid registry url '{}': {}", config.url, e),
        })?;
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| UiUpdateError::ConfigurationError {
                component: "registry".to_string(),
                message: format!("failed to create HTTP client: {}", e),
            })?;
        Ok(Self {
            http,
            base: config.url.trim_end_matches('/').to_string(),
            package_name: config.package_name.clone(),
            authorization: config.authorization.clone(),
        })
    }

    async fn post<B, R>(
        &self,
        path: &str,
        content_type: &str,
        accept: &str,
        body: &B,
        authorization: Option<&str>,
    ) -> UiUpdateResult<R>
    where
        B: Serialize + ?Sized,
        R: serde::de::DeserializeOwned,
    {
        let endpoint = format!("{}{}", self.base, path);
        let failure = |message: String| UiUpdateError::CosmosRequestFailure {
            endpoint: endpoint.clone(),
            message,
        };

        let body = serde_json::to_vec(body)?;
        let mut request = self
            .http
            .post(&endpoint)
            .header(CONTENT_TYPE, content_type)
            .header(ACCEPT, accept)
            .body(body);
        if let Some(authorization) = authorization.or(self.authorization.as_deref()) {
            request = request.header(AUTHORIZATION, authorization);
        }

        debug!(endpoint = %endpoint, "registry request");
        let response = request.send().await.map_err(|e| failure(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(failure(format!("{}: {}", status, text)));
        }
        response
            .json::<R>()
            .await
            .map_err(|e| failure(format!("invalid response: {}", e)))
    }
}

#[async_trait]
impl PackageRegistry for CosmosClient {
    async fn list_versions(&self, authorization: Option<&str>) -> UiUpdateResult<Vec<UiVersion>> {
        let request = ListVersionsRequest {
            package_name: &self.package_name,
            include_package_versions: true,
        };
        let response: ListVersionsResponse = self
            .post(
                "/package/list-versions",
                LIST_VERSIONS_REQUEST,
                LIST_VERSIONS_RESPONSE,
                &request,
                authorization,
            )
            .await?;
        let mut versions: Vec<UiVersion> = response.results.into_keys().map(UiVersion::new).collect();
        versions.sort();
        Ok(versions)
    }

    async fn bundle_uri(
        &self,
        version: &UiVersion,
        authorization: Option<&str>,
    ) -> UiUpdateResult<Url> {
        let request = DescribeRequest {
            package_name: &self.package_name,
            package_version: version.as_str(),
        };
        let response: DescribeResponse = self
            .post(
                "/package/describe",
                DESCRIBE_REQUEST,
                DESCRIBE_RESPONSE,
                &request,
                authorization,
            )
            .await?;
        select_bundle_uri(version, &response.package.resource.assets.uris)
    }
}

/// Pick and validate the `*-bundle` asset
fn select_bundle_uri(version: &UiVersion, uris: &HashMap<String, String>) -> UiUpdateResult<Url> {
    let mut bundles: Vec<(&String, &String)> = uris
        .iter()
        .filter(|(name, _)| name.ends_with(BUNDLE_SUFFIX))
        .collect();
    bundles.sort();
    let (_, uri) = bundles
        .into_iter()
        .next()
        .ok_or_else(|| UiUpdateError::UiPackageAssetNotFound {
            version: version.as_str().to_string(),
        })?;

    let url = Url::parse(uri).map_err(|e| UiUpdateError::UiPackageAssetBadUri {
        uri: uri.clone(),
        reason: e.to_string(),
    })?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        scheme => Err(UiUpdateError::UiPackageAssetBadUri {
            uri: uri.clone(),
            reason: format!("unsupported scheme '{}'", scheme),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_describe_response_parsing() {
        let body = r#"{
            "package": {
                "name": "dcos-ui",
                "resource": {
                    "assets": {
                        "uris": {
                            "dcos-ui-bundle": "https://downloads.example.com/ui/2.24.4.tar.gz",
                            "readme": "https://downloads.example.com/ui/README"
                        }
                    }
                }
            }
        }"#;
        let response: DescribeResponse = serde_json::from_str(body).unwrap();
        let url = select_bundle_uri(
            &UiVersion::new("2.24.4"),
            &response.package.resource.assets.uris,
        )
        .unwrap();
        assert_eq!(url.as_str(), "https://downloads.example.com/ui/2.24.4.tar.gz");
    }

    #[test]
    fn test_missing_bundle_asset() {
        let response: DescribeResponse = serde_json::from_str(r#"{"package": {}}"#).unwrap();
        let err = select_bundle_uri(&UiVersion::new("1.0"), &response.package.resource.assets.uris)
            .unwrap_err();
        assert!(matches!(err, UiUpdateError::UiPackageAssetNotFound { .. }));
    }

    #[test]
    fn test_bad_bundle_uri() {
        let mut uris = HashMap::new();
        uris.insert("dcos-ui-bundle".to_string(), "not a uri".to_string());
        let err = select_bundle_uri(&UiVersion::new("1.0"), &uris).unwrap_err();
        assert!(matches!(err, UiUpdateError::UiPackageAssetBadUri { .. }));

        uris.insert("dcos-ui-bundle".to_string(), "file:///etc/passwd".to_string());
        let err = select_bundle_uri(&UiVersion::new("1.0"), &uris).unwrap_err();
        assert!(matches!(err, UiUpdateError::UiPackageAssetBadUri { .. }));
    }

    #[test]
    fn test_list_versions_request_shape() {
        let request = ListVersionsRequest {
            package_name: "dcos-ui",
            include_package_versions: true,
        };
        assert_eq!(
            serde_json::to_value(&request).unwrap(),
            serde_json::json!({"packageName": "dcos-ui", "includePackageVersions": true})
        );

        let response: ListVersionsResponse =
            serde_json::from_str(r#"{"results": {"2.24.4": "0", "2.25.0": "1"}}"#).unwrap();
        assert_eq!(response.results.len(), 2);
    }

    #[test]
    fn test_rejects_invalid_registry_url() {
        let config = RegistryConfig {
            url: "::not-a-url".to_string(),
            ..RegistryConfig::default()
        };
        assert!(CosmosClient::new(&config).is_err());
    }
}
