use reqwest::{Client, RequestBuilder, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

const DEFAULT_BASE_URL: &str = "https://cloud-api.yandex.net";
const ALREADY_EXISTS_ERROR: &str = "DiskPathPointsToExistentDirectoryError";
const NOT_FOUND_ERROR: &str = "DiskNotFoundError";

/// Fields requested for listings and resource lookups.
pub const RESOURCE_FIELDS: &[&str] = &[
    "path",
    "name",
    "type",
    "size",
    "modified",
    "sha256",
    "md5",
    "custom_properties",
];

#[derive(Debug, Error)]
pub enum YadiskError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    #[error("api returned {status}: {body}")]
    Api {
        status: StatusCode,
        error: Option<String>,
        body: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiErrorClass {
    Auth,
    RateLimit,
    Transient,
    Permanent,
}

/// Result of a call that the service may finish asynchronously.
#[derive(Debug, PartialEq, Eq)]
pub enum Completion {
    Done,
    /// HTTP 202: poll the link with [`YadiskClient::get_operation_status`].
    Pending(TransferLink),
}

#[derive(Clone)]
pub struct YadiskClient {
    http: Client,
    base_url: Url,
    token: String,
}

impl YadiskClient {
    pub fn new(token: impl Into<String>) -> Result<Self, YadiskError> {
        Self::with_base_url(DEFAULT_BASE_URL, token)
    }

    pub fn with_base_url(base_url: &str, token: impl Into<String>) -> Result<Self, YadiskError> {
        Ok(Self {
            http: Client::new(),
            base_url: Url::parse(base_url)?,
            token: token.into(),
        })
    }

    pub async fn get_disk_info(&self) -> Result<DiskInfo, YadiskError> {
        let mut url = self.endpoint("/v1/disk")?;
        url.query_pairs_mut()
            .append_pair("fields", "total_space,used_space,trash_size,is_paid");
        let response = self.authorized(self.http.get(url)).send().await?;
        Self::handle_response(response).await
    }

    pub async fn get_resource(&self, path: &str) -> Result<Resource, YadiskError> {
        self.get_resource_with_fields(path, Some(RESOURCE_FIELDS))
            .await
    }

    pub async fn get_resource_with_fields(
        &self,
        path: &str,
        fields: Option<&[&str]>,
    ) -> Result<Resource, YadiskError> {
        let mut url = self.endpoint("/v1/disk/resources")?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("path", path);
            if let Some(fields) = fields.filter(|f| !f.is_empty()) {
                query.append_pair("fields", &fields.join(","));
            }
        }
        let response = self.authorized(self.http.get(url)).send().await?;
        Self::handle_response(response).await
    }

    /// Merges `properties` into the resource's `custom_properties`.
    pub async fn set_custom_properties(
        &self,
        path: &str,
        properties: serde_json::Map<String, serde_json::Value>,
    ) -> Result<Resource, YadiskError> {
        let mut url = self.endpoint("/v1/disk/resources")?;
        url.query_pairs_mut()
            .append_pair("path", path)
            .append_pair("fields", "path,name,type,custom_properties");
        let body = serde_json::json!({ "custom_properties": properties });
        let response = self
            .authorized(self.http.patch(url))
            .json(&body)
            .send()
            .await?;
        Self::handle_response(response).await
    }

    pub async fn create_folder(&self, path: &str) -> Result<(), YadiskError> {
        let mut url = self.endpoint("/v1/disk/resources")?;
        url.query_pairs_mut().append_pair("path", path);
        let response = self.authorized(self.http.put(url)).send().await?;
        Self::handle_empty(response).await
    }

    pub async fn move_resource(
        &self,
        from: &str,
        path: &str,
        overwrite: bool,
    ) -> Result<Completion, YadiskError> {
        let url = self.transfer_endpoint("/v1/disk/resources/move", from, path, overwrite)?;
        let response = self.authorized(self.http.post(url)).send().await?;
        Self::handle_completion(response).await
    }

    pub async fn copy_resource(
        &self,
        from: &str,
        path: &str,
        overwrite: bool,
    ) -> Result<Completion, YadiskError> {
        let url = self.transfer_endpoint("/v1/disk/resources/copy", from, path, overwrite)?;
        let response = self.authorized(self.http.post(url)).send().await?;
        Self::handle_completion(response).await
    }

    pub async fn delete_resource(
        &self,
        path: &str,
        permanently: bool,
    ) -> Result<Completion, YadiskError> {
        let mut url = self.endpoint("/v1/disk/resources")?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("path", path);
            if permanently {
                query.append_pair("permanently", "true");
            }
        }
        let response = self.authorized(self.http.delete(url)).send().await?;
        Self::handle_completion(response).await
    }

    /// Empties the remote trash bin.
    pub async fn empty_trash(&self) -> Result<Completion, YadiskError> {
        let url = self.endpoint("/v1/disk/trash/resources")?;
        let response = self.authorized(self.http.delete(url)).send().await?;
        Self::handle_completion(response).await
    }

    pub async fn get_operation_status(
        &self,
        operation_url: &str,
    ) -> Result<OperationStatus, YadiskError> {
        let url = Url::parse(operation_url)?;
        let response = self.authorized(self.http.get(url)).send().await?;
        let info: OperationInfo = Self::handle_response(response).await?;
        Ok(info.status)
    }

    /// One page of the flat listing of every file on the disk, sorted by path.
    pub async fn list_files(&self, limit: u32, offset: u32) -> Result<FilePage, YadiskError> {
        let mut url = self.endpoint("/v1/disk/resources/files")?;
        url.query_pairs_mut()
            .append_pair("limit", &limit.max(1).to_string())
            .append_pair("offset", &offset.to_string())
            .append_pair("sort", "path")
            .append_pair(
                "fields",
                &RESOURCE_FIELDS
                    .iter()
                    .map(|field| format!("items.{field}"))
                    .collect::<Vec<_>>()
                    .join(","),
            );
        let response = self.authorized(self.http.get(url)).send().await?;
        Self::handle_response(response).await
    }

    pub async fn last_uploaded(&self, limit: u32) -> Result<FilePage, YadiskError> {
        let mut url = self.endpoint("/v1/disk/resources/last-uploaded")?;
        url.query_pairs_mut()
            .append_pair("limit", &limit.max(1).to_string())
            .append_pair("fields", "items.path,items.name,items.type");
        let response = self.authorized(self.http.get(url)).send().await?;
        Self::handle_response(response).await
    }

    pub async fn get_download_link(&self, path: &str) -> Result<TransferLink, YadiskError> {
        let mut url = self.endpoint("/v1/disk/resources/download")?;
        url.query_pairs_mut().append_pair("path", path);
        let response = self.authorized(self.http.get(url)).send().await?;
        Self::handle_response(response).await
    }

    pub async fn get_upload_link(
        &self,
        path: &str,
        overwrite: bool,
    ) -> Result<TransferLink, YadiskError> {
        let mut url = self.endpoint("/v1/disk/resources/upload")?;
        url.query_pairs_mut()
            .append_pair("path", path)
            .append_pair("overwrite", if overwrite { "true" } else { "false" });
        let response = self.authorized(self.http.get(url)).send().await?;
        Self::handle_response(response).await
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        request
            .header("Authorization", format!("OAuth {}", self.token))
            .header("Accept", "application/json")
    }

    fn endpoint(&self, path: &str) -> Result<Url, YadiskError> {
        Ok(self.base_url.join(path)?)
    }

    fn transfer_endpoint(
        &self,
        endpoint: &str,
        from: &str,
        path: &str,
        overwrite: bool,
    ) -> Result<Url, YadiskError> {
        let mut url = self.endpoint(endpoint)?;
        url.query_pairs_mut()
            .append_pair("from", from)
            .append_pair("path", path)
            .append_pair("overwrite", if overwrite { "true" } else { "false" });
        Ok(url)
    }

    async fn handle_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, YadiskError> {
        if response.status().is_success() {
            Ok(response.json::<T>().await?)
        } else {
            Err(Self::api_error(response).await)
        }
    }

    async fn handle_empty(response: reqwest::Response) -> Result<(), YadiskError> {
        if response.status().is_success() {
            Ok(())
        } else {
            Err(Self::api_error(response).await)
        }
    }

    async fn handle_completion(response: reqwest::Response) -> Result<Completion, YadiskError> {
        match response.status() {
            StatusCode::ACCEPTED => Ok(Completion::Pending(response.json().await?)),
            status if status.is_success() => Ok(Completion::Done),
            _ => Err(Self::api_error(response).await),
        }
    }

    async fn api_error(response: reqwest::Response) -> YadiskError {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        let error = serde_json::from_str::<ApiErrorBody>(&body)
            .ok()
            .and_then(|parsed| parsed.error);
        YadiskError::Api {
            status,
            error,
            body,
        }
    }
}

impl YadiskError {
    pub fn classification(&self) -> Option<ApiErrorClass> {
        match self {
            YadiskError::Api { status, .. } => Some(classify_api_status(*status)),
            _ => None,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self.classification(),
            Some(ApiErrorClass::RateLimit | ApiErrorClass::Transient)
        )
    }

    pub fn is_not_found(&self) -> bool {
        match self {
            YadiskError::Api { status, error, .. } => {
                *status == StatusCode::NOT_FOUND || error.as_deref() == Some(NOT_FOUND_ERROR)
            }
            _ => false,
        }
    }

    /// `mkdir` on a directory that already exists.
    pub fn is_already_exists(&self) -> bool {
        matches!(
            self,
            YadiskError::Api { error: Some(error), .. } if error == ALREADY_EXISTS_ERROR
        )
    }
}

fn classify_api_status(status: StatusCode) -> ApiErrorClass {
    if matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) {
        ApiErrorClass::Auth
    } else if status == StatusCode::TOO_MANY_REQUESTS {
        ApiErrorClass::RateLimit
    } else if status.is_server_error()
        || matches!(
            status,
            StatusCode::REQUEST_TIMEOUT | StatusCode::CONFLICT | StatusCode::TOO_EARLY
        )
    {
        ApiErrorClass::Transient
    } else {
        ApiErrorClass::Permanent
    }
}

#[derive(Debug, Deserialize, Serialize)]
pub struct DiskInfo {
    pub total_space: u64,
    pub used_space: u64,
    #[serde(default)]
    pub trash_size: u64,
    #[serde(default)]
    pub is_paid: bool,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct Resource {
    pub path: String,
    pub name: String,
    #[serde(rename = "type")]
    pub resource_type: ResourceType,
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default)]
    pub modified: Option<String>,
    #[serde(default)]
    pub sha256: Option<String>,
    #[serde(default)]
    pub md5: Option<String>,
    #[serde(default)]
    pub custom_properties: Option<serde_json::Map<String, serde_json::Value>>,
}

#[derive(Debug, Deserialize, Serialize, PartialEq, Eq, Clone, Copy)]
#[serde(rename_all = "lowercase")]
pub enum ResourceType {
    File,
    Dir,
}

#[derive(Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum OperationStatus {
    Success,
    Failure,
    InProgress,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct OperationInfo {
    pub status: OperationStatus,
}

/// Page of the flat file listing (`/resources/files`, `/resources/last-uploaded`).
#[derive(Debug, Deserialize, Serialize)]
pub struct FilePage {
    pub items: Vec<Resource>,
    #[serde(default)]
    pub limit: Option<u32>,
    #[serde(default)]
    pub offset: Option<u32>,
}

#[derive(Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct TransferLink {
    pub href: Url,
    pub method: String,
    #[serde(default)]
    pub templated: bool,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    #[serde(default)]
    error: Option<String>,
}
