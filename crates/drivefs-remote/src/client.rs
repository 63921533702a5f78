//! HTTP implementation of [`CloudClient`].

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::{header, Client, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, info, warn};

use drivefs_config::DriveConfig;
use drivefs_core::{
    ByteStream, CloudClient, CredentialCell, DriveError, DriveResult, FileKind, ListPage, Quota,
    RemoteFile, RetrySettings, TokenGrant, UploadCompleted, UploadCreateRequest, UploadCreated,
};

use crate::api::{self, BatchRequest, CreateFileRequest};

/// Base URLs the client talks to.
#[derive(Debug, Clone)]
pub struct Endpoints {
    pub base_url: String,
    pub auth_url: String,
}

impl Endpoints {
    fn api(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }
}

/// Drive API client. Cheap to share behind an `Arc`.
pub struct DriveClient {
    http: Client,
    endpoints: Endpoints,
    user_agent: String,
    referer: String,
    page_size: u32,
    url_expire_sec: u64,
    credentials: Arc<CredentialCell>,
    retry: RetrySettings,
}

impl DriveClient {
    pub fn new(config: &DriveConfig, credentials: Arc<CredentialCell>) -> DriveResult<Self> {
        let http = Client::builder()
            .timeout(config.api.timeout.as_duration())
            .build()
            .map_err(|e| DriveError::Other(format!("Failed to create HTTP client: {}", e)))?;

        Ok(DriveClient {
            http,
            endpoints: Endpoints {
                base_url: config.api.base_url.clone(),
                auth_url: config.api.auth_url.clone(),
            },
            user_agent: config.api.user_agent.clone(),
            referer: config.api.referer.clone(),
            page_size: config.listing.page_size,
            url_expire_sec: config.listing.url_expire_sec,
            credentials,
            retry: RetrySettings::from_config(&config.retry),
        })
    }

    pub fn credentials(&self) -> &Arc<CredentialCell> {
        &self.credentials
    }

    pub fn endpoints(&self) -> &Endpoints {
        &self.endpoints
    }

    fn drive_id(&self) -> String {
        self.credentials.load().drive_id.clone()
    }

    async fn send_json<B: Serialize + ?Sized>(
        &self,
        operation: &str,
        url: &str,
        body: &B,
    ) -> DriveResult<Vec<u8>> {
        let token = self.credentials.load().access_token.clone();
        let mut request = self
            .http
            .post(url)
            .header(header::ACCEPT, api::ACCEPT)
            .header(header::USER_AGENT, &self.user_agent)
            .header(header::CONTENT_TYPE, api::CONTENT_TYPE)
            .header(header::ORIGIN, self.referer.trim_end_matches('/'))
            .header(header::REFERER, &self.referer);
        if !token.is_empty() {
            request = request.bearer_auth(token);
        }

        let response = request
            .json(body)
            .send()
            .await
            .map_err(|e| DriveError::transient(operation, e))?;
        let response = check_status(operation, response).await?;
        let bytes = response
            .bytes()
            .await
            .map_err(|e| DriveError::transient(operation, e))?;
        Ok(bytes.to_vec())
    }

    /// POST a JSON body under the read retry policy.
    async fn post_raw<B: Serialize + ?Sized>(
        &self,
        operation: &str,
        url: &str,
        body: &B,
    ) -> DriveResult<Vec<u8>> {
        self.retry
            .read
            .run(operation, |_| self.send_json(operation, url, body))
            .await
    }

    async fn post<B: Serialize + ?Sized, R: DeserializeOwned>(
        &self,
        operation: &str,
        path: &str,
        body: &B,
    ) -> DriveResult<R> {
        let bytes = self.post_raw(operation, &self.endpoints.api(path), body).await?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

/// Map HTTP status to the error taxonomy.
async fn check_status(operation: &str, response: Response) -> DriveResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let message = response.text().await.unwrap_or_default();
    match status {
        StatusCode::NOT_FOUND => Err(DriveError::NotFound(format!("{}: {}", operation, message))),
        StatusCode::CONFLICT => Err(DriveError::RemoteConflict(operation.to_string())),
        _ => Err(DriveError::Remote {
            operation: operation.to_string(),
            status: status.as_u16(),
            message,
        }),
    }
}

struct HttpByteStream {
    response: Response,
}

#[async_trait]
impl ByteStream for HttpByteStream {
    async fn next_chunk(&mut self) -> DriveResult<Option<Vec<u8>>> {
        let chunk = self
            .response
            .chunk()
            .await
            .map_err(|e| DriveError::transient("download", e))?;
        Ok(chunk.map(|b| b.to_vec()))
    }
}

#[async_trait]
impl CloudClient for DriveClient {
    fn access_token(&self) -> String {
        self.credentials.load().access_token.clone()
    }

    async fn list(
        &self,
        parent_id: &str,
        marker: Option<&str>,
        kind: Option<FileKind>,
    ) -> DriveResult<ListPage> {
        let drive_id = self.drive_id();
        let body = api::ListRequest {
            drive_id: &drive_id,
            parent_file_id: parent_id,
            limit: self.page_size,
            all: false,
            url_expire_sec: self.url_expire_sec,
            fields: "*",
            order_by: "updated_at",
            order_direction: "DESC",
            marker,
            kind: kind.map(|k| k.as_str()),
        };
        debug!(parent = %parent_id, marker = ?marker, "list");
        self.post("list", api::LIST, &body).await
    }

    async fn detail(&self, file_id: &str) -> DriveResult<RemoteFile> {
        let drive_id = self.drive_id();
        let body = api::FileRef {
            drive_id: &drive_id,
            file_id,
        };
        self.post("detail", api::DETAIL, &body).await
    }

    async fn path(&self, file_id: &str) -> DriveResult<Vec<RemoteFile>> {
        let drive_id = self.drive_id();
        let body = api::FileRef {
            drive_id: &drive_id,
            file_id,
        };
        let response: api::ItemsResponse = self.post("path", api::PATH, &body).await?;
        Ok(response.items)
    }

    async fn mkdir(&self, parent_id: &str, name: &str) -> DriveResult<RemoteFile> {
        let drive_id = self.drive_id();
        let body = api::MkdirRequest {
            drive_id: &drive_id,
            parent_file_id: parent_id,
            name,
            check_name_mode: "refuse",
            kind: FileKind::Folder.as_str(),
        };
        info!(parent = %parent_id, name, "mkdir");
        let mut folder: RemoteFile = self.post("mkdir", api::CREATE, &body).await?;
        if folder.parent_file_id.is_empty() {
            folder.parent_file_id = parent_id.to_string();
        }
        Ok(folder)
    }

    async fn rename(&self, file_id: &str, new_name: &str) -> DriveResult<RemoteFile> {
        let drive_id = self.drive_id();
        let body = api::RenameRequest {
            drive_id: &drive_id,
            file_id,
            name: new_name,
            check_name_mode: "refuse",
        };
        info!(file = %file_id, name = new_name, "rename");
        self.post("rename", api::UPDATE, &body).await
    }

    async fn trash(&self, file_id: &str) -> DriveResult<()> {
        let drive_id = self.drive_id();
        let body = api::FileRef {
            drive_id: &drive_id,
            file_id,
        };
        info!(file = %file_id, "trash");
        self.post_raw("trash", &self.endpoints.api(api::TRASH), &body)
            .await
            .map(|_| ())
    }

    async fn search(
        &self,
        parent_id: &str,
        name: &str,
        kind: FileKind,
    ) -> DriveResult<Vec<RemoteFile>> {
        let drive_id = self.drive_id();
        let body = api::SearchRequest {
            drive_id: &drive_id,
            query: api::search_query(parent_id, name, kind.as_str()),
            order_by: "name ASC",
            limit: 200,
        };
        let response: api::ItemsResponse = self.post("search", api::SEARCH, &body).await?;
        Ok(response.items)
    }

    async fn move_file(&self, file_id: &str, dest_parent_id: &str) -> DriveResult<()> {
        let drive_id = self.drive_id();
        let body = BatchRequest::move_one(&drive_id, file_id, dest_parent_id);
        info!(file = %file_id, to = %dest_parent_id, "move");
        let response: api::BatchResponse = self.post("move", api::BATCH, &body).await?;

        match response.responses.iter().find(|r| r.id == file_id) {
            Some(result) if (200..300).contains(&result.status) => Ok(()),
            Some(result) if result.status == 404 => Err(DriveError::NotFound(file_id.to_string())),
            Some(result) => Err(DriveError::Remote {
                operation: "move".to_string(),
                status: result.status,
                message: format!("batch move of {} rejected", file_id),
            }),
            None => Err(DriveError::Remote {
                operation: "move".to_string(),
                status: 0,
                message: "batch response missing entry".to_string(),
            }),
        }
    }

    async fn upload_create(&self, request: &UploadCreateRequest) -> DriveResult<UploadCreated> {
        let drive_id = self.drive_id();
        let body = CreateFileRequest::new(
            &drive_id,
            &request.parent_file_id,
            &request.name,
            request.size,
            request.part_count,
            &request.probe,
        );
        let response: api::CreateFileResponse = self
            .post("upload_create", api::CREATE, &body)
            .await
            .map_err(|e| match e {
                DriveError::RemoteConflict(_) => DriveError::RemoteConflict(request.name.clone()),
                other => other,
            })?;

        Ok(UploadCreated {
            file_id: response.file_id,
            upload_id: response.upload_id.filter(|id| !id.is_empty()),
            rapid_upload: response.rapid_upload,
            part_urls: response
                .part_info_list
                .into_iter()
                .map(|p| p.upload_url)
                .collect(),
        })
    }

    async fn upload_urls(
        &self,
        file_id: &str,
        upload_id: &str,
        part_numbers: &[u32],
    ) -> DriveResult<Vec<String>> {
        let drive_id = self.drive_id();
        let body = api::UploadUrlRequest {
            drive_id: &drive_id,
            part_info_list: api::part_numbers(part_numbers.iter().copied()),
            file_id,
            upload_id,
        };
        let response: api::UploadUrlResponse =
            self.post("upload_urls", api::UPLOAD_URL, &body).await?;
        Ok(response
            .part_info_list
            .into_iter()
            .map(|p| p.upload_url)
            .collect())
    }

    async fn upload_part(&self, url: &str, data: Vec<u8>) -> DriveResult<()> {
        self.retry
            .part
            .run("upload_part", |attempt| {
                let data = data.clone();
                async move {
                    if attempt > 0 {
                        debug!(attempt, "re-sending part");
                    }
                    let response = self
                        .http
                        .put(url)
                        .header(header::REFERER, &self.referer)
                        .body(data)
                        .send()
                        .await
                        .map_err(|e| DriveError::transient("upload_part", e))?;
                    let status = response.status();
                    if status.is_success() {
                        return Ok(());
                    }
                    let message = response.text().await.unwrap_or_default();
                    warn!(status = status.as_u16(), "part upload rejected");
                    // Any rejected part is retried.
                    Err(DriveError::transient(
                        "upload_part",
                        std::io::Error::other(format!("{}: {}", status, message)),
                    ))
                }
            })
            .await
    }

    async fn upload_complete(
        &self,
        file_id: &str,
        upload_id: &str,
    ) -> DriveResult<UploadCompleted> {
        let drive_id = self.drive_id();
        let body = api::CompleteRequest {
            drive_id: &drive_id,
            file_id,
            upload_id,
        };
        let completed: UploadCompleted = self.post("upload_complete", api::COMPLETE, &body).await?;
        info!(file = %completed.file_id, name = %completed.name, size = completed.size, "upload complete");
        Ok(completed)
    }

    async fn download_url(&self, file_id: &str) -> DriveResult<String> {
        let drive_id = self.drive_id();
        let body = api::FileRef {
            drive_id: &drive_id,
            file_id,
        };
        let response: api::DownloadUrlResponse =
            self.post("download_url", api::DOWNLOAD_URL, &body).await?;
        if response.url.is_empty() {
            return Err(DriveError::NotFound(format!("download url for {}", file_id)));
        }
        Ok(response.url)
    }

    async fn open_range(&self, url: &str, offset: u64) -> DriveResult<Box<dyn ByteStream>> {
        let response = self
            .retry
            .read
            .run("open_range", |_| async move {
                let response = self
                    .http
                    .get(url)
                    .header(header::REFERER, &self.referer)
                    .header(header::RANGE, format!("bytes={}-", offset))
                    .send()
                    .await
                    .map_err(|e| DriveError::transient("open_range", e))?;
                check_status("open_range", response).await
            })
            .await?;
        Ok(Box::new(HttpByteStream { response }))
    }

    async fn quota(&self) -> DriveResult<Quota> {
        let info: api::PersonalInfo = self
            .post("quota", api::PERSONAL_INFO, &serde_json::json!({}))
            .await?;
        Ok(Quota {
            total: info.personal_space_info.total_size,
            used: info.personal_space_info.used_size,
        })
    }

    async fn refresh_token(&self, refresh_token: &str) -> DriveResult<TokenGrant> {
        let body = api::RefreshRequest { refresh_token };
        let bytes = self
            .post_raw("refresh_token", &self.endpoints.auth_url, &body)
            .await?;
        let grant: TokenGrant = serde_json::from_slice(&bytes)?;
        if grant.access_token.is_empty() {
            return Err(DriveError::Remote {
                operation: "refresh_token".to_string(),
                status: 401,
                message: "empty access token in grant".to_string(),
            });
        }
        Ok(grant)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use drivefs_core::Credentials;

    fn client(base: &str) -> DriveClient {
        let mut config = DriveConfig::default();
        config.api.base_url = base.to_string();
        DriveClient::new(
            &config,
            Arc::new(CredentialCell::new(Credentials::unauthenticated("r"))),
        )
        .unwrap()
    }

    #[test]
    fn test_endpoint_join() {
        let c = client("https://api.example.com/");
        assert_eq!(
            c.endpoints().api(api::LIST),
            "https://api.example.com/adrive/v3/file/list"
        );
    }

    #[test]
    fn test_access_token_reads_cell() {
        let c = client("https://api.example.com");
        assert_eq!(c.access_token(), "");
        c.credentials().store(Credentials {
            access_token: "a1".to_string(),
            refresh_token: "r".to_string(),
            drive_id: "d".to_string(),
            expires_at: None,
        });
        assert_eq!(c.access_token(), "a1");
        assert_eq!(c.drive_id(), "d");
    }

    #[tokio::test]
    async fn test_unreachable_host_is_transient() {
        let mut config = DriveConfig::default();
        config.api.base_url = "http://127.0.0.1:9".to_string();
        config.retry.read_attempts = 1;
        let c = DriveClient::new(
            &config,
            Arc::new(CredentialCell::new(Credentials::unauthenticated("r"))),
        )
        .unwrap();
        let err = c.detail("f1").await.unwrap_err();
        assert!(err.is_transient());
    }
}
