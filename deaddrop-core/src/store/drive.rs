use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, Response, StatusCode};
use serde::Deserialize;
use tracing::debug;
use uuid::Uuid;

use super::{BlobMeta, BlobStore, StoreError};

pub const DEFAULT_API: &str = "https://www.googleapis.com";
const PAGE_SIZE: &str = "1000";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileList {
    next_page_token: Option<String>,
    #[serde(default)]
    files: Vec<DriveFile>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DriveFile {
    id: String,
    name: String,
    created_time: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct Created {
    id: String,
}

/// Google Drive v3 over plain REST. Folders are Drive folder ids.
///
/// The bearer token is supplied from outside; refreshing it is the
/// operator's job.
pub struct DriveStore {
    client: Client,
    api: String,
    token: String,
}

impl DriveStore {
    pub fn new(api: &str, token: String) -> Result<Self, StoreError> {
        let client = Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            client,
            api: api.trim_end_matches('/').to_string(),
            token,
        })
    }

    fn files_url(&self) -> String {
        format!("{}/drive/v3/files", self.api)
    }

    async fn check(resp: Response) -> Result<Response, StoreError> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        Err(StoreError::Status { status, body })
    }
}

/// `multipart/related` body: JSON metadata part followed by the media part.
fn multipart_related(boundary: &str, metadata: &serde_json::Value, data: &[u8]) -> Vec<u8> {
    let mut body = Vec::with_capacity(data.len() + 256);
    body.extend_from_slice(
        format!("--{boundary}\r\nContent-Type: application/json; charset=UTF-8\r\n\r\n{metadata}\r\n")
            .as_bytes(),
    );
    body.extend_from_slice(
        format!("--{boundary}\r\nContent-Type: application/octet-stream\r\n\r\n").as_bytes(),
    );
    body.extend_from_slice(data);
    body.extend_from_slice(format!("\r\n--{boundary}--\r\n").as_bytes());
    body
}

#[async_trait]
impl BlobStore for DriveStore {
    async fn upload(&self, folder: &str, name: &str, data: Vec<u8>) -> Result<String, StoreError> {
        let boundary = format!("deaddrop-{}", Uuid::new_v4().simple());
        let metadata = serde_json::json!({ "name": name, "parents": [folder] });
        let body = multipart_related(&boundary, &metadata, &data);

        let resp = self
            .client
            .post(format!("{}/upload/drive/v3/files", self.api))
            .query(&[("uploadType", "multipart"), ("fields", "id")])
            .bearer_auth(&self.token)
            .header(
                CONTENT_TYPE,
                format!("multipart/related; boundary={boundary}"),
            )
            .body(body)
            .send()
            .await?;

        let created: Created = Self::check(resp).await?.json().await?;
        debug!("Uploaded {name} as {}", created.id);
        Ok(created.id)
    }

    async fn list(&self, folder: &str) -> Result<Vec<BlobMeta>, StoreError> {
        let query = format!("'{folder}' in parents and trashed = false");
        let mut blobs = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let mut req = self
                .client
                .get(self.files_url())
                .bearer_auth(&self.token)
                .query(&[
                    ("q", query.as_str()),
                    ("fields", "nextPageToken, files(id, name, createdTime)"),
                    ("pageSize", PAGE_SIZE),
                ]);
            if let Some(token) = &page_token {
                req = req.query(&[("pageToken", token.as_str())]);
            }

            let page: FileList = Self::check(req.send().await?).await?.json().await?;
            blobs.extend(page.files.into_iter().map(|f| BlobMeta {
                id: f.id,
                name: f.name,
                created: f.created_time,
            }));

            match page.next_page_token {
                Some(next) => page_token = Some(next),
                None => break,
            }
        }

        Ok(blobs)
    }

    async fn download(&self, id: &str) -> Result<Vec<u8>, StoreError> {
        let resp = self
            .client
            .get(format!("{}/{id}", self.files_url()))
            .query(&[("alt", "media")])
            .bearer_auth(&self.token)
            .send()
            .await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Err(StoreError::NotFound(id.to_string()));
        }
        let bytes = Self::check(resp).await?.bytes().await?;
        Ok(bytes.to_vec())
    }

    async fn delete(&self, id: &str) -> Result<(), StoreError> {
        let resp = self
            .client
            .delete(format!("{}/{id}", self.files_url()))
            .bearer_auth(&self.token)
            .send()
            .await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Err(StoreError::NotFound(id.to_string()));
        }
        Self::check(resp).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_multipart_related_layout() {
        let metadata = serde_json::json!({ "name": "a_1.request.enc", "parents": ["F"] });
        let body = multipart_related("B", &metadata, b"\x00\x01");
        let text = String::from_utf8_lossy(&body);

        assert!(text.starts_with("--B\r\nContent-Type: application/json; charset=UTF-8\r\n\r\n{"));
        assert!(text.contains("\"name\":\"a_1.request.enc\""));
        assert!(text.contains("--B\r\nContent-Type: application/octet-stream\r\n\r\n"));
        assert!(body.ends_with(b"\x00\x01\r\n--B--\r\n"));
    }

    #[test]
    fn test_file_list_parses_drive_json() {
        let json = r#"{
            "nextPageToken": "p2",
            "files": [
                {"id": "1x", "name": "s_1.response.enc", "createdTime": "2024-05-01T10:00:00.123Z"}
            ]
        }"#;
        let page: FileList = serde_json::from_str(json).unwrap();
        assert_eq!(page.next_page_token.as_deref(), Some("p2"));
        assert_eq!(page.files[0].id, "1x");
        assert_eq!(page.files[0].name, "s_1.response.enc");

        let empty: FileList = serde_json::from_str("{}").unwrap();
        assert!(empty.files.is_empty());
        assert!(empty.next_page_token.is_none());
    }

    #[test]
    fn test_trims_api_base() {
        let store = DriveStore::new("http://localhost:9000/", "t".to_string()).unwrap();
        assert_eq!(store.files_url(), "http://localhost:9000/drive/v3/files");
    }
}
