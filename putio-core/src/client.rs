use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

pub const DEFAULT_BASE_URL: &str = "https://api.put.io";
const FOLDER_CONTENT_TYPE: &str = "application/x-directory";
const FOLDER_FILE_TYPE: &str = "FOLDER";

/// Id of the account's root folder.
pub const ROOT_FOLDER_ID: i64 = 0;

#[derive(Debug, Error)]
pub enum PutioError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    #[error("api returned {status}: {body}")]
    Api { status: StatusCode, body: String },
}

#[derive(Clone)]
pub struct PutioClient {
    http: Client,
    base_url: Url,
    token: String,
}

impl PutioClient {
    pub fn new(token: impl Into<String>) -> Result<Self, PutioError> {
        Self::with_base_url(DEFAULT_BASE_URL, token)
    }

    pub fn with_base_url(base_url: &str, token: impl Into<String>) -> Result<Self, PutioError> {
        Ok(Self {
            http: Client::new(),
            base_url: Url::parse(base_url)?,
            token: token.into(),
        })
    }

    /// Lists the direct children of a folder. Only the first page is returned;
    /// follow `cursor` with [`PutioClient::continue_listing`] for the rest.
    pub async fn list_folder(
        &self,
        parent_id: i64,
        per_page: Option<u32>,
    ) -> Result<FileList, PutioError> {
        let mut url = self.endpoint("/v2/files/list")?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("parent_id", &parent_id.to_string());
            if let Some(per_page) = per_page {
                query.append_pair("per_page", &per_page.to_string());
            }
        }
        let response = self
            .http
            .get(url)
            .header("Authorization", self.auth_header_value())
            .send()
            .await?;
        Self::handle_response(response).await
    }

    pub async fn continue_listing(
        &self,
        cursor: &str,
        per_page: Option<u32>,
    ) -> Result<FileListPage, PutioError> {
        let url = self.endpoint("/v2/files/list/continue")?;
        let mut form = vec![("cursor", cursor.to_string())];
        if let Some(per_page) = per_page {
            form.push(("per_page", per_page.to_string()));
        }
        let response = self
            .http
            .post(url)
            .header("Authorization", self.auth_header_value())
            .form(&form)
            .send()
            .await?;
        Self::handle_response(response).await
    }

    /// Lists every child of a folder, following listing cursors until the
    /// server stops returning one.
    pub async fn list_folder_all(
        &self,
        parent_id: i64,
        per_page: u32,
    ) -> Result<Vec<File>, PutioError> {
        let per_page = per_page.max(1);
        let first = self.list_folder(parent_id, Some(per_page)).await?;
        let mut files = first.files;
        let mut cursor = first.cursor;
        while let Some(next) = cursor.filter(|c| !c.is_empty()) {
            let page = self.continue_listing(&next, Some(per_page)).await?;
            files.extend(page.files);
            cursor = page.cursor;
        }
        Ok(files)
    }

    /// Resolves a short-lived direct download URL for a file.
    pub async fn get_download_url(&self, file_id: i64) -> Result<Url, PutioError> {
        let url = self.endpoint(&format!("/v2/files/{file_id}/url"))?;
        let response = self
            .http
            .get(url)
            .header("Authorization", self.auth_header_value())
            .send()
            .await?;
        let link: DownloadLink = Self::handle_response(response).await?;
        Ok(link.url)
    }

    fn auth_header_value(&self) -> String {
        format!("Bearer {}", self.token)
    }

    fn endpoint(&self, path: &str) -> Result<Url, PutioError> {
        Ok(self.base_url.join(path)?)
    }

    async fn handle_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, PutioError> {
        if response.status().is_success() {
            Ok(response.json::<T>().await?)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(PutioError::Api { status, body })
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct File {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub content_type: Option<String>,
    #[serde(default)]
    pub file_type: Option<String>,
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default)]
    pub parent_id: Option<i64>,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub updated_at: Option<String>,
}

impl File {
    pub fn is_dir(&self) -> bool {
        self.content_type.as_deref() == Some(FOLDER_CONTENT_TYPE)
            || self.file_type.as_deref() == Some(FOLDER_FILE_TYPE)
    }
}

#[derive(Debug, Deserialize, Serialize)]
pub struct FileList {
    pub files: Vec<File>,
    #[serde(default)]
    pub parent: Option<File>,
    #[serde(default)]
    pub cursor: Option<String>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct FileListPage {
    pub files: Vec<File>,
    #[serde(default)]
    pub cursor: Option<String>,
}

#[derive(Debug, Deserialize, Serialize)]
struct DownloadLink {
    url: Url,
}
