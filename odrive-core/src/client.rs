use reqwest::header::{CONTENT_LENGTH, CONTENT_RANGE};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use url::Url;

const DEFAULT_BASE_URL: &str = "https://graph.microsoft.com";

#[derive(Debug, Error)]
pub enum GraphError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    #[error("api returned {status}: {code}")]
    Api {
        status: StatusCode,
        code: String,
        message: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiErrorClass {
    Auth,
    RateLimit,
    Transient,
    Permanent,
}

#[derive(Clone)]
pub struct GraphClient {
    http: Client,
    base_url: Url,
    token: String,
}

impl GraphClient {
    pub fn new(token: impl Into<String>) -> Result<Self, GraphError> {
        Self::with_base_url(DEFAULT_BASE_URL, token)
    }

    pub fn with_base_url(base_url: &str, token: impl Into<String>) -> Result<Self, GraphError> {
        Ok(Self {
            http: Client::new(),
            base_url: Url::parse(base_url)?,
            token: token.into(),
        })
    }

    pub async fn get_user(&self) -> Result<User, GraphError> {
        let url = self.endpoint("/v1.0/me")?;
        let response = self
            .http
            .get(url)
            .header("Authorization", self.auth_header_value())
            .send()
            .await?;
        Self::handle_response(response).await
    }

    pub async fn list_calendar_events(&self) -> Result<Vec<CalendarEvent>, GraphError> {
        let mut url = self.endpoint("/v1.0/me/events")?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("$select", "subject,organizer,start,end");
            query.append_pair("$orderby", "createdDateTime DESC");
        }
        let response = self
            .http
            .get(url)
            .header("Authorization", self.auth_header_value())
            .send()
            .await?;
        let payload: Collection<CalendarEvent> = Self::handle_response(response).await?;
        Ok(payload.value)
    }

    pub async fn get_object(&self, path: &str) -> Result<DriveItem, GraphError> {
        let url = if path.is_empty() || path == "/" {
            self.endpoint("/v1.0/me/drive/root")?
        } else {
            self.endpoint(&format!("/v1.0/me/drive/root:{path}"))?
        };
        let response = self
            .http
            .get(url)
            .header("Authorization", self.auth_header_value())
            .send()
            .await?;
        Self::handle_response(response).await
    }

    /// Fetches one page of a folder's children. When `cursor` is set it is
    /// the opaque continuation link from the previous page and is requested
    /// verbatim; the folder path is ignored in that case.
    pub async fn list_children(
        &self,
        folder_path: &str,
        cursor: Option<&str>,
        only_folders: bool,
    ) -> Result<ChildrenPage, GraphError> {
        let url = match cursor {
            Some(link) => Url::parse(link)?,
            None => {
                let mut url = if folder_path.is_empty() || folder_path == "/" {
                    self.endpoint("/v1.0/me/drive/root/children")?
                } else {
                    self.endpoint(&format!("/v1.0/me/drive/root:{folder_path}:/children"))?
                };
                if only_folders {
                    url.query_pairs_mut()
                        .append_pair("$filter", "folder ne null");
                }
                url
            }
        };
        let response = self
            .http
            .get(url)
            .header("Authorization", self.auth_header_value())
            .send()
            .await?;
        let payload: ChildrenResponse = Self::handle_response(response).await?;
        Ok(ChildrenPage {
            items: payload.value,
            next_link: payload.next_link,
        })
    }

    pub async fn create_folder(
        &self,
        parent_path: &str,
        name: &str,
    ) -> Result<DriveItem, GraphError> {
        let url = if parent_path.is_empty() || parent_path == "/" {
            self.endpoint("/v1.0/me/drive/root/children")?
        } else {
            self.endpoint(&format!("/v1.0/me/drive/root:{parent_path}:/children"))?
        };
        let body = json!({
            "name": name,
            "folder": {},
            "@microsoft.graph.conflictBehavior": "fail",
        });
        let response = self
            .http
            .post(url)
            .header("Authorization", self.auth_header_value())
            .json(&body)
            .send()
            .await?;
        Self::handle_response(response).await
    }

    pub async fn create_upload_session(
        &self,
        folder_path: &str,
        file_name: &str,
        conflict: ConflictBehavior,
    ) -> Result<UploadSession, GraphError> {
        let item_path = if folder_path.is_empty() || folder_path == "/" {
            format!("/{file_name}")
        } else {
            format!("{folder_path}/{file_name}")
        };
        let url = self.endpoint(&format!(
            "/v1.0/me/drive/root:{item_path}:/createUploadSession"
        ))?;
        let body = json!({
            "item": {
                "@odata.type": "microsoft.graph.driveItemUploadableProperties",
                "@microsoft.graph.conflictBehavior": conflict.as_str(),
            }
        });
        let response = self
            .http
            .post(url)
            .header("Authorization", self.auth_header_value())
            .json(&body)
            .send()
            .await?;
        Self::handle_response(response).await
    }

    /// Sends one byte range to an upload session. Session URLs are
    /// pre-authenticated, so no Authorization header is attached.
    pub async fn upload_range(
        &self,
        session_url: &Url,
        range: ByteRange,
        total_size: u64,
        bytes: Vec<u8>,
    ) -> Result<RangeAck, GraphError> {
        let response = self
            .http
            .put(session_url.clone())
            .header(CONTENT_LENGTH, range.size())
            .header(CONTENT_RANGE, range.content_range(total_size))
            .body(bytes)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(Self::api_error(response).await);
        }
        if status == StatusCode::OK || status == StatusCode::CREATED {
            let item = response.json::<DriveItem>().await?;
            return Ok(RangeAck::Completed { item });
        }
        let progress = response.json::<UploadProgress>().await.unwrap_or_default();
        Ok(RangeAck::Accepted {
            next_expected_ranges: progress.next_expected_ranges,
        })
    }

    pub async fn close_session(&self, session_url: &Url) -> Result<(), GraphError> {
        let response = self.http.delete(session_url.clone()).send().await?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(Self::api_error(response).await)
        }
    }

    fn auth_header_value(&self) -> String {
        format!("Bearer {}", self.token)
    }

    fn endpoint(&self, path: &str) -> Result<Url, GraphError> {
        Ok(self.base_url.join(path)?)
    }

    async fn handle_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, GraphError> {
        if response.status().is_success() {
            Ok(response.json::<T>().await?)
        } else {
            Err(Self::api_error(response).await)
        }
    }

    async fn api_error(response: reqwest::Response) -> GraphError {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        match serde_json::from_str::<ErrorEnvelope>(&body) {
            Ok(envelope) => GraphError::Api {
                status,
                code: envelope.error.code,
                message: envelope.error.message,
            },
            Err(_) => GraphError::Api {
                status,
                code: String::new(),
                message: body,
            },
        }
    }
}

impl GraphError {
    pub fn classification(&self) -> Option<ApiErrorClass> {
        match self {
            GraphError::Api { status, code, .. } => Some(classify_api_error(*status, code)),
            _ => None,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self.classification(),
            Some(ApiErrorClass::RateLimit | ApiErrorClass::Transient)
        )
    }
}

fn classify_api_error(status: StatusCode, code: &str) -> ApiErrorClass {
    if matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) {
        ApiErrorClass::Auth
    } else if status == StatusCode::TOO_MANY_REQUESTS || code == "activityLimitReached" {
        ApiErrorClass::RateLimit
    } else if status.is_server_error()
        || status == StatusCode::REQUEST_TIMEOUT
        || code == "serviceNotAvailable"
    {
        ApiErrorClass::Transient
    } else {
        ApiErrorClass::Permanent
    }
}

#[derive(Debug, Deserialize, Serialize)]
pub struct User {
    pub id: String,
    #[serde(rename = "displayName", default)]
    pub display_name: Option<String>,
    #[serde(rename = "userPrincipalName", default)]
    pub user_principal_name: Option<String>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct CalendarEvent {
    #[serde(default)]
    pub subject: Option<String>,
    #[serde(default)]
    pub organizer: Option<Organizer>,
    #[serde(default)]
    pub start: Option<DateTimeZone>,
    #[serde(default)]
    pub end: Option<DateTimeZone>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct Organizer {
    #[serde(rename = "emailAddress")]
    pub email_address: EmailAddress,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct EmailAddress {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub address: Option<String>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct DateTimeZone {
    #[serde(rename = "dateTime")]
    pub date_time: String,
    #[serde(rename = "timeZone")]
    pub time_zone: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DriveItem {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(rename = "createdDateTime", default)]
    pub created: Option<String>,
    #[serde(rename = "lastModifiedDateTime", default)]
    pub modified: Option<String>,
    #[serde(rename = "parentReference", default)]
    pub parent_reference: Option<ParentReference>,
    #[serde(flatten)]
    pub kind: ItemKind,
}

/// Entry kind, decided once while decoding the response. The service marks
/// the kind by attaching exactly one of the `folder`/`file` facets.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum ItemKind {
    Folder { folder: FolderFacet },
    File { file: FileFacet },
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FolderFacet {
    #[serde(rename = "childCount", default)]
    pub child_count: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct FileFacet {
    #[serde(default)]
    pub hashes: Option<FileHashes>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct FileHashes {
    #[serde(rename = "quickXorHash", default)]
    pub quick_xor_hash: Option<String>,
    #[serde(rename = "sha1Hash", default)]
    pub sha1_hash: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ParentReference {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub path: Option<String>,
}

impl ParentReference {
    /// Path relative to the drive root ("/drive/root:/Docs" -> "/Docs").
    pub fn drive_path(&self) -> Option<&str> {
        self.path
            .as_deref()
            .map(|p| p.strip_prefix("/drive/root:").unwrap_or(p))
    }
}

#[derive(Debug)]
pub struct ChildrenPage {
    pub items: Vec<DriveItem>,
    pub next_link: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChildrenResponse {
    value: Vec<DriveItem>,
    #[serde(rename = "@odata.nextLink", default)]
    next_link: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Collection<T> {
    value: Vec<T>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct UploadSession {
    #[serde(rename = "uploadUrl")]
    pub upload_url: Url,
    #[serde(rename = "expirationDateTime", default)]
    pub expiration: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct UploadProgress {
    #[serde(rename = "nextExpectedRanges", default)]
    next_expected_ranges: Vec<String>,
}

#[derive(Debug)]
pub enum RangeAck {
    Accepted { next_expected_ranges: Vec<String> },
    Completed { item: DriveItem },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictBehavior {
    Replace,
    Rename,
    Fail,
}

impl ConflictBehavior {
    pub fn as_str(self) -> &'static str {
        match self {
            ConflictBehavior::Replace => "replace",
            ConflictBehavior::Rename => "rename",
            ConflictBehavior::Fail => "fail",
        }
    }
}

/// Inclusive byte range of one upload chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    pub fn size(self) -> u64 {
        self.end - self.start + 1
    }

    pub fn content_range(self, total_size: u64) -> String {
        format!("bytes {}-{}/{}", self.start, self.end, total_size)
    }
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    code: String,
    #[serde(default)]
    message: String,
}
