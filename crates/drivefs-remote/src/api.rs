//! Wire types for the drive's JSON API.

use serde::{Deserialize, Serialize};

use drivefs_core::{RemoteFile, UploadProbe};

pub const LIST: &str = "/adrive/v3/file/list";
pub const DETAIL: &str = "/v2/file/get";
pub const PATH: &str = "/adrive/v1/file/get_path";
pub const CREATE: &str = "/adrive/v2/file/createWithFolders";
pub const UPDATE: &str = "/v3/file/update";
pub const TRASH: &str = "/v2/recyclebin/trash";
pub const SEARCH: &str = "/adrive/v3/file/search";
pub const BATCH: &str = "/v3/batch";
pub const UPLOAD_URL: &str = "/v2/file/get_upload_url";
pub const COMPLETE: &str = "/v2/file/complete";
pub const DOWNLOAD_URL: &str = "/v2/file/get_download_url";
pub const PERSONAL_INFO: &str = "/v2/databox/get_personal_info";

pub const ACCEPT: &str = "application/json, text/plain, */*";
pub const CONTENT_TYPE: &str = "application/json;charset=UTF-8";

#[derive(Serialize)]
pub struct ListRequest<'a> {
    pub drive_id: &'a str,
    pub parent_file_id: &'a str,
    pub limit: u32,
    pub all: bool,
    pub url_expire_sec: u64,
    pub fields: &'a str,
    pub order_by: &'a str,
    pub order_direction: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub marker: Option<&'a str>,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<&'a str>,
}

#[derive(Serialize)]
pub struct FileRef<'a> {
    pub drive_id: &'a str,
    pub file_id: &'a str,
}

#[derive(Serialize)]
pub struct MkdirRequest<'a> {
    pub drive_id: &'a str,
    pub parent_file_id: &'a str,
    pub name: &'a str,
    pub check_name_mode: &'a str,
    #[serde(rename = "type")]
    pub kind: &'a str,
}

#[derive(Serialize)]
pub struct RenameRequest<'a> {
    pub drive_id: &'a str,
    pub file_id: &'a str,
    pub name: &'a str,
    pub check_name_mode: &'a str,
}

#[derive(Serialize)]
pub struct SearchRequest<'a> {
    pub drive_id: &'a str,
    pub query: String,
    pub order_by: &'a str,
    pub limit: u32,
}

pub fn search_query(parent_id: &str, name: &str, kind: &str) -> String {
    format!(
        "parent_file_id = \"{}\" and (name = \"{}\") and (type=\"{}\")",
        parent_id, name, kind
    )
}

#[derive(Serialize)]
pub struct BatchRequest<'a> {
    pub requests: Vec<BatchItem<'a>>,
    pub resource: &'a str,
}

#[derive(Serialize)]
pub struct BatchItem<'a> {
    pub body: MoveBody<'a>,
    pub headers: BatchHeaders,
    pub id: &'a str,
    pub method: &'a str,
    pub url: &'a str,
}

#[derive(Serialize)]
pub struct MoveBody<'a> {
    pub drive_id: &'a str,
    pub file_id: &'a str,
    pub to_drive_id: &'a str,
    pub to_parent_file_id: &'a str,
}

#[derive(Serialize)]
pub struct BatchHeaders {
    #[serde(rename = "Content-Type")]
    pub content_type: &'static str,
}

impl<'a> BatchRequest<'a> {
    pub fn move_one(drive_id: &'a str, file_id: &'a str, dest_parent_id: &'a str) -> Self {
        BatchRequest {
            requests: vec![BatchItem {
                body: MoveBody {
                    drive_id,
                    file_id,
                    to_drive_id: drive_id,
                    to_parent_file_id: dest_parent_id,
                },
                headers: BatchHeaders {
                    content_type: "application/json",
                },
                id: file_id,
                method: "POST",
                url: "/file/move",
            }],
            resource: "file",
        }
    }
}

#[derive(Deserialize)]
pub struct BatchResponse {
    #[serde(default)]
    pub responses: Vec<BatchResult>,
}

#[derive(Deserialize)]
pub struct BatchResult {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub status: u16,
}

#[derive(Serialize, Clone, Copy)]
pub struct PartNumber {
    pub part_number: u32,
}

pub fn part_numbers(numbers: impl IntoIterator<Item = u32>) -> Vec<PartNumber> {
    numbers
        .into_iter()
        .map(|part_number| PartNumber { part_number })
        .collect()
}

#[derive(Serialize)]
pub struct CreateFileRequest<'a> {
    pub drive_id: &'a str,
    pub part_info_list: Vec<PartNumber>,
    pub parent_file_id: &'a str,
    pub name: &'a str,
    #[serde(rename = "type")]
    pub kind: &'a str,
    pub check_name_mode: &'a str,
    pub size: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pre_hash: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_hash_name: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<&'a str>,
    pub proof_version: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proof_code: Option<&'a str>,
}

impl<'a> CreateFileRequest<'a> {
    pub fn new(
        drive_id: &'a str,
        parent_file_id: &'a str,
        name: &'a str,
        size: u64,
        part_count: u32,
        probe: &'a UploadProbe,
    ) -> Self {
        let mut request = CreateFileRequest {
            drive_id,
            part_info_list: part_numbers(1..=part_count.max(1)),
            parent_file_id,
            name,
            kind: "file",
            check_name_mode: "overwrite",
            size,
            pre_hash: None,
            content_hash_name: None,
            content_hash: None,
            proof_version: "v1",
            proof_code: None,
        };
        match probe {
            UploadProbe::PreHash(hash) => request.pre_hash = Some(hash.as_str()),
            UploadProbe::Content { sha1, proof } => {
                request.content_hash_name = Some("sha1");
                request.content_hash = Some(sha1.as_str());
                request.proof_code = Some(proof.as_str());
            }
            UploadProbe::None => {}
        }
        request
    }
}

#[derive(Deserialize, Default)]
pub struct PartInfo {
    #[serde(default)]
    pub part_number: u32,
    #[serde(default)]
    pub upload_url: String,
}

#[derive(Deserialize)]
pub struct CreateFileResponse {
    #[serde(default)]
    pub file_id: String,
    #[serde(default)]
    pub upload_id: Option<String>,
    #[serde(default)]
    pub rapid_upload: bool,
    #[serde(default)]
    pub part_info_list: Vec<PartInfo>,
}

#[derive(Serialize)]
pub struct UploadUrlRequest<'a> {
    pub drive_id: &'a str,
    pub part_info_list: Vec<PartNumber>,
    pub file_id: &'a str,
    pub upload_id: &'a str,
}

#[derive(Deserialize)]
pub struct UploadUrlResponse {
    #[serde(default)]
    pub part_info_list: Vec<PartInfo>,
}

#[derive(Serialize)]
pub struct CompleteRequest<'a> {
    pub drive_id: &'a str,
    pub file_id: &'a str,
    pub upload_id: &'a str,
}

#[derive(Deserialize)]
pub struct ItemsResponse {
    #[serde(default)]
    pub items: Vec<RemoteFile>,
}

#[derive(Deserialize)]
pub struct DownloadUrlResponse {
    #[serde(default)]
    pub url: String,
}

#[derive(Deserialize)]
pub struct PersonalInfo {
    pub personal_space_info: SpaceInfo,
}

#[derive(Deserialize)]
pub struct SpaceInfo {
    #[serde(default)]
    pub total_size: u64,
    #[serde(default)]
    pub used_size: u64,
}

#[derive(Serialize)]
pub struct RefreshRequest<'a> {
    pub refresh_token: &'a str,
}
