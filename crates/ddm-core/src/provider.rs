//! Metadata-provider collaborator seam (§6).
//!
//! The core never speaks OAuth or any specific cloud-storage API directly;
//! `FolderAggregator` drives recursive scan and sub-task construction purely
//! through this trait.

use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;

/// One entry in a folder listing.
#[derive(Debug, Clone)]
pub struct ProviderEntry {
    pub id: String,
    pub name: String,
    pub mime_type: String,
    pub size: u64,
}

/// Folder mime type sentinel used by providers such as a cloud drive.
pub const FOLDER_MIME_TYPE: &str = "application/vnd.google-apps.folder";

impl ProviderEntry {
    pub fn is_folder(&self) -> bool {
        self.mime_type == FOLDER_MIME_TYPE
    }
}

/// A single page of a folder listing.
#[derive(Debug, Clone, Default)]
pub struct ListPage {
    pub files: Vec<ProviderEntry>,
    pub next_page_token: Option<String>,
}

/// Metadata about a single remote file, used to build its fetch URL.
#[derive(Debug, Clone)]
pub struct FileMetadata {
    pub id: String,
    pub name: String,
    pub size: u64,
    pub web_content_link: String,
}

/// Collaborator exposing a remote folder's contents and authorization.
/// Implemented by the host application (e.g. against a specific cloud
/// drive's API); the core only depends on this trait.
#[async_trait]
pub trait MetadataProvider: Send + Sync {
    async fn list(&self, folder_id: &str, page_token: Option<&str>) -> Result<ListPage>;
    async fn metadata(&self, file_id: &str) -> Result<FileMetadata>;
    async fn auth_headers(&self) -> Result<HashMap<String, String>>;
}
