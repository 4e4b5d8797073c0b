//! Drive API types and Item conversion

use serde::Deserialize;

use crate::item::Item;
use crate::serde_util::deserialize_flexible_opt_u64;

/// Fields requested for every file record
pub const FILE_FIELDS: &str = "id,name,mimeType,parents,description,md5Checksum,version,size";

/// One file record from `files.list`
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DriveFile {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub mime_type: String,
    /// Drive allows several parents; the first one wins
    #[serde(default)]
    pub parents: Vec<String>,
    #[serde(default)]
    pub description: Option<String>,
    /// Only present for files with downloadable bytes
    #[serde(default)]
    pub md5_checksum: Option<String>,
    #[serde(default, deserialize_with = "deserialize_flexible_opt_u64")]
    pub version: Option<u64>,
    #[serde(default, deserialize_with = "deserialize_flexible_opt_u64")]
    pub size: Option<u64>,
}

/// One page of `files.list`
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileList {
    #[serde(default)]
    pub files: Vec<DriveFile>,
    pub next_page_token: Option<String>,
}

/// Size-only projection used before a download
#[derive(Debug, Deserialize)]
pub struct FileSize {
    #[serde(default, deserialize_with = "deserialize_flexible_opt_u64")]
    pub size: Option<u64>,
}

/// OAuth token endpoint response
#[derive(Debug, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub expires_in: u64,
}

/// Credential artifact stored in the account namespace
#[derive(Debug, Deserialize, serde::Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct StoredCredential {
    pub refresh_token: String,
}

impl From<DriveFile> for Item {
    fn from(file: DriveFile) -> Self {
        let binary = file.md5_checksum.is_some();
        Item {
            id: file.id,
            name: file.name,
            kind: file.mime_type,
            parent_id: file.parents.into_iter().next(),
            binary,
            size: if binary { file.size } else { None },
            version: file.version,
            description: file.description,
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::item::FOLDER_KIND;

    #[test]
    fn test_deserialize_page() {
        let json = r#"{
            "nextPageToken": "tok2",
            "files": [
                {
                    "id": "f1",
                    "name": "report.pdf",
                    "mimeType": "application/pdf",
                    "parents": ["d1"],
                    "md5Checksum": "abc",
                    "version": "12",
                    "size": "2048"
                },
                {
                    "id": "d1",
                    "name": "Docs",
                    "mimeType": "application/vnd.google-apps.folder",
                    "parents": ["0AAroot"],
                    "version": "3"
                }
            ]
        }"#;
        let page: FileList = serde_json::from_str(json).unwrap();
        assert_eq!(page.next_page_token.as_deref(), Some("tok2"));
        assert_eq!(page.files[0].size, Some(2048));
        assert_eq!(page.files[0].version, Some(12));
        assert_eq!(page.files[1].size, None);
    }

    #[test]
    fn test_last_page_has_no_token() {
        let page: FileList = serde_json::from_str(r#"{"files": []}"#).unwrap();
        assert!(page.next_page_token.is_none());
        assert!(page.files.is_empty());
    }

    #[test]
    fn test_into_item() {
        let file = DriveFile {
            id: "f1".to_string(),
            name: "a.txt".to_string(),
            mime_type: "text/plain".to_string(),
            parents: vec!["p1".to_string(), "p2".to_string()],
            description: None,
            md5_checksum: Some("x".to_string()),
            version: Some(1),
            size: Some(10),
        };
        let item: Item = file.into();
        assert!(item.binary);
        assert_eq!(item.parent_id.as_deref(), Some("p1"));
        assert_eq!(item.size, Some(10));
    }

    #[test]
    fn test_native_document_is_not_binary() {
        let file = DriveFile {
            id: "doc".to_string(),
            name: "Notes".to_string(),
            mime_type: "application/vnd.google-apps.document".to_string(),
            parents: vec![],
            description: Some("meeting".to_string()),
            md5_checksum: None,
            version: None,
            size: Some(1024),
        };
        let item: Item = file.into();
        assert!(!item.binary);
        assert_eq!(item.size, None);
        assert!(item.parent_id.is_none());
        assert!(!item.is_folder());
        assert_ne!(item.kind, FOLDER_KIND);
    }

    #[test]
    fn test_stored_credential() {
        let cred: StoredCredential =
            serde_json::from_str(r#"{"RefreshToken":"1//abc"}"#).unwrap();
        assert_eq!(cred.refresh_token, "1//abc");
    }
}
