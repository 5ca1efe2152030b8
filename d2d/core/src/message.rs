//! D2D message types
//!
//! A message is a flat string-to-string header plus an opaque body.

use std::collections::BTreeMap;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::frame::{FILE_LENGTH_KEY, SEC_KEY_KEY};
use crate::transport::MessageValue;

/// Message header: string keys to string values
pub type Header = BTreeMap<String, String>;

/// Version written by [`FileHeader`]
pub const FILE_HEADER_VERSION: &str = "0.0.1";

/// One framed message
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct D2dMessage {
    header: Header,
    body: Bytes,
}

impl D2dMessage {
    /// Create a message from a header and a body
    pub fn new(header: Header, body: impl MessageValue) -> Self {
        Self {
            header,
            body: body.into_buffer(),
        }
    }

    /// Create a file message with a [`FileHeader`]
    ///
    /// `fileLength` is left empty and filled in on send.
    pub fn file(file: &FileHeader, body: impl MessageValue) -> Self {
        let mut header = file.to_map();
        header.insert(FILE_LENGTH_KEY.to_string(), String::new());
        Self::new(header, body)
    }

    /// Header fields
    pub fn header(&self) -> &Header {
        &self.header
    }

    /// Value of one header field
    pub fn header_value(&self, key: &str) -> Option<&str> {
        self.header.get(key).map(String::as_str)
    }

    /// Insert or replace a header field
    pub fn add_header(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.header.insert(key.into(), value.into());
    }

    /// Body bytes
    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Body length in bytes
    pub fn body_len(&self) -> usize {
        self.body.len()
    }

    /// Split into header and body
    pub fn into_parts(self) -> (Header, Bytes) {
        (self.header, self.body)
    }

    /// Inject the shared secret and fill in a missing or empty `fileLength`
    pub(crate) fn prepare_for_send(&mut self, sec_key: &str) {
        self.header
            .insert(SEC_KEY_KEY.to_string(), sec_key.to_string());

        let needs_length = self
            .header
            .get(FILE_LENGTH_KEY)
            .map_or(true, |v| v.is_empty());
        if needs_length {
            self.header
                .insert(FILE_LENGTH_KEY.to_string(), self.body.len().to_string());
        }
    }
}

/// Simple file header format
///
/// Wire keys: `version`, `num`, `total`, `fileName`, `fileLength`,
/// `fileType`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileHeader {
    /// Format version, always [`FILE_HEADER_VERSION`] when built locally
    pub version: String,
    /// 1-based index of this file in the batch
    pub num: u32,
    /// Number of files in the batch
    pub total: u32,
    /// File name
    pub file_name: String,
    /// Body length, `None` until known
    pub file_length: Option<u64>,
    /// File type or extension
    pub file_type: String,
}

impl FileHeader {
    /// Create a header with an unknown length
    pub fn new(num: u32, total: u32, file_name: impl Into<String>, file_type: impl Into<String>) -> Self {
        Self {
            version: FILE_HEADER_VERSION.to_string(),
            num,
            total,
            file_name: file_name.into(),
            file_length: None,
            file_type: file_type.into(),
        }
    }

    /// Convert to a header map
    pub fn to_map(&self) -> Header {
        let mut map = Header::new();
        map.insert("version".into(), self.version.clone());
        map.insert("num".into(), self.num.to_string());
        map.insert("total".into(), self.total.to_string());
        map.insert("fileName".into(), self.file_name.clone());
        map.insert(
            FILE_LENGTH_KEY.into(),
            self.file_length.map(|len| len.to_string()).unwrap_or_default(),
        );
        map.insert("fileType".into(), self.file_type.clone());
        map
    }

    /// Parse from a header map
    ///
    /// Returns the name of the first missing or malformed field on failure.
    pub fn from_map(map: &Header) -> Result<Self, String> {
        let field = |key: &str| -> Result<&String, String> {
            map.get(key).ok_or_else(|| format!("missing {key}"))
        };
        let number = |key: &str| -> Result<u32, String> {
            field(key)?
                .parse()
                .map_err(|_| format!("{key} is not a number"))
        };

        let file_length = match map.get(FILE_LENGTH_KEY).map(String::as_str) {
            None | Some("") => None,
            Some(raw) => Some(
                raw.parse()
                    .map_err(|_| format!("{FILE_LENGTH_KEY} is not a number"))?,
            ),
        };

        Ok(Self {
            version: field("version")?.clone(),
            num: number("num")?,
            total: number("total")?,
            file_name: field("fileName")?.clone(),
            file_length,
            file_type: map.get("fileType").cloned().unwrap_or_default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_prepare_for_send_computes_missing_length() {
        let mut header = Header::new();
        header.insert("fileName".into(), "a.jpg".into());
        let mut message = D2dMessage::new(header, vec![7u8; 100]);

        message.prepare_for_send("secret");

        assert_eq!(message.header_value("fileLength"), Some("100"));
        assert_eq!(message.header_value("secKey"), Some("secret"));
        assert_eq!(message.body_len(), 100);
    }

    #[test]
    fn test_prepare_for_send_keeps_explicit_length() {
        let mut message = D2dMessage::default();
        message.add_header("fileLength", "42");
        message.prepare_for_send("");
        assert_eq!(message.header_value("fileLength"), Some("42"));
    }

    #[test]
    fn test_file_message_header() {
        let file = FileHeader::new(2, 3, "photo.png", "png");
        let mut message = D2dMessage::file(&file, "12345");
        assert_eq!(message.header_value("fileLength"), Some(""));
        assert_eq!(message.header_value("version"), Some("0.0.1"));

        message.prepare_for_send("k");
        assert_eq!(message.header_value("fileLength"), Some("5"));
        assert_eq!(message.header_value("num"), Some("2"));
        assert_eq!(message.header_value("total"), Some("3"));
    }

    #[test]
    fn test_file_header_from_map() {
        let mut file = FileHeader::new(1, 1, "notes.txt", "txt");
        file.file_length = Some(9);

        let mut map = file.to_map();
        map.insert("secKey".into(), "ignored".into());
        assert_eq!(FileHeader::from_map(&map).unwrap(), file);

        map.remove("fileName");
        assert_eq!(FileHeader::from_map(&map).unwrap_err(), "missing fileName");
    }

    #[test]
    fn test_file_header_rejects_bad_numbers() {
        let mut map = FileHeader::new(1, 1, "a", "b").to_map();
        map.insert("num".into(), "first".into());
        assert_eq!(FileHeader::from_map(&map).unwrap_err(), "num is not a number");
    }
}
