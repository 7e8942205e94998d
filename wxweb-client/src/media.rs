//! In-memory file payloads for upload.

use std::io;
use std::path::Path;

use md5::{Digest, Md5};

use crate::errors::RequestError;
use crate::transport::{HttpRequest, TimeoutTier, Transport};

/// A file staged for upload: bytes plus the metadata the upload endpoint
/// wants to hear about them.
#[derive(Debug, Clone)]
pub struct FileResource {
    name: String,
    extension: String,
    data: Vec<u8>,
}

impl FileResource {
    pub fn new(name: impl Into<String>, data: Vec<u8>) -> Self {
        let name = name.into();
        let extension = name.rsplit_once('.').map(|(_, ext)| ext.to_string()).unwrap_or_default();
        Self { name, extension, data }
    }

    pub async fn from_path(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref();
        let data = tokio::fs::read(path).await?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "file".to_string());
        Ok(Self::new(name, data))
    }

    /// Download a remote file through the transport.
    pub async fn from_url(transport: &dyn Transport, url: &str) -> Result<Self, RequestError> {
        let response = transport
            .request(HttpRequest::get(url).timeout(TimeoutTier::Long))
            .await?;
        let name = url
            .rsplit('/')
            .next()
            .map(|seg| seg.split(['?', '#']).next().unwrap_or(seg))
            .filter(|seg| !seg.is_empty())
            .unwrap_or("file")
            .to_string();
        Ok(Self::new(name, response.body))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn extension(&self) -> &str {
        &self.extension
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn size(&self) -> u64 {
        self.data.len() as u64
    }

    pub fn md5_hex(&self) -> String {
        let digest = Md5::digest(&self.data);
        digest.iter().map(|b| format!("{b:02x}")).collect()
    }

    pub fn mime_type(&self) -> String {
        mime_guess::from_ext(&self.extension).first_or_octet_stream().to_string()
    }

    /// Coarse class the upload endpoint wants: `pic`, `video` or `doc`.
    pub fn media_class(&self) -> &'static str {
        match self.mime_type().split('/').next() {
            Some("image") => "pic",
            Some("video") => "video",
            _ => "doc",
        }
    }

    /// Browser-style modification timestamp the upload form carries.
    pub fn last_modified(&self) -> String {
        chrono::Local::now().format("%a %b %d %Y %H:%M:%S GMT%z (CST)").to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extension_and_class_from_name() {
        let pic = FileResource::new("photo.JPG", vec![1, 2, 3]);
        assert_eq!(pic.extension(), "JPG");
        assert_eq!(pic.media_class(), "pic");

        let doc = FileResource::new("report.pdf", vec![0; 10]);
        assert_eq!(doc.media_class(), "doc");
        assert_eq!(doc.size(), 10);

        let bare = FileResource::new("README", vec![]);
        assert_eq!(bare.extension(), "");
        assert_eq!(bare.media_class(), "doc");
    }

    #[test]
    fn md5_is_lowercase_hex() {
        let res = FileResource::new("a.bin", b"hello".to_vec());
        assert_eq!(res.md5_hex(), "5d41402abc4b2a76b9719d911017c592");
    }
}
