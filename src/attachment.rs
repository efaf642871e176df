//! Document ingestion: the only way an attachment enters a turn.

use std::path::Path;

use bytes::Bytes;

use crate::error::{ChatError, Result};
use crate::gateway::InlineDocument;

/// MIME types the chat service accepts as side documents.
pub const ACCEPTED_DOCUMENT_TYPES: &[&str] = &["application/pdf"];

/// A validated document waiting to be sent with the next turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    name: String,
    mime_type: String,
    data: Bytes,
}

impl Attachment {
    pub fn new(
        name: impl Into<String>,
        mime_type: impl Into<String>,
        data: impl Into<Bytes>,
    ) -> Result<Self> {
        let name = name.into();
        let mime_type = mime_type.into();
        let data = data.into();

        if !ACCEPTED_DOCUMENT_TYPES.contains(&mime_type.as_str()) {
            return Err(ChatError::InvalidAttachment(format!(
                "{} has type {}, expected one of {:?}",
                name, mime_type, ACCEPTED_DOCUMENT_TYPES
            )));
        }
        if data.is_empty() {
            return Err(ChatError::InvalidAttachment(format!("{} is empty", name)));
        }

        Ok(Self {
            name,
            mime_type,
            data,
        })
    }

    /// Reads a file, guessing its type from the extension.
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mime_type = mime_guess::from_path(path)
            .first_raw()
            .unwrap_or("application/octet-stream");
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());

        // Check the type first so a wrong file is never read
        if !ACCEPTED_DOCUMENT_TYPES.contains(&mime_type) {
            return Err(ChatError::InvalidAttachment(format!(
                "{} has type {}, expected one of {:?}",
                name, mime_type, ACCEPTED_DOCUMENT_TYPES
            )));
        }

        let data = tokio::fs::read(path)
            .await
            .map_err(|e| ChatError::InvalidAttachment(format!("failed to read {}: {}", name, e)))?;

        Self::new(name, mime_type, data)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn mime_type(&self) -> &str {
        &self.mime_type
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub(crate) fn to_document(&self) -> InlineDocument {
        InlineDocument {
            mime_type: self.mime_type.clone(),
            data: self.data.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn pdf_is_accepted() {
        let att = Attachment::new("orario.pdf", "application/pdf", b"%PDF-1.7".to_vec()).unwrap();
        assert_eq!(att.name(), "orario.pdf");
        assert_eq!(att.len(), 8);
    }

    #[test]
    fn other_types_are_rejected() {
        let err = Attachment::new("foto.png", "image/png", b"\x89PNG".to_vec()).unwrap_err();
        assert!(matches!(err, ChatError::InvalidAttachment(_)));
    }

    #[test]
    fn empty_documents_are_rejected() {
        let err = Attachment::new("vuoto.pdf", "application/pdf", Vec::new()).unwrap_err();
        assert!(matches!(err, ChatError::InvalidAttachment(_)));
    }

    #[tokio::test]
    async fn from_path_reads_a_pdf() {
        let mut file = tempfile::Builder::new().suffix(".pdf").tempfile().unwrap();
        file.write_all(b"%PDF-1.4 test").unwrap();

        let att = Attachment::from_path(file.path()).await.unwrap();
        assert_eq!(att.mime_type(), "application/pdf");
        assert_eq!(att.data().as_ref(), b"%PDF-1.4 test");
    }

    #[tokio::test]
    async fn from_path_rejects_by_extension() {
        let mut file = tempfile::Builder::new().suffix(".txt").tempfile().unwrap();
        file.write_all(b"hello").unwrap();

        let err = Attachment::from_path(file.path()).await.unwrap_err();
        assert!(matches!(err, ChatError::InvalidAttachment(_)));
    }
}
