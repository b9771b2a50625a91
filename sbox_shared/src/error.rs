use thiserror::Error;

/// Failure modes of reading or writing a project container.
#[derive(Debug, Error)]
pub enum ProjectError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("not a project file (expected tag \"SBOX\")")]
    BadTag,

    #[error("project format version {found} is newer than supported version {supported}")]
    UnsupportedVersion { found: u32, supported: u32 },

    #[error("project data truncated: expected {expected} bytes, found {found}")]
    Truncated { expected: usize, found: usize },

    #[error("XML error: {0}")]
    Xml(#[from] quick_xml::Error),

    #[error("project XML is not valid UTF-8: {0}")]
    Utf8(#[from] std::str::Utf8Error),

    #[error("missing <surgebox-project> root element")]
    MissingRoot,
}
