/// Failure to turn a type-tagged wire payload into a typed value.
///
/// Rejects only the offending message; the connection that carried it
/// stays usable.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("unknown type tag: {0}")]
    UnknownTag(String),
    #[error("malformed {tag} payload: {source}")]
    Malformed {
        tag: String,
        #[source]
        source: serde_json::Error,
    },
}

impl DecodeError {
    /// Wrap a serde failure for the given tag.
    pub fn malformed(tag: &str, source: serde_json::Error) -> Self {
        Self::Malformed {
            tag: tag.to_owned(),
            source,
        }
    }
}
