use super::FetchError;
use crate::config::StorageSettings;
use std::fmt;

/// Validated `bucket` + `key` pair addressing one stored document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentRef {
    /// Storage bucket holding the object.
    pub bucket: String,
    /// Object key inside the bucket, `/`-separated.
    pub key: String,
}

impl DocumentRef {
    /// Parse `key` or `bucket/key`.
    ///
    /// The leading segment is only read as a bucket when it names a configured bucket;
    /// anything else is a key inside the default bucket.
    pub fn parse(raw: &str, settings: &StorageSettings) -> Result<Self, FetchError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(FetchError::InvalidRef("document reference is empty".into()));
        }
        if raw.starts_with('/') {
            return Err(FetchError::InvalidRef(format!("{raw}: absolute keys are not allowed")));
        }

        let (bucket, key) = match raw.split_once('/') {
            Some((first, rest)) if settings.is_known_bucket(first) => (first, rest),
            _ => (settings.default_bucket.as_str(), raw),
        };
        validate_key(key).map_err(|reason| FetchError::InvalidRef(format!("{raw}: {reason}")))?;

        Ok(Self {
            bucket: bucket.to_string(),
            key: key.to_string(),
        })
    }
}

fn validate_key(key: &str) -> Result<(), &'static str> {
    if key.is_empty() {
        return Err("object key is empty");
    }
    for segment in key.split('/') {
        match segment {
            "" => return Err("object key contains an empty segment"),
            "." | ".." => return Err("object key contains a relative segment"),
            _ => {}
        }
    }
    if key.chars().any(|c| c.is_control() || c == '\\') {
        return Err("object key contains forbidden characters");
    }
    Ok(())
}

impl fmt::Display for DocumentRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.bucket, self.key)
    }
}
