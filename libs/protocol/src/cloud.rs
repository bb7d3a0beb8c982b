//! Object-store addressing, machine images, and broker coordinates.

use serde::{Deserialize, Serialize};

/// An object-store address: a bucket plus a key (or key prefix).
///
/// Project output lives under `<projectID>/output/`; individual frames are
/// objects below that prefix.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct S3Source {
    pub bucket: String,
    pub key: String,
}

impl S3Source {
    pub fn new(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
        }
    }

    /// Returns the address of an object below this prefix.
    #[must_use]
    pub fn object(&self, name: &str) -> S3Source {
        let key = if self.key.is_empty() || self.key.ends_with('/') {
            format!("{}{}", self.key, name)
        } else {
            format!("{}/{}", self.key, name)
        };
        S3Source::new(self.bucket.clone(), key)
    }
}

impl std::fmt::Display for S3Source {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "s3://{}/{}", self.bucket, self.key)
    }
}

/// A cloud machine image reference (an AMI id or equivalent).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MachineImage(String);

impl MachineImage {
    pub fn new(image: impl Into<String>) -> Self {
        Self(image.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for MachineImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// The rendering package a project uses (`blender`, `maya`, ...).
///
/// The tag is matched case-insensitively against the image catalog; the
/// original spelling is preserved on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SoftwareTag(String);

impl SoftwareTag {
    pub fn new(tag: impl Into<String>) -> Self {
        Self(tag.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Lowercased form used for catalog lookups.
    #[must_use]
    pub fn normalized(&self) -> String {
        self.0.to_ascii_lowercase()
    }
}

impl std::fmt::Display for SoftwareTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Coordinates of the worker-to-driver broker channel.
///
/// Workers publish [`crate::JobFrame`] records here; the driver consumes them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageQ {
    pub host: String,
    #[serde(default = "default_broker_port")]
    pub port: u16,
    #[serde(rename = "queueName")]
    pub queue_name: String,
}

fn default_broker_port() -> u16 {
    5672
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_s3_source_object_below_prefix() {
        let prefix = S3Source::new("drender", "film-01/output/");
        let frame = prefix.object("frame-0042.png");
        assert_eq!(frame.bucket, "drender");
        assert_eq!(frame.key, "film-01/output/frame-0042.png");
    }

    #[test]
    fn test_s3_source_object_inserts_separator() {
        let prefix = S3Source::new("drender", "film-01/output");
        assert_eq!(prefix.object("f.png").key, "film-01/output/f.png");
    }

    #[test]
    fn test_message_q_port_defaults() {
        let q: MessageQ =
            serde_json::from_str(r#"{"host":"10.0.0.9","queueName":"drender.driver.frames"}"#)
                .unwrap();
        assert_eq!(q.port, 5672);
        assert_eq!(q.queue_name, "drender.driver.frames");
    }

    #[test]
    fn test_message_q_wire_field_spelling() {
        let q = MessageQ {
            host: "10.0.0.9".into(),
            port: 5672,
            queue_name: "drender.driver.frames".into(),
        };
        let json = serde_json::to_string(&q).unwrap();
        assert!(json.contains("\"queueName\""));
    }

    #[test]
    fn test_software_tag_normalized() {
        assert_eq!(SoftwareTag::new("Blender").normalized(), "blender");
    }
}
