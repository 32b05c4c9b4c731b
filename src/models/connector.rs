//! One side of a migration: where objects are read from or written to.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Provider tag carried by every connector.
///
/// `Internal` is the object store this service runs itself; every other
/// variant names an external provider.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum StorageType {
    Internal,
    AwsS3,
    HwObs,
    CephS3,
    AzureBlob,
    Gcs,
    #[serde(other)]
    Unknown,
}

impl StorageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageType::Internal => "internal",
            StorageType::AwsS3 => "aws-s3",
            StorageType::HwObs => "hw-obs",
            StorageType::CephS3 => "ceph-s3",
            StorageType::AzureBlob => "azure-blob",
            StorageType::Gcs => "gcs",
            StorageType::Unknown => "unknown",
        }
    }

    /// Providers reachable through the S3 wire protocol.
    pub fn is_s3_compatible(&self) -> bool {
        matches!(
            self,
            StorageType::AwsS3 | StorageType::HwObs | StorageType::CephS3
        )
    }

    /// Whether a data mover adapter exists for this provider.
    pub fn is_supported(&self) -> bool {
        *self == StorageType::Internal || self.is_s3_compatible()
    }
}

impl fmt::Display for StorageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Opaque provider configuration entry (endpoint, credentials, ...).
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct KeyValue {
    pub key: String,
    pub value: String,
}

impl KeyValue {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// Configuration key holding the bucket of an external connector.
pub const CONF_BUCKET_NAME: &str = "bucketName";

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Connector {
    pub stor_type: StorageType,
    #[serde(default)]
    pub bucket_name: String,
    #[serde(default)]
    pub conn_config: Vec<KeyValue>,
}

impl Connector {
    pub fn internal(bucket: impl Into<String>) -> Self {
        Self {
            stor_type: StorageType::Internal,
            bucket_name: bucket.into(),
            conn_config: Vec::new(),
        }
    }

    pub fn external(stor_type: StorageType, conn_config: Vec<KeyValue>) -> Self {
        Self {
            stor_type,
            bucket_name: String::new(),
            conn_config,
        }
    }

    pub fn config(&self, key: &str) -> Option<&str> {
        self.conn_config
            .iter()
            .find(|kv| kv.key == key)
            .map(|kv| kv.value.as_str())
    }

    /// True when both connectors provably address the same bucket.
    ///
    /// Only two internal connectors naming the same bucket qualify. External
    /// configurations are never considered aliases, even when identical,
    /// because two credential sets may or may not reach the same account.
    pub fn is_same_endpoint(&self, other: &Connector) -> bool {
        self.stor_type == StorageType::Internal
            && other.stor_type == StorageType::Internal
            && self.bucket_name == other.bucket_name
    }

    /// Provider-resolved location: the bucket the data actually lives in.
    ///
    /// Returns `None` for providers without an adapter or when an external
    /// connector names no bucket at all.
    pub fn location(&self) -> Option<String> {
        if !self.stor_type.is_supported() {
            return None;
        }
        if self.stor_type == StorageType::Internal {
            return Some(self.bucket_name.clone());
        }
        self.config(CONF_BUCKET_NAME)
            .map(str::to_string)
            .or_else(|| (!self.bucket_name.is_empty()).then(|| self.bucket_name.clone()))
    }
}

/// Key matcher applied to the source bucket of a plan.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Filter {
    #[serde(default = "root_prefix")]
    pub prefix: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
}

fn root_prefix() -> String {
    "/".to_string()
}

impl Default for Filter {
    fn default() -> Self {
        Self {
            prefix: root_prefix(),
            pattern: None,
        }
    }
}

impl Filter {
    /// Prefix as object keys see it (the root `/` means "everything").
    pub fn key_prefix(&self) -> &str {
        self.prefix.trim_start_matches('/')
    }

    /// Compile the optional key pattern.
    pub fn compile(&self) -> Result<Option<Regex>, regex::Error> {
        self.pattern.as_deref().map(Regex::new).transpose()
    }

    pub fn matches(&self, key: &str, pattern: Option<&Regex>) -> bool {
        key.starts_with(self.key_prefix()) && pattern.is_none_or(|re| re.is_match(key))
    }
}
