//! Wire message handed from the scheduler to data mover workers.

use super::connector::{CONF_BUCKET_NAME, Connector, Filter, KeyValue, StorageType};
use serde::{Deserialize, Serialize};

/// Connector as it travels on the queue: bucket name for the internal
/// store, provider configuration pairs for everything else.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct WireConnector {
    #[serde(rename = "type")]
    pub stor_type: StorageType,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub bucket_name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conn_config: Vec<KeyValue>,
}

impl From<&Connector> for WireConnector {
    fn from(conn: &Connector) -> Self {
        if conn.stor_type == StorageType::Internal {
            return Self {
                stor_type: conn.stor_type,
                bucket_name: conn.bucket_name.clone(),
                conn_config: Vec::new(),
            };
        }

        let mut conn_config = conn.conn_config.clone();
        if conn.config(CONF_BUCKET_NAME).is_none() && !conn.bucket_name.is_empty() {
            conn_config.push(KeyValue::new(CONF_BUCKET_NAME, &conn.bucket_name));
        }
        Self {
            stor_type: conn.stor_type,
            bucket_name: String::new(),
            conn_config,
        }
    }
}

impl WireConnector {
    pub fn config(&self, key: &str) -> Option<&str> {
        self.conn_config
            .iter()
            .find(|kv| kv.key == key)
            .map(|kv| kv.value.as_str())
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RunJobRequest {
    /// Job id as a string, the way workers look it up.
    pub id: String,
    pub over_write: bool,
    pub remain_source: bool,
    pub source_conn: WireConnector,
    pub dest_conn: WireConnector,
    #[serde(default)]
    pub filter: Filter,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn internal_connector_carries_only_bucket() {
        let wire = WireConnector::from(&Connector::internal("bucketA"));
        assert_eq!(wire.bucket_name, "bucketA");
        assert!(wire.conn_config.is_empty());

        let json = serde_json::to_value(&wire).unwrap();
        assert_eq!(json, serde_json::json!({"type": "internal", "bucketName": "bucketA"}));
    }

    #[test]
    fn external_connector_carries_only_config() {
        let mut conn = Connector::external(
            StorageType::AwsS3,
            vec![KeyValue::new("endpoint", "https://s3.example.com")],
        );
        conn.bucket_name = "bucketB".into();
        let wire = WireConnector::from(&conn);

        assert!(wire.bucket_name.is_empty());
        assert_eq!(wire.config("endpoint"), Some("https://s3.example.com"));
        assert_eq!(wire.config(CONF_BUCKET_NAME), Some("bucketB"));
    }

    #[test]
    fn request_without_filter_still_decodes() {
        let raw = r#"{
            "id": "job-1",
            "overWrite": true,
            "remainSource": false,
            "sourceConn": {"type": "internal", "bucketName": "a"},
            "destConn": {"type": "aws-s3", "connConfig": [{"key": "bucketName", "value": "b"}]}
        }"#;
        let req: RunJobRequest = serde_json::from_str(raw).unwrap();
        assert_eq!(req.filter, Filter::default());
        assert_eq!(req.dest_conn.config(CONF_BUCKET_NAME), Some("b"));
    }
}
