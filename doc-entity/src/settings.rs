use std::collections::BTreeMap;
use std::time::Duration;

use log::debug;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use crate::{
    Error,
    view::{DesignDocument, Stale},
};

pub const DEFAULT_CLUSTER_URL: &str = "couchbase://localhost";
pub const DEFAULT_BUCKET_NAME: &str = "default";
pub const DEFAULT_PD_PORT: u16 = 2379;

/// Data source settings as handed over by the ORM runtime.
///
/// Keys this crate does not understand are kept in `extra` and written back
/// unchanged when the settings are serialized.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    #[serde(default)]
    pub cluster: ClusterSettings,
    #[serde(default)]
    pub bucket: BucketSettings,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub design_docs: BTreeMap<String, DesignDocument>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "deserialize_stale"
    )]
    pub stale: Option<Stale>,
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default)]
    pub query: QueryMode,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterSettings {
    #[serde(default = "default_cluster_url")]
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default)]
    pub options: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BucketSettings {
    #[serde(default = "default_bucket_name")]
    pub name: String,
    #[serde(default)]
    pub password: String,
    /// Milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation_timeout: Option<u64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueryMode {
    #[default]
    #[serde(rename = "n1ql")]
    Declarative,
    #[serde(rename = "view")]
    View,
}

fn default_cluster_url() -> String {
    debug!("Cluster URL settings missing; trying default");
    DEFAULT_CLUSTER_URL.to_string()
}

fn default_bucket_name() -> String {
    debug!("Bucket name settings missing; trying default");
    DEFAULT_BUCKET_NAME.to_string()
}

fn deserialize_stale<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Stale>, D::Error> {
    match Value::deserialize(deserializer)? {
        Value::Null => Ok(None),
        value => Stale::parse(&value).map(Some).map_err(serde::de::Error::custom),
    }
}

fn default_version() -> u32 {
    5
}

impl Default for ClusterSettings {
    fn default() -> Self {
        Self {
            url: default_cluster_url(),
            username: None,
            password: None,
            options: Map::new(),
        }
    }
}

impl Default for BucketSettings {
    fn default() -> Self {
        Self {
            name: default_bucket_name(),
            password: String::new(),
            operation_timeout: None,
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            cluster: ClusterSettings::default(),
            bucket: BucketSettings::default(),
            design_docs: BTreeMap::new(),
            stale: None,
            version: default_version(),
            query: QueryMode::default(),
            extra: Map::new(),
        }
    }
}

impl Settings {
    pub fn from_value(value: Value) -> Result<Self, Error> {
        serde_json::from_value(value).map_err(Error::Json)
    }

    pub fn to_value(&self) -> Result<Value, Error> {
        serde_json::to_value(self).map_err(Error::Json)
    }

    /// Credentials are only sent by servers speaking the version 5 protocol.
    pub fn authenticates(&self) -> bool {
        self.version >= 5 && self.cluster.username.is_some()
    }
}

impl ClusterSettings {
    /// Host list of the cluster url, `scheme://a[:port],b[:port]`.
    pub fn endpoints(&self) -> Vec<String> {
        let hosts = match self.url.split_once("://") {
            Some((_, rest)) => rest,
            None => self.url.as_str(),
        };
        hosts
            .split(',')
            .map(|host| host.trim().trim_end_matches('/'))
            .filter(|host| !host.is_empty())
            .map(|host| {
                if host.contains(':') {
                    host.to_string()
                } else {
                    format!("{}:{}", host, DEFAULT_PD_PORT)
                }
            })
            .collect()
    }
}

impl BucketSettings {
    pub fn operation_timeout(&self) -> Option<Duration> {
        self.operation_timeout.map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn missing_sections_fall_back_to_defaults() {
        let settings = Settings::from_value(json!({})).unwrap();
        assert_eq!(settings.cluster.url, "couchbase://localhost");
        assert_eq!(settings.bucket.name, "default");
        assert_eq!(settings.bucket.password, "");
        assert_eq!(settings.version, 5);
        assert_eq!(settings.query, QueryMode::Declarative);
        assert!(settings.stale.is_none());
        assert_eq!(settings, Settings::default());
    }

    #[test]
    fn partial_sections_keep_given_values() {
        let settings = Settings::from_value(json!({
            "cluster": { "username": "Administrator", "password": "password" },
            "bucket": { "name": "test_bucket", "operationTimeout": 60000 },
            "stale": "ok",
            "query": "view"
        }))
        .unwrap();
        assert_eq!(settings.cluster.url, DEFAULT_CLUSTER_URL);
        assert!(settings.authenticates());
        assert_eq!(settings.bucket.name, "test_bucket");
        assert_eq!(
            settings.bucket.operation_timeout(),
            Some(Duration::from_secs(60))
        );
        assert_eq!(settings.stale, Some(Stale::Ok));
        assert_eq!(settings.query, QueryMode::View);
    }

    #[test]
    fn stale_accepts_booleans_and_numbers() {
        for (input, expected) in [
            (json!(false), Stale::False),
            (json!(true), Stale::Ok),
            (json!(1), Stale::False),
            (json!(3), Stale::UpdateAfter),
            (json!("update_after"), Stale::UpdateAfter),
        ] {
            let settings = Settings::from_value(json!({ "stale": input })).unwrap();
            assert_eq!(settings.stale, Some(expected));
        }
        assert_eq!(Settings::from_value(json!({ "stale": null })).unwrap().stale, None);
        assert!(Settings::from_value(json!({ "stale": 9 })).is_err());

        let settings = Settings::from_value(json!({ "stale": 2 })).unwrap();
        let again = Settings::from_value(settings.to_value().unwrap()).unwrap();
        assert_eq!(again.stale, Some(Stale::Ok));
    }

    #[test]
    fn unknown_keys_pass_through() {
        let input = json!({
            "connector": "couchbase",
            "name": "cb",
            "bucket": { "name": "b" }
        });
        let settings = Settings::from_value(input).unwrap();
        assert_eq!(settings.extra.get("connector"), Some(&json!("couchbase")));
        let output = settings.to_value().unwrap();
        assert_eq!(output["name"], json!("cb"));
        assert_eq!(output["bucket"]["name"], json!("b"));
    }

    #[test]
    fn old_servers_do_not_authenticate() {
        let settings = Settings::from_value(json!({
            "version": 4,
            "cluster": { "username": "u" }
        }))
        .unwrap();
        assert!(!settings.authenticates());
    }

    #[test]
    fn endpoints_from_cluster_url() {
        let mut cluster = ClusterSettings::default();
        assert_eq!(cluster.endpoints(), vec!["localhost:2379"]);

        cluster.url = "tikv://10.0.0.1:2379, 10.0.0.2".to_string();
        assert_eq!(cluster.endpoints(), vec!["10.0.0.1:2379", "10.0.0.2:2379"]);

        cluster.url = "127.0.0.1:3379/".to_string();
        assert_eq!(cluster.endpoints(), vec!["127.0.0.1:3379"]);
    }
}
