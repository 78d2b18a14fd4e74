//! Cloud Storage over its JSON API: object media as the record source,
//! object `metadata` as custom provenance.

use bucketpub_core::{Attributes, ByteStream, MetadataProvider, PipelineError, SourceProvider};
use reqwest::Url;
use serde::Deserialize;

use crate::stream::{http_client, open_body, read_body, send};

pub const DEFAULT_ENDPOINT: &str = "https://storage.googleapis.com";

/// Endpoint and credentials shared by the source and metadata provider.
#[derive(Debug, Clone)]
pub struct CloudStorage {
    endpoint: Url,
    token: Option<String>,
}

impl CloudStorage {
    /// `endpoint` overrides the public API host (emulators, private gateways).
    pub fn new(endpoint: Option<&str>, token: Option<String>) -> Result<Self, PipelineError> {
        let raw = endpoint.unwrap_or(DEFAULT_ENDPOINT);
        let endpoint = Url::parse(raw)
            .map_err(|e| PipelineError::Input(format!("invalid storage endpoint {raw:?}: {e}")))?;
        if endpoint.cannot_be_a_base() {
            return Err(PipelineError::Input(format!(
                "storage endpoint {raw:?} cannot hold a path"
            )));
        }
        Ok(Self {
            endpoint,
            token: token.filter(|t| !t.is_empty()),
        })
    }

    /// `<endpoint>/storage/v1/b/<bucket>/o/<object>`, each id one
    /// percent-encoded segment (object names keep their slashes encoded).
    pub fn object_url(&self, bucket_id: &str, object_id: &str) -> Url {
        let mut url = self.endpoint.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments
                .pop_if_empty()
                .extend(["storage", "v1", "b", bucket_id, "o", object_id]);
        }
        url
    }

    fn get(&self, url: Url) -> reqwest::RequestBuilder {
        let request = http_client().get(url);
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}

/// Downloads object media.
#[derive(Debug, Clone)]
pub struct CloudStorageSource {
    storage: CloudStorage,
}

impl CloudStorageSource {
    pub fn new(storage: CloudStorage) -> Self {
        Self { storage }
    }
}

impl SourceProvider for CloudStorageSource {
    fn open(&self, bucket_id: &str, object_id: &str) -> Result<ByteStream, PipelineError> {
        let mut url = self.storage.object_url(bucket_id, object_id);
        url.query_pairs_mut().append_pair("alt", "media");
        let body = open_body(self.storage.get(url))?;
        Ok(Box::new(body))
    }

    fn describe(&self) -> String {
        format!("cloud storage at {}", self.storage.endpoint)
    }
}

#[derive(Deserialize)]
struct ObjectResource {
    #[serde(default)]
    metadata: Attributes,
}

/// Reads the object resource and returns its custom `metadata` map.
#[derive(Debug, Clone)]
pub struct CloudStorageMetadata {
    storage: CloudStorage,
}

impl CloudStorageMetadata {
    pub fn new(storage: CloudStorage) -> Self {
        Self { storage }
    }
}

/// Parse an object resource document.
fn object_metadata(body: &[u8]) -> Result<Attributes, serde_json::Error> {
    serde_json::from_slice::<ObjectResource>(body).map(|r| r.metadata)
}

impl MetadataProvider for CloudStorageMetadata {
    fn get(&self, bucket_id: &str, object_id: &str) -> Result<Attributes, PipelineError> {
        let url = self.storage.object_url(bucket_id, object_id);
        let body = send(self.storage.get(url)).and_then(read_body)?;
        object_metadata(&body).map_err(|e| {
            PipelineError::MetadataUnavailable(format!("unexpected object resource: {e}"))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock_http::LocalServer;
    use serde_json::json;
    use std::io::Read;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, ResponseTemplate};

    #[test]
    fn object_url_encodes_name() {
        let gcs = CloudStorage::new(None, None).unwrap();
        let url = gcs.object_url("drug_portal", "data/fda/test 1.json.zip");
        assert_eq!(
            url.as_str(),
            "https://storage.googleapis.com/storage/v1/b/drug_portal/o/data%2Ffda%2Ftest%201.json.zip"
        );
    }

    #[test]
    fn custom_endpoint_with_path() {
        let gcs = CloudStorage::new(Some("http://localhost:4443/gw/"), None).unwrap();
        let url = gcs.object_url("b", "o");
        assert_eq!(url.as_str(), "http://localhost:4443/gw/storage/v1/b/b/o/o");
    }

    #[test]
    fn bad_endpoint_is_input_error() {
        let err = CloudStorage::new(Some("not a url"), None).unwrap_err();
        assert_eq!(err.kind(), "InputError");
        let err = CloudStorage::new(Some("mailto:ops@example.com"), None).unwrap_err();
        assert_eq!(err.kind(), "InputError");
    }

    #[test]
    fn empty_token_ignored() {
        let gcs = CloudStorage::new(None, Some(String::new())).unwrap();
        assert!(gcs.token.is_none());
    }

    #[test]
    fn metadata_from_resource() {
        let body = br#"{"kind":"storage#object","name":"a.zip","metadata":{"dataset":"drug-event","release":"2024q1"}}"#;
        let meta = object_metadata(body).unwrap();
        assert_eq!(meta.len(), 2);
        assert_eq!(meta["release"], "2024q1");
    }

    #[test]
    fn resource_without_metadata_is_empty() {
        let meta = object_metadata(br#"{"name":"a.zip"}"#).unwrap();
        assert!(meta.is_empty());
    }

    #[test]
    fn metadata_over_http() {
        let server = LocalServer::start();
        server.mount(
            Mock::given(method("GET"))
                .and(path("/storage/v1/b/b/o/dir%2Fa.zip"))
                .and(header("authorization", "Bearer tok"))
                .respond_with(
                    ResponseTemplate::new(200).set_body_json(json!({"metadata": {"dataset": "drug-event"}})),
                )
                .expect(1),
        );

        let gcs = CloudStorage::new(Some(server.uri().as_str()), Some("tok".into())).unwrap();
        let meta = CloudStorageMetadata::new(gcs).get("b", "dir/a.zip").unwrap();
        assert_eq!(meta["dataset"], "drug-event");
    }

    #[test]
    fn media_download_streams_body() {
        let server = LocalServer::start();
        server.mount(
            Mock::given(method("GET"))
                .and(path("/storage/v1/b/b/o/a.zip"))
                .and(query_param("alt", "media"))
                .respond_with(ResponseTemplate::new(200).set_body_bytes(b"PK-bytes".to_vec()))
                .expect(1),
        );

        let gcs = CloudStorage::new(Some(server.uri().as_str()), None).unwrap();
        let mut body = String::new();
        CloudStorageSource::new(gcs)
            .open("b", "a.zip")
            .unwrap()
            .read_to_string(&mut body)
            .unwrap();
        assert_eq!(body, "PK-bytes");
    }

    #[test]
    fn missing_object_is_not_found() {
        let server = LocalServer::start();
        server.mount(
            Mock::given(method("GET"))
                .and(path("/storage/v1/b/b/o/gone.zip"))
                .respond_with(ResponseTemplate::new(404).set_body_string("No such object"))
                .expect(1),
        );

        let gcs = CloudStorage::new(Some(server.uri().as_str()), None).unwrap();
        let err = CloudStorageSource::new(gcs).open("b", "gone.zip").err().unwrap();
        assert_eq!(err.kind(), "NotFoundError");
    }
}
