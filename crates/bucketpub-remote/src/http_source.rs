//! Plain HTTP(S) downloads as the record source

use bucketpub_core::{ByteStream, PipelineError, SourceProvider};
use reqwest::Url;

use crate::stream::{http_client, open_body};

/// Fetches objects over HTTP.
///
/// Without a base URL the object id must itself be an absolute `http(s)` URL
/// and the bucket id is only a label. With a base URL the request goes to
/// `<base>/<bucket>/<object>`.
#[derive(Debug, Clone, Default)]
pub struct HttpSource {
    base: Option<Url>,
    token: Option<String>,
}

impl HttpSource {
    pub fn new(base: Option<&str>, token: Option<String>) -> Result<Self, PipelineError> {
        let base = base
            .map(|raw| {
                Url::parse(raw)
                    .ok()
                    .filter(|u| !u.cannot_be_a_base())
                    .ok_or_else(|| PipelineError::Input(format!("invalid base URL {raw:?}")))
            })
            .transpose()?;
        Ok(Self {
            base,
            token: token.filter(|t| !t.is_empty()),
        })
    }

    pub fn url_for(&self, bucket_id: &str, object_id: &str) -> Result<Url, PipelineError> {
        let Some(base) = &self.base else {
            return Url::parse(object_id)
                .ok()
                .filter(|u| matches!(u.scheme(), "http" | "https"))
                .ok_or_else(|| {
                    PipelineError::Input(format!("object id {object_id:?} is not an http(s) URL"))
                });
        };
        let mut url = base.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.pop_if_empty().push(bucket_id);
            segments.extend(object_id.split('/').filter(|s| !s.is_empty()));
        }
        Ok(url)
    }
}

impl SourceProvider for HttpSource {
    fn open(&self, bucket_id: &str, object_id: &str) -> Result<ByteStream, PipelineError> {
        let url = self.url_for(bucket_id, object_id)?;
        let mut request = http_client().get(url);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }
        Ok(Box::new(open_body(request)?))
    }

    fn describe(&self) -> String {
        match &self.base {
            Some(base) => base.to_string(),
            None => "http".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_id_as_url() {
        let src = HttpSource::default();
        let url = src
            .url_for("downloads", "https://download.open.fda.gov/drug/event/2024q1/drug-event-0001-of-0030.json.zip")
            .unwrap();
        assert_eq!(url.host_str(), Some("download.open.fda.gov"));
    }

    #[test]
    fn relative_object_without_base_rejected() {
        let err = HttpSource::default().url_for("b", "drug/event.zip").unwrap_err();
        assert_eq!(err.kind(), "InputError");
        let err = HttpSource::default().url_for("b", "ftp://host/x.zip").unwrap_err();
        assert_eq!(err.kind(), "InputError");
    }

    #[test]
    fn base_joins_bucket_and_object() {
        let src = HttpSource::new(Some("https://mirror.example.org/exports/"), None).unwrap();
        let url = src.url_for("fda", "drug/event 1.zip").unwrap();
        assert_eq!(
            url.as_str(),
            "https://mirror.example.org/exports/fda/drug/event%201.zip"
        );
    }

    #[test]
    fn bad_base_rejected() {
        assert!(HttpSource::new(Some("::"), None).is_err());
    }
}
