//! Optional metadata lookup folded into the run's provenance

use std::sync::Arc;

use crate::error::PipelineError;
use crate::model::{Attributes, ProvenanceContext, SourceEvent};
use crate::provider::MetadataProvider;

#[derive(Clone)]
pub struct MetadataEnricher {
    provider: Arc<dyn MetadataProvider>,
}

impl MetadataEnricher {
    pub fn new(provider: Arc<dyn MetadataProvider>) -> Self {
        Self { provider }
    }

    /// Fetch the object's custom metadata.
    ///
    /// Any provider failure is reported as [`PipelineError::MetadataUnavailable`],
    /// which callers treat as a retryable startup failure.
    pub fn fetch(&self, bucket_id: &str, object_id: &str) -> Result<Attributes, PipelineError> {
        match self.provider.get(bucket_id, object_id) {
            Ok(meta) => Ok(meta),
            Err(e @ PipelineError::MetadataUnavailable(_)) => Err(e),
            Err(e) => Err(PipelineError::MetadataUnavailable(format!(
                "{bucket_id}/{object_id}: {e}"
            ))),
        }
    }

    /// Provenance for `event` with the fetched metadata attached.
    pub fn enrich(&self, event: &SourceEvent) -> Result<ProvenanceContext, PipelineError> {
        let meta = self.fetch(&event.bucket_id, &event.object_id)?;
        log::debug!("{}: {} metadata entries", event.label(), meta.len());
        Ok(ProvenanceContext::from_event(event).with_metadata(meta))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed(Result<Attributes, fn() -> PipelineError>);

    impl MetadataProvider for Fixed {
        fn get(&self, _: &str, _: &str) -> Result<Attributes, PipelineError> {
            match &self.0 {
                Ok(meta) => Ok(meta.clone()),
                Err(make) => Err(make()),
            }
        }
    }

    #[test]
    fn metadata_lands_in_provenance() {
        let mut meta = Attributes::new();
        meta.insert("dataset".into(), "drug-event".into());
        let enricher = MetadataEnricher::new(Arc::new(Fixed(Ok(meta))));
        let event = SourceEvent::new("b", "o").with_attribute("eventType", "OBJECT_FINALIZE");

        let ctx = enricher.enrich(&event).unwrap();
        assert_eq!(ctx.attributes["eventType"], "OBJECT_FINALIZE");
        assert_eq!(ctx.custom_metadata.unwrap()["dataset"], "drug-event");
    }

    #[test]
    fn provider_errors_become_unavailable() {
        let enricher = MetadataEnricher::new(Arc::new(Fixed(Err(|| {
            PipelineError::NotFound("gs://b/o".into())
        }))));
        let err = enricher.fetch("b", "o").unwrap_err();
        assert_eq!(err.kind(), "MetadataUnavailableError");
        assert!(err.is_retryable());
        assert!(err.to_string().contains("b/o"));
    }
}
