//! HTTP push endpoint as the message bus.
//!
//! Each window is POSTed as one JSON array of messages. The endpoint answers
//! for the window as a whole:
//!
//! | response              | effect                                  |
//! |-----------------------|-----------------------------------------|
//! | 2xx                   | every message acknowledged              |
//! | 4xx (not 408/429)     | every message rejected, run continues   |
//! | 408, 429, 5xx, no response | [`BusUnavailable`], run fails      |

use bucketpub_core::{Ack, BusClient, BusUnavailable, OutgoingMessage, PipelineError};
use reqwest::Url;
use reqwest::header::CONTENT_TYPE;

use crate::stream::{StreamError, http_client, send};

#[derive(Debug, Clone)]
pub struct HttpBus {
    url: Url,
    token: Option<String>,
}

impl HttpBus {
    pub fn new(url: &str, token: Option<String>) -> Result<Self, PipelineError> {
        let url = Url::parse(url)
            .map_err(|e| PipelineError::Input(format!("invalid bus URL {url:?}: {e}")))?;
        Ok(Self {
            url,
            token: token.filter(|t| !t.is_empty()),
        })
    }
}

/// `[msg, msg, ...]` from already-serialized payloads
fn json_array(batch: &[OutgoingMessage]) -> Vec<u8> {
    let len = batch.iter().map(|m| m.payload.len() + 1).sum::<usize>() + 2;
    let mut body = Vec::with_capacity(len);
    body.push(b'[');
    for (i, msg) in batch.iter().enumerate() {
        if i > 0 {
            body.push(b',');
        }
        body.extend_from_slice(&msg.payload);
    }
    body.push(b']');
    body
}

/// Whether a failed exchange rejects the window or takes the bus down
fn rejects_window(e: &StreamError) -> bool {
    matches!(e.status(), Some(s) if (400..500).contains(&s) && s != 408 && s != 429)
}

impl BusClient for HttpBus {
    fn send(&self, batch: &[OutgoingMessage]) -> Result<Vec<Ack>, BusUnavailable> {
        let mut request = http_client()
            .post(self.url.clone())
            .header(CONTENT_TYPE, "application/json")
            .body(json_array(batch));
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        match send(request) {
            Ok(_) => Ok(vec![Ok(()); batch.len()]),
            Err(e) if rejects_window(&e) => Ok(vec![Err(e.to_string()); batch.len()]),
            Err(e) => Err(BusUnavailable(format!("{}: {e}", self.url))),
        }
    }
}
