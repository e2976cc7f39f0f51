//! Requester side collaborator.  Receives the `responses` array of each
//! inbound envelope and may answer with follow-up requests.

use dslink_protocol::{RawRequest, Response};

#[async_trait::async_trait]
pub trait Requester: Send + Sync + 'static {
    async fn process_responses(&self, responses: Vec<Response>) -> Vec<RawRequest>;
}

/// Requester for responder-only links.  Drops every response.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullRequester;

#[async_trait::async_trait]
impl Requester for NullRequester {
    async fn process_responses(&self, responses: Vec<Response>) -> Vec<RawRequest> {
        tracing::trace!(count = responses.len(), "responses ignored");
        Vec::new()
    }
}
