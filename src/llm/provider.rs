use async_trait::async_trait;

use crate::errors::DeskResult;
use crate::llm::registry::ProviderProfile;
use crate::llm::types::{ModelRequest, ModelResponse};

/// One round trip to a reasoning backend. The profile picks adapter, endpoint,
/// model and credentials; nothing provider-specific is passed per call.
///
/// Failures must surface as `DeskPilotError::ProviderFailure` (or a transport
/// error) so the scheduler can tell them apart from unusable output.
#[async_trait]
pub trait ModelTransport: Send + Sync {
    async fn complete(&self, profile: &ProviderProfile, request: &ModelRequest) -> DeskResult<ModelResponse>;
}
