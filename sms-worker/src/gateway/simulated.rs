//! In-process gateway that accepts everything.

use async_trait::async_trait;
use tracing::info;
use uuid::Uuid;

use super::{Gateway, Outcome, SendRequest};

#[derive(Debug, Default)]
pub struct SimulatedGateway;

impl SimulatedGateway {
    pub fn new() -> Self {
        SimulatedGateway
    }
}

#[async_trait]
impl Gateway for SimulatedGateway {
    async fn send(&self, request: &SendRequest) -> Outcome {
        let gateway_id = format!("sim_{}", Uuid::new_v4().simple());
        info!(
            correlation_id = %request.correlation_id,
            gateway_id = %gateway_id,
            content_length = request.content.chars().count(),
            "simulated_send_accepted"
        );
        Outcome::Accepted(gateway_id)
    }
}
