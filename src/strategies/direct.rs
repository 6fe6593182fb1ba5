//! Stage 1: one pooled transport request with the engine's current identity.

use std::sync::Arc;

use async_trait::async_trait;

use super::{FetchStrategy, StrategyContext, StrategyEnv, StrategyStage};
use crate::engine::FetchResult;
use crate::modules::fingerprint::HeaderVariation;
use crate::transport::HttpTransport;

pub struct DirectStrategy {
    env: StrategyEnv,
    transport: Arc<dyn HttpTransport>,
}

impl DirectStrategy {
    pub fn new(env: StrategyEnv, transport: Arc<dyn HttpTransport>) -> Self {
        Self { env, transport }
    }
}

#[async_trait]
impl FetchStrategy for DirectStrategy {
    fn name(&self) -> &'static str {
        "direct"
    }

    fn stage(&self) -> StrategyStage {
        StrategyStage::Direct
    }

    async fn attempt(&self, ctx: &StrategyContext<'_>) -> FetchResult {
        self.env
            .transport_attempt(
                self.transport.as_ref(),
                ctx,
                ctx.fingerprint,
                self.name(),
                1,
                HeaderVariation::default(),
            )
            .await
    }
}
