//! Redis-backed [`SharedBucketStore`] built on `rustis`.

use async_trait::async_trait;
use rustis::client::Client;
use rustis::commands::{CallBuilder, ConnectionCommands, PingOptions, ScriptingCommands};

use super::{BucketRequest, SharedBucketStore, StoreError, TOKEN_BUCKET_SCRIPT};

pub struct RedisBucketStore {
    client: Client,
}

impl RedisBucketStore {
    /// Connect to `redis://[:password@]host:port/db`.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client = Client::connect(url)
            .await
            .map_err(|err| StoreError::Unreachable(err.to_string()))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl SharedBucketStore for RedisBucketStore {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn ping(&self) -> Result<(), StoreError> {
        let _: String = self
            .client
            .ping(PingOptions::default())
            .await
            .map_err(|err| StoreError::Unreachable(err.to_string()))?;
        Ok(())
    }

    async fn take_tokens(&self, request: &BucketRequest<'_>) -> Result<bool, StoreError> {
        let args = [
            request.capacity.to_string(),
            request.refill_per_sec.to_string(),
            request.cost.to_string(),
            request.now_secs.to_string(),
            request.ttl.as_secs().max(1).to_string(),
        ];
        let granted: i64 = self
            .client
            .eval(
                CallBuilder::script(TOKEN_BUCKET_SCRIPT)
                    .keys(request.key.to_string())
                    .args(args),
            )
            .await
            .map_err(|err| StoreError::Command(err.to_string()))?;
        Ok(granted == 1)
    }
}
