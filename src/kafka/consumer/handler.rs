use std::future::Future;

use async_trait::async_trait;

use crate::kafka::types::EachMessagePayload;

/// User code invoked once per delivered record.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn each_message(&self, payload: EachMessagePayload) -> anyhow::Result<()>;
}

#[async_trait]
impl<F, Fut> MessageHandler for F
where
    F: Fn(EachMessagePayload) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn each_message(&self, payload: EachMessagePayload) -> anyhow::Result<()> {
        (self)(payload).await
    }
}
