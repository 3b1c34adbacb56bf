use crate::plugin::{Plugin, SharedState};
use crate::config::PluginConfig;
use crate::types::DnsMessage;
use anyhow::Result;
use std::sync::Arc;

/// Audit line for every decoded query.
pub struct LogPlugin;

#[async_trait::async_trait]
impl Plugin for LogPlugin {
    fn name(&self) -> &str { "log" }
    fn from_config(_: &PluginConfig, _: Arc<SharedState>) -> Result<Self> {
        tracing::info!("[log] Query logging enabled");
        Ok(Self)
    }
    async fn process(&self, msg: &mut DnsMessage) -> Result<()> {
        let Some(question) = msg.query.as_ref().and_then(|q| q.questions.first()) else { return Ok(()) };
        match msg.client_addr {
            Some(src) => tracing::info!("Query: {} ({}) from {}", question.name.to_lowercase_string(), question.qtype, src),
            None => tracing::info!("Query: {} ({})", question.name.to_lowercase_string(), question.qtype),
        }
        Ok(())
    }
    fn priority(&self) -> u8 { 255 }
}
