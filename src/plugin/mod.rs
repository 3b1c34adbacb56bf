pub mod log;
pub mod policy;
pub mod reload;

use anyhow::Result;
use std::sync::Arc;
use crate::config::PluginConfig;
use crate::types::DnsMessage;

#[async_trait::async_trait]
pub trait Plugin: Send + Sync {
    fn name(&self) -> &str;
    fn from_config(config: &PluginConfig, shared: Arc<SharedState>) -> Result<Self> where Self: Sized;
    async fn process(&self, msg: &mut DnsMessage) -> Result<()>;
    fn priority(&self) -> u8;
}

pub struct SharedState {
    pub reload_tx: tokio::sync::watch::Sender<bool>,
    pub reload_rx: std::sync::Mutex<Option<tokio::sync::watch::Receiver<bool>>>,
    /// `None` when running on the built-in default configuration.
    pub config_path: Option<String>,
}

impl SharedState {
    pub fn new(config_path: Option<String>) -> Self {
        let (reload_tx, reload_rx) = tokio::sync::watch::channel(false);
        Self {
            reload_tx,
            reload_rx: std::sync::Mutex::new(Some(reload_rx)),
            config_path,
        }
    }

    pub fn take_reload_rx(&self) -> Result<tokio::sync::watch::Receiver<bool>> {
        self.reload_rx
            .lock()
            .map_err(|_| anyhow::anyhow!("reload receiver lock poisoned"))?
            .take()
            .ok_or_else(|| anyhow::anyhow!("reload receiver already taken"))
    }
}

pub fn create_plugin(config: &PluginConfig, shared: Arc<SharedState>) -> Result<Box<dyn Plugin>> {
    match config.name.as_str() {
        "log" => Ok(Box::new(log::LogPlugin::from_config(config, shared)?)),
        "policy" => Ok(Box::new(policy::PolicyPlugin::from_config(config, shared)?)),
        "reload" => Ok(Box::new(reload::ReloadPlugin::from_config(config, shared)?)),
        _ => anyhow::bail!("Unknown plugin: {}", config.name),
    }
}
