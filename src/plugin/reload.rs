use crate::plugin::{Plugin, SharedState};
use crate::config::PluginConfig;
use crate::types::DnsMessage;
use anyhow::Result;
use std::sync::Arc;
use tokio::time::{sleep, Duration};
use sha2::{Sha512, Digest};
use rand::Rng;

const DEFAULT_INTERVAL: Duration = Duration::from_secs(30);
const DEFAULT_JITTER: Duration = Duration::from_secs(15);

/// Watches the config file and asks the main loop to rebuild every listener
/// and policy table when its contents change.
pub struct ReloadPlugin {
    _handle: tokio::task::JoinHandle<()>,
}

#[async_trait::async_trait]
impl Plugin for ReloadPlugin {
    fn name(&self) -> &str { "reload" }

    fn from_config(config: &PluginConfig, shared: Arc<SharedState>) -> Result<Self> {
        let (interval, jitter) = parse_timing(&config.args)?;

        let path = shared.config_path.clone()
            .ok_or_else(|| anyhow::anyhow!("reload: no config file to watch"))?;
        let initial_hash = hash_file(&path)?;

        tracing::info!("[reload] Watching changes for {} (Interval: {:?}, Jitter: {:?})", path, interval, jitter);

        // Keeps watching after a signal: if the new file fails to load, the
        // current generation stays up and the next edit must still be seen.
        let handle = tokio::spawn(async move {
            let mut current_hash = initial_hash;
            loop {
                sleep(jittered(interval, jitter)).await;

                match hash_file(&path) {
                    Ok(new_hash) if new_hash != current_hash => {
                        tracing::info!("[reload] Config change detected! New SHA512: {}", new_hash);
                        let _ = shared.reload_tx.send(true);
                        current_hash = new_hash;
                    }
                    Ok(_) => {}
                    Err(e) => tracing::error!("[reload] Failed to read config: {}", e),
                }
            }
        });

        Ok(Self { _handle: handle })
    }

    async fn process(&self, _msg: &mut DnsMessage) -> Result<()> { Ok(()) }
    fn priority(&self) -> u8 { 190 }
}

impl Drop for ReloadPlugin {
    fn drop(&mut self) {
        self._handle.abort();
    }
}

/// `reload [INTERVAL [JITTER]]`: interval floors at 2s, jitter at 1s and is
/// capped at half the interval.
fn parse_timing(args: &[String]) -> Result<(Duration, Duration)> {
    let mut interval = match args.first() {
        Some(a) => parse_duration(a)?,
        None => DEFAULT_INTERVAL,
    };
    let mut jitter = match args.get(1) {
        Some(a) => parse_duration(a)?,
        None => DEFAULT_JITTER,
    };

    interval = interval.max(Duration::from_secs(2));
    jitter = jitter.max(Duration::from_secs(1)).min(interval / 2);
    Ok((interval, jitter))
}

fn jittered(interval: Duration, jitter: Duration) -> Duration {
    let j = jitter.as_millis() as u64;
    let offset = rand::thread_rng().gen_range(0..=j * 2) as i64 - j as i64;
    if offset >= 0 { interval + Duration::from_millis(offset as u64) }
    else { interval - Duration::from_millis(offset.unsigned_abs()) }
}

fn hash_file(path: &str) -> Result<String> {
    let content = std::fs::read(path)?;
    let mut hasher = Sha512::new();
    hasher.update(&content);
    Ok(hex::encode(hasher.finalize()))
}

fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim();
    if let Some(stripped) = s.strip_suffix("ms") { Ok(Duration::from_millis(stripped.parse()?)) }
    else if let Some(stripped) = s.strip_suffix('s') { Ok(Duration::from_secs(stripped.parse()?)) }
    else if let Some(stripped) = s.strip_suffix('m') { Ok(Duration::from_secs(stripped.parse::<u64>()? * 60)) }
    else if let Some(stripped) = s.strip_suffix('h') { Ok(Duration::from_secs(stripped.parse::<u64>()? * 3600)) }
    else { anyhow::bail!("invalid duration '{}'", s) }
}
