use crate::plugin::{Plugin, SharedState};
use crate::config::PluginConfig;
use crate::policy::{resolve, PolicyTable, DEFAULT_SINKHOLE};
use crate::types::DnsMessage;
use anyhow::{Context, Result};
use std::net::Ipv4Addr;
use std::sync::Arc;

/// `policy [SINKHOLE] { DOMAIN ADDRESS ... }`
pub struct PolicyPlugin {
    table: PolicyTable,
}

#[async_trait::async_trait]
impl Plugin for PolicyPlugin {
    fn name(&self) -> &str { "policy" }

    fn from_config(config: &PluginConfig, _: Arc<SharedState>) -> Result<Self> {
        let sinkhole = match config.args.first() {
            Some(arg) => arg.parse::<Ipv4Addr>()
                .with_context(|| format!("policy: invalid sinkhole address '{}'", arg))?,
            None => DEFAULT_SINKHOLE,
        };

        let mut table = PolicyTable::new(sinkhole);
        for entry in &config.block {
            let addr = entry.args.first()
                .ok_or_else(|| anyhow::anyhow!("policy: no address given for '{}'", entry.name))?;
            let addr = addr.parse::<Ipv4Addr>()
                .with_context(|| format!("policy: invalid address '{}' for '{}'", addr, entry.name))?;
            if let Some(prev) = table.insert(&entry.name, addr) {
                tracing::warn!("[policy] Duplicate entry for {} ({} replaced by {})", entry.name, prev, addr);
            }
        }

        tracing::info!("[policy] All other queries blocked -> {}", table.sinkhole());
        if table.is_empty() {
            tracing::warn!("[policy] Allow-list is empty, every query resolves to the sinkhole");
        } else {
            tracing::info!("[policy] Allowed domains ({}):", table.len());
            for (domain, addr) in table.entries() {
                tracing::info!("[policy]   {} -> {}", domain, addr);
            }
        }

        Ok(Self { table })
    }

    async fn process(&self, msg: &mut DnsMessage) -> Result<()> {
        if msg.halt_chain { return Ok(()); }
        let Some(query) = &msg.query else { return Ok(()) };

        if let Some(response) = resolve(query, &self.table) {
            if let Some(answer) = response.answers.first() {
                tracing::debug!("    |-- [policy] {} -> {}", answer.name, answer.addr);
            }
            msg.response = Some(response);
            msg.answered_by = "policy".to_string();
            msg.halt_chain = true;
        }
        Ok(())
    }

    fn priority(&self) -> u8 { 100 }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{build_query, decode};
    use crate::config::PluginConfig;
    use crate::types::Name;

    fn entry(domain: &str, addr: &str) -> PluginConfig {
        PluginConfig { name: domain.to_string(), args: vec![addr.to_string()], block: vec![] }
    }

    fn shared() -> Arc<SharedState> { Arc::new(SharedState::new(None)) }

    #[test]
    fn builds_table_from_block() {
        let cfg = PluginConfig {
            name: "policy".to_string(),
            args: vec!["10.9.9.9".to_string()],
            block: vec![entry("Example.com", "192.168.100.10")],
        };
        let plugin = PolicyPlugin::from_config(&cfg, shared()).unwrap();
        assert_eq!(plugin.table.sinkhole(), Ipv4Addr::new(10, 9, 9, 9));
        assert_eq!(plugin.table.lookup(&Name::from_ascii("example.com")), Ipv4Addr::new(192, 168, 100, 10));
    }

    #[test]
    fn rejects_bad_addresses() {
        let bad_sinkhole = PluginConfig { name: "policy".into(), args: vec!["nope".into()], block: vec![] };
        assert!(PolicyPlugin::from_config(&bad_sinkhole, shared()).is_err());

        let bad_entry = PluginConfig { name: "policy".into(), args: vec![], block: vec![entry("a.com", "::1")] };
        assert!(PolicyPlugin::from_config(&bad_entry, shared()).is_err());

        let missing = PluginConfig { name: "policy".into(), args: vec![], block: vec![PluginConfig { name: "a.com".into(), args: vec![], block: vec![] }] };
        assert!(PolicyPlugin::from_config(&missing, shared()).is_err());
    }

    #[tokio::test]
    async fn answers_and_halts_chain() {
        let cfg = PluginConfig { name: "policy".into(), args: vec![], block: vec![entry("example.com", "192.168.100.10")] };
        let plugin = PolicyPlugin::from_config(&cfg, shared()).unwrap();

        let raw = build_query(7, &[("example.com", 1)]);
        let mut msg = DnsMessage::new(raw.clone(), decode(&raw).unwrap(), "127.0.0.1:5353".parse().unwrap(), 53);
        plugin.process(&mut msg).await.unwrap();

        assert!(msg.halt_chain);
        assert_eq!(msg.answered_by, "policy");
        let response = msg.response.unwrap();
        assert_eq!(response.id, 7);
        assert_eq!(response.answers[0].addr, Ipv4Addr::new(192, 168, 100, 10));
    }
}
