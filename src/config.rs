//! Corefile-style configuration

use crate::plugin::{create_plugin, SharedState, Plugin};
use anyhow::{Context, Result};
use std::sync::Arc;

/// Used when no config file is given on the command line.
pub const DEFAULT_COREFILE: &str = r#"
. {
    log
    policy 0.0.0.0 {
        example.com 192.168.100.10
        youtube.com 192.168.100.20
    }
}
"#;

#[derive(Clone, Debug, PartialEq)]
pub struct PluginConfig {
    pub name: String,
    pub args: Vec<String>,
    pub block: Vec<PluginConfig>,
}

pub struct Config {
    pub zones: Vec<ZoneConfig>,
}

pub struct ZoneConfig {
    pub name: String,
    /// Port from a `zone:port` key; `None` means the CLI listen port.
    pub port: Option<u16>,
    pub plugins: Vec<Box<dyn Plugin>>,
}

#[derive(Debug, PartialEq)]
enum Token { Text(String), OpenBrace, CloseBrace, Newline }

#[derive(Debug)]
struct RawZone { name: String, plugins: Vec<PluginConfig> }

impl Config {
    /// Load configuration from a file path
    pub fn load(path: &str, shared: Arc<SharedState>) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file '{}'", path))?;
        Self::parse(&content, shared)
    }

    pub fn parse(content: &str, shared: Arc<SharedState>) -> Result<Self> {
        let tokens = Self::lex(content);
        let raw_zones = Self::parse_tokens(&tokens)?;
        if raw_zones.is_empty() {
            anyhow::bail!("configuration defines no server blocks");
        }

        let mut zones = Vec::new();
        for raw in raw_zones {
            let port = zone_port(&raw.name)?;
            let mut plugins = Vec::new();
            for p_cfg in &raw.plugins {
                let plugin = create_plugin(p_cfg, shared.clone())
                    .with_context(|| format!("in server block '{}'", raw.name))?;
                plugins.push(plugin);
            }

            // Execution order comes from priority, not from the order written.
            plugins.sort_by(|a, b| b.priority().cmp(&a.priority()));

            zones.push(ZoneConfig { name: raw.name, port, plugins });
        }
        Ok(Config { zones })
    }

    fn lex(input: &str) -> Vec<Token> {
        let mut tokens = Vec::new();
        let mut chars = input.chars().peekable();
        while let Some(&c) = chars.peek() {
            if c == '\n' { tokens.push(Token::Newline); chars.next(); }
            else if c.is_whitespace() { chars.next(); }
            else if c == '#' { while let Some(&c) = chars.peek() { if c == '\n' { break; } chars.next(); } }
            else if c == '{' { tokens.push(Token::OpenBrace); chars.next(); }
            else if c == '}' { tokens.push(Token::CloseBrace); chars.next(); }
            else if c == '"' {
                chars.next();
                let mut s = String::new();
                while let Some(&c) = chars.peek() { if c == '"' { chars.next(); break; } s.push(c); chars.next(); }
                tokens.push(Token::Text(s));
            } else {
                let mut s = String::new();
                while let Some(&c) = chars.peek() {
                    if c.is_whitespace() || c == '#' || c == '{' || c == '}' || c == '"' { break; }
                    s.push(c); chars.next();
                }
                tokens.push(Token::Text(s));
            }
        }
        tokens
    }

    fn parse_tokens(tokens: &[Token]) -> Result<Vec<RawZone>> {
        let mut i = 0;
        let mut zones = Vec::new();
        let mut zone_names = Vec::new();
        while i < tokens.len() {
            match &tokens[i] {
                Token::Text(s) => { zone_names.push(s.clone()); i += 1; }
                Token::OpenBrace => {
                    i += 1;
                    if zone_names.is_empty() { anyhow::bail!("server block without a zone name"); }
                    let (plugins, next_i) = Self::parse_block(tokens, i)?;
                    i = next_i;
                    for name in zone_names.drain(..) { zones.push(RawZone { name, plugins: plugins.clone() }); }
                }
                Token::Newline => { i += 1; zone_names.clear(); }
                Token::CloseBrace => anyhow::bail!("unexpected '}}' at top level"),
            }
        }
        Ok(zones)
    }

    /// Parse a configuration block starting at position i
    fn parse_block(tokens: &[Token], mut i: usize) -> Result<(Vec<PluginConfig>, usize)> {
        let mut plugins = Vec::new();
        while i < tokens.len() {
            match &tokens[i] {
                Token::Newline => { i += 1; }
                Token::CloseBrace => { i += 1; return Ok((plugins, i)); }
                Token::Text(name) => {
                    let plugin_name = name.clone(); i += 1;
                    let mut args = Vec::new();
                    let mut block = Vec::new();
                    while i < tokens.len() {
                        match &tokens[i] {
                            Token::Text(arg) => { args.push(arg.clone()); i += 1; }
                            Token::OpenBrace => {
                                i += 1;
                                let (sub_block, next_i) = Self::parse_block(tokens, i)?;
                                block = sub_block; i = next_i; break;
                            }
                            Token::Newline | Token::CloseBrace => { break; }
                        }
                    }
                    plugins.push(PluginConfig { name: plugin_name, args, block });
                }
                Token::OpenBrace => anyhow::bail!("block without a directive"),
            }
        }
        anyhow::bail!("unterminated block: missing '}}'")
    }
}

/// `.:1053` -> `Some(1053)`, `.` -> `None`.
fn zone_port(zone: &str) -> Result<Option<u16>> {
    match zone.rsplit_once(':') {
        Some((_, port)) => port.parse::<u16>()
            .map(Some)
            .with_context(|| format!("invalid port in server block '{}'", zone)),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shared() -> Arc<SharedState> { Arc::new(SharedState::new(None)) }

    #[test]
    fn lexes_comments_and_quotes() {
        let tokens = Config::lex("a \"b c\" # ignored\n{}");
        assert_eq!(tokens, vec![
            Token::Text("a".into()), Token::Text("b c".into()), Token::Newline,
            Token::OpenBrace, Token::CloseBrace,
        ]);
    }

    #[test]
    fn parses_nested_policy_block() {
        let tokens = Config::lex(".:1053 {\n log\n policy 10.0.0.1 {\n  example.com 192.168.100.10\n }\n}\n");
        let zones = Config::parse_tokens(&tokens).unwrap();
        assert_eq!(zones.len(), 1);
        assert_eq!(zones[0].name, ".:1053");
        let policy = &zones[0].plugins[1];
        assert_eq!(policy.name, "policy");
        assert_eq!(policy.args, vec!["10.0.0.1".to_string()]);
        assert_eq!(policy.block[0], PluginConfig {
            name: "example.com".into(),
            args: vec!["192.168.100.10".into()],
            block: vec![],
        });
    }

    #[test]
    fn default_corefile_builds_sorted_chain() {
        let cfg = Config::parse(DEFAULT_COREFILE, shared()).unwrap();
        assert_eq!(cfg.zones.len(), 1);
        assert_eq!(cfg.zones[0].port, None);
        let names: Vec<_> = cfg.zones[0].plugins.iter().map(|p| p.name()).collect();
        assert_eq!(names, vec!["log", "policy"]);
    }

    #[test]
    fn zone_ports() {
        assert_eq!(zone_port(".:5353").unwrap(), Some(5353));
        assert_eq!(zone_port(".").unwrap(), None);
        assert!(zone_port(".:dns").is_err());
    }

    #[test]
    fn config_errors_are_fatal() {
        assert!(Config::parse("", shared()).is_err());
        assert!(Config::parse(". {\n bogus\n}\n", shared()).is_err());
        assert!(Config::parse(". {\n policy {\n a.com 999.1.1.1\n }\n}\n", shared()).is_err());
        assert!(Config::parse(". {\n log\n", shared()).is_err());
        assert!(Config::parse("}\n", shared()).is_err());
    }

    #[test]
    fn loads_from_file() {
        let path = std::env::temp_dir().join(format!("sinkhole-corefile-{}", std::process::id()));
        std::fs::write(&path, ".:5300 {\n policy {\n lab.internal 10.1.2.3\n }\n}\n").unwrap();
        let cfg = Config::load(&path.to_string_lossy(), shared()).unwrap();
        std::fs::remove_file(&path).unwrap();
        assert_eq!(cfg.zones[0].port, Some(5300));
        assert!(Config::load("/nonexistent/Corefile", shared()).is_err());
    }
}
