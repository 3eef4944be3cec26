//! Options passed to a freshly spawned agent subprocess, plus the
//! tool-server descriptor variants it can be handed.

use std::collections::HashMap;

use ag_domain::config::{AgentDefaultsConfig, McpServerConfig, PermissionMode};
use serde::Serialize;

/// Serialized verbatim as the `--options` JSON blob the agent CLI reads
/// at startup.
#[derive(Debug, Clone, Serialize)]
pub struct AgentOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    pub permission_mode: PermissionMode,
    pub allowed_tools: Vec<String>,
    pub add_dirs: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub max_turns: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_budget_usd: Option<f64>,
    pub mcp_servers: HashMap<String, McpServerSpec>,
    pub setting_sources: Vec<String>,
    pub plugins: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resume: Option<ResumeToken>,
}

/// The serialized form of a tool server handed to the agent: a tagged
/// variant, stdio or SSE.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "transport", rename_all = "lowercase")]
pub enum McpServerSpec {
    Stdio {
        command: String,
        args: Vec<String>,
        env: HashMap<String, String>,
    },
    Sse {
        url: String,
        headers: HashMap<String, String>,
    },
}

impl From<&McpServerConfig> for McpServerSpec {
    fn from(cfg: &McpServerConfig) -> Self {
        match cfg {
            McpServerConfig::Stdio { command, args, env } => McpServerSpec::Stdio {
                command: command.clone(),
                args: args.clone(),
                env: env.clone(),
            },
            McpServerConfig::Sse { url, headers } => McpServerSpec::Sse {
                url: url.clone(),
                headers: headers.clone(),
            },
        }
    }
}

/// Opaque token the agent subprocess uses to restore its own on-disk
/// conversation log. The core never inspects its contents.
#[derive(Debug, Clone, Serialize)]
pub struct ResumeToken(pub String);

impl AgentOptions {
    /// Build the options for a fresh session from process-wide defaults,
    /// the per-session `add_dirs`, and an optional resume token.
    pub fn from_defaults(
        defaults: &AgentDefaultsConfig,
        add_dirs: Vec<String>,
        resume: Option<ResumeToken>,
    ) -> Self {
        Self {
            system_prompt: defaults.system_prompt.clone(),
            permission_mode: defaults.permission_mode,
            allowed_tools: defaults.allowed_tools.clone(),
            add_dirs,
            model: defaults.model.clone(),
            max_turns: defaults.max_turns,
            max_budget_usd: defaults.max_budget_usd,
            mcp_servers: defaults
                .mcp_servers
                .iter()
                .map(|(name, cfg)| (name.clone(), McpServerSpec::from(cfg)))
                .collect(),
            setting_sources: defaults.setting_sources.clone(),
            plugins: defaults.plugins.clone(),
            resume,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_defaults_carries_resume_token() {
        let defaults = AgentDefaultsConfig::default();
        let opts = AgentOptions::from_defaults(
            &defaults,
            vec!["extra".into()],
            Some(ResumeToken("abc".into())),
        );
        assert_eq!(opts.add_dirs, vec!["extra".to_string()]);
        assert!(opts.resume.is_some());
    }

    #[test]
    fn mcp_stdio_descriptor_round_trips_to_json() {
        let spec = McpServerSpec::Stdio {
            command: "node".into(),
            args: vec!["server.js".into()],
            env: HashMap::new(),
        };
        let json = serde_json::to_value(&spec).unwrap();
        assert_eq!(json["transport"], "stdio");
        assert_eq!(json["command"], "node");
    }
}
