use clap::Parser;
use localsearch_core::BridgeConfig;
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "localsearch-mcp", version, about = "Local web search over MCP stdio")]
pub struct Args {
    /// Config file to use instead of ~/.localsearch/config.json.
    #[arg(long, env = "LOCALSEARCH_CONFIG")]
    pub config: Option<PathBuf>,

    /// Executable that runs the search (e.g. python3).
    #[arg(long, env = "LOCALSEARCH_COMMAND")]
    pub command: Option<String>,

    /// Leading argument for the executable, repeatable (e.g. the script path).
    #[arg(long = "arg", value_name = "ARG")]
    pub command_args: Vec<String>,

    /// Seconds before a search is killed; 0 waits forever.
    #[arg(long, env = "LOCALSEARCH_TIMEOUT_SECS")]
    pub timeout_secs: Option<u64>,

    /// Per-stream cap on captured output, in bytes.
    #[arg(long, env = "LOCALSEARCH_MAX_OUTPUT_BYTES")]
    pub max_output_bytes: Option<usize>,
}

impl Args {
    /// Flags win over whatever the config files said.
    pub fn apply(&self, mut config: BridgeConfig) -> BridgeConfig {
        if let Some(command) = &self.command {
            config.search.command = command.clone();
        }
        if !self.command_args.is_empty() {
            config.search.args = self.command_args.clone();
        }
        if let Some(secs) = self.timeout_secs {
            config.timeout_secs = secs;
        }
        if let Some(bytes) = self.max_output_bytes {
            config.max_output_bytes = bytes;
        }
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_override_config() {
        let args = Args::parse_from([
            "localsearch-mcp",
            "--command",
            "/usr/bin/python3.12",
            "--arg",
            "/srv/local_search.py",
            "--timeout-secs",
            "0",
        ]);
        let config = args.apply(BridgeConfig::default());
        assert_eq!(config.search.command, "/usr/bin/python3.12");
        assert_eq!(config.search.args, vec!["/srv/local_search.py"]);
        assert_eq!(config.timeout_secs, 0);
        assert_eq!(config.max_output_bytes, BridgeConfig::default().max_output_bytes);
    }

    #[test]
    fn no_flags_leave_config_alone() {
        let args = Args::parse_from(["localsearch-mcp"]);
        let before = BridgeConfig {
            timeout_secs: 7,
            ..Default::default()
        };
        let after = args.apply(before.clone());
        assert_eq!(after.timeout_secs, 7);
        assert_eq!(after.search.args, before.search.args);
    }
}
