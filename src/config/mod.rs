//! Command-line and environment options.

use std::time::Duration;

use clap::Parser;

use crate::plugin::PluginConfig;
use crate::rules::parse_duration;

/// Response-caching plugin for a reverse proxy.
#[derive(Parser, Debug, Clone)]
#[command(name = "reproxy-cache", version, about, long_about = None)]
pub struct Options {
    /// Address the hook endpoint listens on.
    #[arg(short, long, env = "LISTEN", default_value = "0.0.0.0:8080")]
    pub listen: String,

    /// Base URL of the proxy's plugin registration endpoint.
    #[arg(short, long, env = "REPROXY", default_value = "http://127.0.0.1:8081")]
    pub reproxy: String,

    /// Caching rule, `<route> <method>[|<method>...] <timeout> [yes]`; repeatable.
    ///
    /// Routes are taken verbatim, commas included, so several rules in `RULES`
    /// go on separate lines.
    #[arg(long = "rule", env = "RULES", value_delimiter = '\n')]
    pub rules: Vec<String>,

    /// How often expired entries are swept from memory.
    #[arg(
        long,
        env = "CLEANUP_INTERVAL",
        value_parser = parse_duration,
        default_value = "10m"
    )]
    pub cleanup_interval: Duration,

    /// Name announced to the proxy.
    #[arg(long, env = "PLUGIN_NAME", default_value = "cache")]
    pub plugin_name: String,

    /// Enable debug logging.
    #[arg(long, env = "DBG")]
    pub dbg: bool,
}

impl Options {
    /// Plugin endpoint settings derived from these options.
    pub fn plugin_config(&self) -> PluginConfig {
        PluginConfig {
            name: self.plugin_name.clone(),
            listen: self.listen.clone(),
            upstream: self.reproxy.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let opts = Options::try_parse_from(["reproxy-cache"]).unwrap();
        assert_eq!(opts.listen, "0.0.0.0:8080");
        assert_eq!(opts.reproxy, "http://127.0.0.1:8081");
        assert!(opts.rules.is_empty());
        assert_eq!(opts.cleanup_interval, crate::storage::DEFAULT_CLEANUP_INTERVAL);
        assert_eq!(opts.plugin_name, "cache");
        assert!(!opts.dbg);
    }

    #[test]
    fn repeatable_rules_keep_spaces() {
        let opts = Options::try_parse_from([
            "reproxy-cache",
            "--rule",
            "r1 GET 5s",
            "--rule",
            "r2 GET|POST 10s yes",
            "--cleanup-interval",
            "1m30s",
            "--dbg",
        ])
        .unwrap();
        assert_eq!(opts.rules, vec!["r1 GET 5s", "r2 GET|POST 10s yes"]);
        assert_eq!(opts.cleanup_interval, Duration::from_secs(90));
        assert!(opts.dbg);
    }

    #[test]
    fn rule_routes_keep_commas() {
        let opts =
            Options::try_parse_from(["reproxy-cache", "--rule", "^/v{1,2}/users GET 5s"]).unwrap();
        assert_eq!(opts.rules, vec!["^/v{1,2}/users GET 5s"]);

        let rules = crate::rules::RuleSet::parse(&opts.rules).unwrap();
        assert!(rules.lookup("^/v{1,2}/users").is_some());
    }

    #[test]
    fn rule_lines_split_into_declarations() {
        let opts =
            Options::try_parse_from(["reproxy-cache", "--rule", "r1 GET 5s\nr{1,2} POST 1m yes"])
                .unwrap();
        assert_eq!(opts.rules, vec!["r1 GET 5s", "r{1,2} POST 1m yes"]);
    }

    #[test]
    fn bad_cleanup_interval_is_rejected() {
        let res = Options::try_parse_from(["reproxy-cache", "--cleanup-interval", "soon"]);
        assert!(res.is_err());
    }

    #[test]
    fn plugin_config_mirrors_options() {
        let opts =
            Options::try_parse_from(["reproxy-cache", "-l", "127.0.0.1:9000", "--plugin-name", "c2"])
                .unwrap();
        let cfg = opts.plugin_config();
        assert_eq!(cfg.listen, "127.0.0.1:9000");
        assert_eq!(cfg.name, "c2");
        assert_eq!(cfg.upstream, "http://127.0.0.1:8081");
    }
}
