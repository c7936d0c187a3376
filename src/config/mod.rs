//! Configuration for flowtop
//!
//! Command line arguments are the only configuration surface. They are
//! parsed with clap, then converted into a validated [`Config`]; any
//! validation failure is fatal at startup.
//!
//! The documented flag spellings use a single leading dash (`-engine
//! afpacket`, `-l4`, `-print.enable`); [`normalize_args`] rewrites those
//! to the double-dash form before clap sees them, so both spellings work.

use crate::capture::{
    Direction, AFPACKET_ENGINE_NAME, LIBPCAP_ENGINE_NAME, NFLOG_ENGINE_NAME,
};
use clap::Parser;
use std::path::PathBuf;
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid engine name: {0}")]
    InvalidEngine(String),

    #[error("no interface provided")]
    NoInterface,

    #[error("no group id provided")]
    NoNflogGroup,

    #[error("invalid interface, group id and direction list: {0}")]
    InvalidNflogBinding(String),

    #[error("{0} interval must be at least 1 second")]
    InvalidInterval(&'static str),

    #[error("webhook post timeout must be at least 1 second")]
    InvalidPostTimeout,

    #[error("no webhook url provided")]
    NoWebhookUrl,
}

/// Command line arguments for flowtop
#[derive(Parser, Debug)]
#[clap(about = "Per-interface network flow meter")]
pub struct Args {
    /// Interface name list separated by comma, like eth0,eth1. Used by the libpcap and afpacket engines
    #[clap(short = 'i', value_name = "IFACES", default_value = "")]
    pub ifaces: String,

    /// Interface, group id and direction list separated by comma, like eth0:2:in,eth0:3:out. Used by the nflog engine
    #[clap(long = "nflog", value_name = "BINDINGS", default_value = "")]
    pub nflog: String,

    /// Packet capture engine, could be libpcap, afpacket or nflog
    #[clap(long = "engine", default_value = "libpcap")]
    pub engine: String,

    /// Also account transport layer flows
    #[clap(long = "l4")]
    pub l4: bool,

    /// Enable the print reporter
    #[clap(long = "print.enable")]
    pub print_enable: bool,

    /// Print reporter interval in seconds
    #[clap(long = "print.interval", default_value_t = 2)]
    pub print_interval: i64,

    /// Enable the webhook reporter
    #[clap(long = "webhook.enable")]
    pub webhook_enable: bool,

    /// URL flow reports are posted to
    #[clap(long = "webhook.url", default_value = "")]
    pub webhook_url: String,

    /// Webhook reporter interval in seconds
    #[clap(long = "webhook.interval", default_value_t = 10)]
    pub webhook_interval: i64,

    /// Webhook post timeout in seconds
    #[clap(long = "webhook.post_timeout", default_value_t = 5)]
    pub webhook_post_timeout: i64,

    /// Node id reported in the webhook body
    #[clap(long = "webhook.node_id", default_value = "")]
    pub webhook_node_id: String,

    /// Node OAM address reported in the webhook body
    #[clap(long = "webhook.node_oam_addr", default_value = "")]
    pub webhook_node_oam_addr: String,

    /// Enable the http server
    #[clap(long = "http")]
    pub http: bool,

    /// Http server listening address
    #[clap(long = "addr", default_value = "0.0.0.0")]
    pub addr: String,

    /// Http server listening port
    #[clap(long = "port", default_value = "31415")]
    pub port: String,

    /// CPU profile file path
    #[clap(long = "cpu_profile", default_value = "")]
    pub cpu_profile: String,

    /// Heap profile file path
    #[clap(long = "heap_profile", default_value = "")]
    pub heap_profile: String,

    /// Show version
    #[clap(short = 'v')]
    pub show_version: bool,
}

/// Long flag names accepted with a single leading dash.
const LONG_FLAGS: [&str; 16] = [
    "nflog",
    "engine",
    "l4",
    "print.enable",
    "print.interval",
    "webhook.enable",
    "webhook.url",
    "webhook.interval",
    "webhook.post_timeout",
    "webhook.node_id",
    "webhook.node_oam_addr",
    "http",
    "addr",
    "port",
    "cpu_profile",
    "heap_profile",
];

/// Rewrite single-dash long flags (`-engine`, `-engine=afpacket`) to the
/// double-dash form clap parses. Short flags, values, already
/// double-dashed flags and everything after a bare `--` pass through
/// untouched.
pub fn normalize_args<I, S>(args: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let mut normalized = Vec::new();
    let mut passthrough = false;

    for arg in args {
        let arg = arg.into();

        if passthrough {
            normalized.push(arg);
            continue;
        }
        if arg == "--" {
            passthrough = true;
            normalized.push(arg);
            continue;
        }

        if let Some(rest) = arg.strip_prefix('-') {
            if !rest.starts_with('-') {
                let name = match rest.split_once('=') {
                    Some((name, _)) => name,
                    None => rest,
                };
                if LONG_FLAGS.contains(&name) {
                    normalized.push(format!("--{}", rest));
                    continue;
                }
            }
        }

        normalized.push(arg);
    }

    normalized
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineKind {
    Libpcap,
    Afpacket,
    Nflog,
}

impl FromStr for EngineKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            LIBPCAP_ENGINE_NAME => Ok(EngineKind::Libpcap),
            AFPACKET_ENGINE_NAME => Ok(EngineKind::Afpacket),
            NFLOG_ENGINE_NAME => Ok(EngineKind::Nflog),
            other => Err(ConfigError::InvalidEngine(other.to_string())),
        }
    }
}

/// One `iface:group:dir` binding for the nflog engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NflogBinding {
    pub iface_name: String,
    pub group_id: u16,
    pub direction: Direction,
}

#[derive(Debug, Clone)]
pub struct CaptureSettings {
    pub engine: EngineKind,
    pub iface_list: Vec<String>,
    pub nflog_bindings: Vec<NflogBinding>,
    pub decode_l4: bool,
}

#[derive(Debug, Clone)]
pub struct PrintSettings {
    pub enable: bool,
    pub interval_secs: i64,
}

#[derive(Debug, Clone)]
pub struct WebhookSettings {
    pub enable: bool,
    pub url: String,
    pub interval_secs: i64,
    pub post_timeout_secs: i64,
    pub node_id: String,
    pub node_oam_addr: String,
}

#[derive(Debug, Clone)]
pub struct HttpSettings {
    pub enable: bool,
    pub addr: String,
    pub port: String,
}

#[derive(Debug, Clone)]
pub struct ProfileSettings {
    pub cpu_profile: Option<PathBuf>,
    pub heap_profile: Option<PathBuf>,
}

/// Validated runtime configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub capture: CaptureSettings,
    pub print: PrintSettings,
    pub webhook: WebhookSettings,
    pub http: HttpSettings,
    pub profile: ProfileSettings,
}

impl Config {
    pub fn from_args(args: Args) -> Result<Self, ConfigError> {
        let engine = args.engine.parse::<EngineKind>()?;

        let nflog_bindings = if engine == EngineKind::Nflog {
            parse_nflog_bindings(&args.nflog)?
        } else {
            Vec::new()
        };

        let iface_list = match engine {
            EngineKind::Libpcap | EngineKind::Afpacket => parse_iface_list(&args.ifaces),
            EngineKind::Nflog => {
                // Interfaces registered with the hub come from the bindings;
                // both directions of an interface share one history.
                let mut list: Vec<String> = Vec::new();
                for binding in &nflog_bindings {
                    if !list.contains(&binding.iface_name) {
                        list.push(binding.iface_name.clone());
                    }
                }
                list
            }
        };

        let config = Config {
            capture: CaptureSettings {
                engine,
                iface_list,
                nflog_bindings,
                decode_l4: args.l4,
            },
            print: PrintSettings {
                enable: args.print_enable,
                interval_secs: args.print_interval,
            },
            webhook: WebhookSettings {
                enable: args.webhook_enable,
                url: args.webhook_url,
                interval_secs: args.webhook_interval,
                post_timeout_secs: args.webhook_post_timeout,
                node_id: args.webhook_node_id,
                node_oam_addr: args.webhook_node_oam_addr,
            },
            http: HttpSettings {
                enable: args.http,
                addr: args.addr,
                port: args.port,
            },
            profile: ProfileSettings {
                cpu_profile: non_empty_path(&args.cpu_profile),
                heap_profile: non_empty_path(&args.heap_profile),
            },
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        match self.capture.engine {
            EngineKind::Libpcap | EngineKind::Afpacket => {
                if self.capture.iface_list.is_empty() {
                    return Err(ConfigError::NoInterface);
                }
            }
            EngineKind::Nflog => {
                if self.capture.nflog_bindings.is_empty() {
                    return Err(ConfigError::NoNflogGroup);
                }
            }
        }

        if self.print.enable && self.print.interval_secs < 1 {
            return Err(ConfigError::InvalidInterval("print"));
        }

        if self.webhook.enable {
            if self.webhook.url.is_empty() {
                return Err(ConfigError::NoWebhookUrl);
            }
            if self.webhook.interval_secs < 1 {
                return Err(ConfigError::InvalidInterval("webhook"));
            }
            if self.webhook.post_timeout_secs < 1 {
                return Err(ConfigError::InvalidPostTimeout);
            }
        }

        Ok(())
    }
}

fn non_empty_path(s: &str) -> Option<PathBuf> {
    if s.is_empty() {
        None
    } else {
        Some(PathBuf::from(s))
    }
}

fn parse_iface_list(s: &str) -> Vec<String> {
    s.split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_nflog_bindings(s: &str) -> Result<Vec<NflogBinding>, ConfigError> {
    let mut bindings = Vec::new();

    for part in s.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }

        let fields: Vec<&str> = part.split(':').collect();
        if fields.len() != 3 {
            return Err(ConfigError::InvalidNflogBinding(s.to_string()));
        }

        let iface_name = fields[0].trim().to_string();
        let group_id = fields[1]
            .trim()
            .parse::<u16>()
            .map_err(|_| ConfigError::InvalidNflogBinding(s.to_string()))?;

        let direction = match fields[2].trim().to_lowercase().as_str() {
            "in" => Direction::Inbound,
            "out" => Direction::Outbound,
            _ => return Err(ConfigError::InvalidNflogBinding(s.to_string())),
        };

        bindings.push(NflogBinding {
            iface_name,
            group_id,
            direction,
        });
    }

    Ok(bindings)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_args() -> Args {
        Args::parse_from(["flowtop"])
    }

    #[test]
    fn test_engine_names() {
        assert_eq!("libpcap".parse::<EngineKind>().unwrap(), EngineKind::Libpcap);
        assert_eq!(
            "afpacket".parse::<EngineKind>().unwrap(),
            EngineKind::Afpacket
        );
        assert_eq!("nflog".parse::<EngineKind>().unwrap(), EngineKind::Nflog);
        assert!("dpdk".parse::<EngineKind>().is_err());
    }

    #[test]
    fn test_default_engine_requires_interfaces() {
        let args = base_args();
        match Config::from_args(args) {
            Err(ConfigError::NoInterface) => {}
            other => panic!("expected NoInterface, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_iface_list_parsing() {
        let mut args = base_args();
        args.ifaces = "eth0, eth1 ,,eth2".to_string();
        let config = Config::from_args(args).unwrap();
        assert_eq!(config.capture.iface_list, vec!["eth0", "eth1", "eth2"]);
    }

    #[test]
    fn test_nflog_binding_parsing() {
        let mut args = base_args();
        args.engine = "nflog".to_string();
        args.nflog = "eth0:2:in, eth0:3:out, eth1:4:IN".to_string();
        let config = Config::from_args(args).unwrap();

        assert_eq!(config.capture.nflog_bindings.len(), 3);
        assert_eq!(
            config.capture.nflog_bindings[0],
            NflogBinding {
                iface_name: "eth0".to_string(),
                group_id: 2,
                direction: Direction::Inbound,
            }
        );
        assert_eq!(
            config.capture.nflog_bindings[1].direction,
            Direction::Outbound
        );
        // interfaces deduplicate while preserving order
        assert_eq!(config.capture.iface_list, vec!["eth0", "eth1"]);
    }

    #[test]
    fn test_nflog_binding_rejects_malformed_entries() {
        for bad in ["eth0:2", "eth0:x:in", "eth0:2:sideways"] {
            let mut args = base_args();
            args.engine = "nflog".to_string();
            args.nflog = bad.to_string();
            assert!(
                matches!(
                    Config::from_args(args),
                    Err(ConfigError::InvalidNflogBinding(_))
                ),
                "expected rejection of {:?}",
                bad
            );
        }
    }

    #[test]
    fn test_nflog_engine_requires_bindings() {
        let mut args = base_args();
        args.engine = "nflog".to_string();
        assert!(matches!(
            Config::from_args(args),
            Err(ConfigError::NoNflogGroup)
        ));
    }

    #[test]
    fn test_zero_print_interval_rejected() {
        let mut args = base_args();
        args.ifaces = "eth0".to_string();
        args.print_enable = true;
        args.print_interval = 0;
        assert!(matches!(
            Config::from_args(args),
            Err(ConfigError::InvalidInterval("print"))
        ));
    }

    #[test]
    fn test_webhook_requires_url_and_sane_intervals() {
        let mut args = base_args();
        args.ifaces = "eth0".to_string();
        args.webhook_enable = true;
        assert!(matches!(
            Config::from_args(args),
            Err(ConfigError::NoWebhookUrl)
        ));

        let mut args = base_args();
        args.ifaces = "eth0".to_string();
        args.webhook_enable = true;
        args.webhook_url = "http://127.0.0.1:9000/flows".to_string();
        args.webhook_post_timeout = 0;
        assert!(matches!(
            Config::from_args(args),
            Err(ConfigError::InvalidPostTimeout)
        ));
    }

    #[test]
    fn test_normalize_args_single_dash_long_flags() {
        let normalized = normalize_args([
            "flowtop",
            "-engine=afpacket",
            "-l4",
            "-print.enable",
            "-i",
            "eth0",
            "-v",
        ]);
        assert_eq!(
            normalized,
            vec![
                "flowtop",
                "--engine=afpacket",
                "--l4",
                "--print.enable",
                "-i",
                "eth0",
                "-v"
            ]
        );
    }

    #[test]
    fn test_normalize_args_leaves_double_dash_and_values() {
        let normalized = normalize_args([
            "flowtop",
            "--engine",
            "nflog",
            "-nflog",
            "eth0:2:in",
            "--",
            "-engine",
        ]);
        assert_eq!(
            normalized,
            vec![
                "flowtop",
                "--engine",
                "nflog",
                "--nflog",
                "eth0:2:in",
                "--",
                "-engine"
            ]
        );
    }

    #[test]
    fn test_documented_invocation_parses() {
        let args = Args::parse_from(normalize_args([
            "flowtop",
            "-i",
            "eth0",
            "-engine",
            "afpacket",
            "-l4",
            "-print.enable",
        ]));
        assert_eq!(args.engine, "afpacket");
        assert!(args.l4);
        assert!(args.print_enable);

        let config = Config::from_args(args).unwrap();
        assert_eq!(config.capture.engine, EngineKind::Afpacket);
        assert!(config.capture.decode_l4);
        assert!(config.print.enable);
    }

    #[test]
    fn test_single_dash_invalid_engine_reaches_validation() {
        let args = Args::parse_from(normalize_args(["flowtop", "-i", "eth0", "-engine", "dpdk"]));
        assert!(matches!(
            Config::from_args(args),
            Err(ConfigError::InvalidEngine(_))
        ));
    }

    #[test]
    fn test_profile_paths() {
        let mut args = base_args();
        args.ifaces = "eth0".to_string();
        args.cpu_profile = "/tmp/cpu.svg".to_string();
        let config = Config::from_args(args).unwrap();
        assert_eq!(
            config.profile.cpu_profile,
            Some(PathBuf::from("/tmp/cpu.svg"))
        );
        assert!(config.profile.heap_profile.is_none());
    }
}
