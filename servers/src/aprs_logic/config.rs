use anyhow::Result;
use clap::{Parser, ValueEnum};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use lib_common::configs::settings::duration_from_secs;
use lib_common::configs::{
    ConfigError, ConnectionSettings, FilterSettings, OverflowPolicy, QueueSettings, SupervisorSettings,
    UploaderSettings,
};
use lib_common::parsers::ogn::{DEFAULT_ADDRESS_TYPES_ACCEPTED, DEFAULT_RX_NAMES_TO_REJECT};
use lib_common::parsers::TimezoneDstCorrection;
use lib_common::retrieve::DEFAULT_PUSH_URL;
use lib_common::{DestinationId, TrackedIdentities};

/// Which feed the gateway reads.
#[derive(ValueEnum, Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Dialect {
    /// Full APRS-IS feed, filtered locally.
    #[default]
    Aprs,
    /// Open Glider Network feed.
    Ogn,
}

/// How delivered timestamps are shifted for daylight saving.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DstMode {
    /// Timestamps are delivered as received.
    Off,
    /// DST of the zone at each fix position.
    Local,
    /// DST of one configured zone.
    Fixed(TimezoneDstCorrection),
}

impl Dialect {
    fn default_server(self) -> (&'static str, u16) {
        match self {
            Dialect::Aprs => ("rotate.aprs2.net", 10152),
            Dialect::Ogn => ("aprs.glidernet.org", 10152),
        }
    }
}

#[derive(Parser, Deserialize, Serialize, Debug, Clone, Default)]
#[clap(about = "Forward APRS-IS / OGN position reports of tracked identities to glideport.aero", version)]
pub struct Config {
    #[clap(env = "APRS2GP_CONFIG", help = "JSON config file holding at least `ids` (and `callsign` for APRS).")]
    #[serde(skip)]
    pub config: Option<PathBuf>,

    #[clap(long, env = "APRS2GP_CALLSIGN", help = "Callsign used in the login line.")]
    pub callsign: Option<String>,

    #[clap(skip)]
    pub ids: Option<BTreeMap<String, DestinationId>>,

    #[clap(long, env = "APRS2GP_ADDR", help = "Upstream server host.")]
    pub addr: Option<String>,

    #[clap(long, env = "APRS2GP_PORT", help = "Upstream server port.")]
    pub port: Option<u16>,

    #[clap(long, value_enum, env = "APRS2GP_DIALECT", help = "Feed dialect.")]
    pub dialect: Option<Dialect>,

    #[clap(long, env = "APRS2GP_VERBOSE", num_args = 0..=1, default_missing_value = "true", help = "Log at debug level.")]
    pub verbose: Option<bool>,

    #[clap(long, env = "APRS2GP_WAIT_BETWEEN_CHECKS", help = "Seconds between supervisor cycles.")]
    pub wait_between_checks: Option<f64>,

    #[clap(long, env = "APRS2GP_MAX_WAIT_BETWEEN_CHECKS", help = "Ceiling in seconds for the backoff wait.")]
    pub max_wait_between_checks: Option<f64>,

    #[clap(long, env = "APRS2GP_MAX_CONSECUTIVE_DATA_LOSS", help = "Near-empty reads tolerated before reconnecting.")]
    pub max_consecutive_data_loss: Option<u32>,

    #[clap(long, env = "APRS2GP_SOCKET_TIMEOUT", help = "Socket read timeout in seconds (default: twice the wait).")]
    pub socket_timeout: Option<f64>,

    #[clap(long, env = "APRS2GP_DELAY", help = "Settle delay in seconds during the login handshake.")]
    pub delay: Option<f64>,

    #[clap(long, env = "APRS2GP_PRINT_INFO_EVERY_X_SECONDS", help = "Throughput log period in seconds.")]
    pub print_info_every_x_seconds: Option<f64>,

    #[clap(long, env = "APRS2GP_PRINT_STATS_EVERY_X_SECONDS", help = "Statistics log period in seconds.")]
    pub print_stats_every_x_seconds: Option<f64>,

    #[clap(long, env = "APRS2GP_PRINT_MONITOR_EVERY_X_SECONDS", help = "Heartbeat period in seconds; unset or 0 disables it.")]
    pub print_monitor_every_x_seconds: Option<f64>,

    #[clap(long, env = "APRS2GP_CALCULATE_MEAN_WINDOW_SEC", help = "Window in seconds for the recent packet rate.")]
    pub calculate_mean_window_sec: Option<f64>,

    #[clap(long, env = "APRS2GP_MIN_PACKET_DT", help = "Minimum seconds between two accepted fixes of one identity.")]
    pub min_packet_dt: Option<f64>,

    #[clap(long = "n-last-packets", env = "APRS2GP_N_LAST_PACKETS", help = "Recent fixes remembered per identity for deduplication.")]
    #[serde(rename = "N_last_packets", alias = "n_last_packets")]
    pub n_last_packets: Option<usize>,

    #[clap(long, env = "APRS2GP_MAX_PACKETS", help = "Delivery queue capacity.")]
    pub max_packets: Option<usize>,

    #[clap(long, env = "APRS2GP_GLIDEPORT_TIMEOUT_SEC", help = "Timeout in seconds for one upload.")]
    pub glideport_timeout_sec: Option<f64>,

    #[clap(long, env = "APRS2GP_GLIDEPORT_URL", help = "Push endpoint.")]
    pub glideport_url: Option<String>,

    #[clap(long, env = "APRS2GP_UPLOAD", num_args = 0..=1, default_missing_value = "true", help = "Set to false to log payloads instead of uploading them.")]
    pub upload: Option<bool>,

    #[clap(long, env = "APRS2GP_OVERFLOW_POLICY", help = "Full queue behaviour: block or drop_oldest.")]
    pub overflow_policy: Option<OverflowPolicy>,

    #[clap(long, env = "APRS2GP_UPLOAD_BASE_DELAY", help = "Initial retry delay in seconds after an upload timeout.")]
    pub upload_base_delay: Option<f64>,

    #[clap(long, env = "APRS2GP_RECORD_PACKETS", help = "Append every decoded raw line to this file.")]
    pub record_packets: Option<PathBuf>,

    #[clap(long, env = "APRS2GP_REPLAY_FILE", help = "Read packets from this file instead of the network.")]
    pub replay_file: Option<PathBuf>,

    #[clap(long, env = "APRS2GP_RX_NAMES_TO_REJECT", value_delimiter = ',', help = "OGN receiver name fragments to reject.")]
    pub rx_names_to_reject: Option<Vec<String>>,

    #[clap(long, env = "APRS2GP_ADDRESS_TYPES_ACCEPTED", value_delimiter = ',', help = "OGN address types to accept.")]
    pub address_types_accepted: Option<Vec<u8>>,

    #[clap(long, env = "APRS2GP_SHIFT_LOCAL_DST", num_args = 0..=1, default_missing_value = "true", help = "Add the DST offset at each fix position to delivered timestamps (default: on for OGN).")]
    pub shift_local_dst: Option<bool>,

    #[clap(long, env = "APRS2GP_DST_TIMEZONE", help = "IANA zone whose DST offset is added instead of the local one.")]
    pub dst_timezone: Option<String>,

    #[clap(long, env = "APRS2GP_LOG_DIR", help = "Directory for log files.")]
    pub log_dir: Option<PathBuf>,

    #[clap(long, env = "APRS2GP_LOG_LEVEL", help = "Logging level (debug, info, warn, error).")]
    pub log_level: Option<String>,

    #[clap(long, env = "APRS2GP_SHUTDOWN_TIMEOUT_SEC", help = "Seconds to wait for the uploader to drain on shutdown.")]
    pub shutdown_timeout_sec: Option<f64>,
}

/// Everything the gateway needs, resolved and validated.
#[derive(Debug, Clone)]
pub struct GatewaySettings {
    pub dialect: Dialect,
    pub identities: TrackedIdentities,
    pub connection: ConnectionSettings,
    pub filter: FilterSettings,
    pub queue: QueueSettings,
    pub uploader: UploaderSettings,
    pub supervisor: SupervisorSettings,
    pub glideport_url: String,
    pub upload: bool,
    pub record_packets: Option<PathBuf>,
    pub replay_file: Option<PathBuf>,
    pub rx_names_to_reject: Vec<String>,
    pub address_types_accepted: Vec<u8>,
    pub dst: DstMode,
    pub log_dir: PathBuf,
    pub log_level: String,
}

impl Config {
    // Merge two Config structs, where 'other' overrides 'self' for Some values
    fn merge(self, other: Config) -> Config {
        Config {
            config: other.config.or(self.config),
            callsign: other.callsign.or(self.callsign),
            ids: other.ids.or(self.ids),
            addr: other.addr.or(self.addr),
            port: other.port.or(self.port),
            dialect: other.dialect.or(self.dialect),
            verbose: other.verbose.or(self.verbose),
            wait_between_checks: other.wait_between_checks.or(self.wait_between_checks),
            max_wait_between_checks: other.max_wait_between_checks.or(self.max_wait_between_checks),
            max_consecutive_data_loss: other.max_consecutive_data_loss.or(self.max_consecutive_data_loss),
            socket_timeout: other.socket_timeout.or(self.socket_timeout),
            delay: other.delay.or(self.delay),
            print_info_every_x_seconds: other.print_info_every_x_seconds.or(self.print_info_every_x_seconds),
            print_stats_every_x_seconds: other.print_stats_every_x_seconds.or(self.print_stats_every_x_seconds),
            print_monitor_every_x_seconds: other.print_monitor_every_x_seconds.or(self.print_monitor_every_x_seconds),
            calculate_mean_window_sec: other.calculate_mean_window_sec.or(self.calculate_mean_window_sec),
            min_packet_dt: other.min_packet_dt.or(self.min_packet_dt),
            n_last_packets: other.n_last_packets.or(self.n_last_packets),
            max_packets: other.max_packets.or(self.max_packets),
            glideport_timeout_sec: other.glideport_timeout_sec.or(self.glideport_timeout_sec),
            glideport_url: other.glideport_url.or(self.glideport_url),
            upload: other.upload.or(self.upload),
            overflow_policy: other.overflow_policy.or(self.overflow_policy),
            upload_base_delay: other.upload_base_delay.or(self.upload_base_delay),
            record_packets: other.record_packets.or(self.record_packets),
            replay_file: other.replay_file.or(self.replay_file),
            rx_names_to_reject: other.rx_names_to_reject.or(self.rx_names_to_reject),
            address_types_accepted: other.address_types_accepted.or(self.address_types_accepted),
            shift_local_dst: other.shift_local_dst.or(self.shift_local_dst),
            dst_timezone: other.dst_timezone.or(self.dst_timezone),
            log_dir: other.log_dir.or(self.log_dir),
            log_level: other.log_level.or(self.log_level),
            shutdown_timeout_sec: other.shutdown_timeout_sec.or(self.shutdown_timeout_sec),
        }
    }

    /// Built-in defaults. Server, callsign and socket timeout depend on the
    /// dialect and the wait, so they are filled in by `resolve`.
    fn defaults() -> Config {
        Config {
            dialect: Some(Dialect::Aprs),
            verbose: Some(false),
            wait_between_checks: Some(1.0),
            max_wait_between_checks: Some(1800.0),
            max_consecutive_data_loss: Some(3),
            delay: Some(0.5),
            print_info_every_x_seconds: Some(1.0),
            print_stats_every_x_seconds: Some(600.0),
            calculate_mean_window_sec: Some(60.0),
            min_packet_dt: Some(10.0),
            n_last_packets: Some(5),
            max_packets: Some(5000),
            glideport_timeout_sec: Some(5.0),
            glideport_url: Some(DEFAULT_PUSH_URL.to_string()),
            upload: Some(true),
            overflow_policy: Some(OverflowPolicy::Block),
            upload_base_delay: Some(0.05),
            log_dir: Some(std::env::temp_dir()),
            log_level: Some("info".to_string()),
            shutdown_timeout_sec: Some(10.0),
            ..Default::default()
        }
    }

    /// Reads a JSON config file.
    pub fn from_file(path: &Path) -> Result<Config, ConfigError> {
        let text = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    /// Turns the merged configuration into component settings.
    pub fn resolve(self) -> Result<GatewaySettings, ConfigError> {
        let dialect = self.dialect.unwrap_or_default();

        let ids = self.ids.ok_or(ConfigError::MissingKey("ids"))?;
        if ids.is_empty() {
            return Err(ConfigError::InvalidValue {
                key: "ids",
                reason: "at least one identity must be tracked".to_string(),
            });
        }

        let callsign = match (self.callsign, dialect) {
            (Some(callsign), _) => callsign,
            (None, Dialect::Ogn) => "N0CALL".to_string(),
            (None, Dialect::Aprs) => return Err(ConfigError::MissingKey("callsign")),
        };

        let (default_addr, default_port) = dialect.default_server();
        let wait = self.wait_between_checks.unwrap_or(1.0);
        let socket_timeout = duration_from_secs("socket_timeout", self.socket_timeout.unwrap_or(2.0 * wait))?;

        let base = ConnectionSettings::default();
        let connection = ConnectionSettings {
            addr: self.addr.unwrap_or_else(|| default_addr.to_string()),
            port: self.port.unwrap_or(default_port),
            callsign,
            client_version: env!("CARGO_PKG_VERSION").to_string(),
            settle_delay: secs_or("delay", self.delay, base.settle_delay)?,
            handshake_timeout: socket_timeout,
            read_timeout: socket_timeout,
            ..base
        };

        let filter_base = FilterSettings::default();
        let filter = FilterSettings {
            min_interval_secs: self.min_packet_dt.unwrap_or(filter_base.min_interval_secs),
            window_depth: self.n_last_packets.unwrap_or(filter_base.window_depth),
        };

        let queue_base = QueueSettings::default();
        let queue = QueueSettings {
            capacity: self.max_packets.unwrap_or(queue_base.capacity),
            overflow: self.overflow_policy.unwrap_or(queue_base.overflow),
        };

        let uploader_base = UploaderSettings::default();
        let stats_interval = secs_or("print_stats_every_x_seconds", self.print_stats_every_x_seconds, uploader_base.stats_interval)?;
        let uploader = UploaderSettings {
            push_timeout: secs_or("glideport_timeout_sec", self.glideport_timeout_sec, uploader_base.push_timeout)?,
            base_retry_delay: secs_or("upload_base_delay", self.upload_base_delay, uploader_base.base_retry_delay)?,
            stats_interval,
        };

        let supervisor_base = SupervisorSettings::default();
        let monitor_interval = match self.print_monitor_every_x_seconds {
            Some(secs) if secs > 0.0 => Some(duration_from_secs("print_monitor_every_x_seconds", secs)?),
            _ => None,
        };
        let supervisor = SupervisorSettings {
            base_wait: duration_from_secs("wait_between_checks", wait)?,
            max_wait: secs_or("max_wait_between_checks", self.max_wait_between_checks, supervisor_base.max_wait)?,
            max_consecutive_data_loss: self
                .max_consecutive_data_loss
                .unwrap_or(supervisor_base.max_consecutive_data_loss),
            stats_interval,
            info_interval: secs_or("print_info_every_x_seconds", self.print_info_every_x_seconds, supervisor_base.info_interval)?,
            monitor_interval,
            mean_window: secs_or("calculate_mean_window_sec", self.calculate_mean_window_sec, supervisor_base.mean_window)?,
            shutdown_timeout: secs_or("shutdown_timeout_sec", self.shutdown_timeout_sec, supervisor_base.shutdown_timeout)?,
            ..supervisor_base
        };

        let dst = match self.dst_timezone {
            Some(name) => DstMode::Fixed(TimezoneDstCorrection::from_name(&name).ok_or_else(|| {
                ConfigError::InvalidValue {
                    key: "dst_timezone",
                    reason: format!("unknown IANA time zone `{}`", name),
                }
            })?),
            None if self.shift_local_dst.unwrap_or(dialect == Dialect::Ogn) => DstMode::Local,
            None => DstMode::Off,
        };

        Ok(GatewaySettings {
            dialect,
            identities: TrackedIdentities::new(ids),
            connection,
            filter,
            queue,
            uploader,
            supervisor,
            glideport_url: self.glideport_url.unwrap_or_else(|| DEFAULT_PUSH_URL.to_string()),
            upload: self.upload.unwrap_or(true),
            record_packets: self.record_packets,
            replay_file: self.replay_file,
            rx_names_to_reject: self
                .rx_names_to_reject
                .unwrap_or_else(|| DEFAULT_RX_NAMES_TO_REJECT.iter().map(|s| s.to_string()).collect()),
            address_types_accepted: self
                .address_types_accepted
                .unwrap_or_else(|| DEFAULT_ADDRESS_TYPES_ACCEPTED.to_vec()),
            dst,
            log_dir: self.log_dir.unwrap_or_else(std::env::temp_dir),
            log_level: if self.verbose.unwrap_or(false) {
                "debug".to_string()
            } else {
                self.log_level.unwrap_or_else(|| "info".to_string())
            },
        })
    }
}

fn secs_or(key: &'static str, secs: Option<f64>, fallback: Duration) -> Result<Duration, ConfigError> {
    match secs {
        Some(secs) => duration_from_secs(key, secs),
        None => Ok(fallback),
    }
}

/// Layers defaults, the JSON file named on the command line, and CLI/env values.
fn layered(cli: Config) -> Result<Config, ConfigError> {
    // 1. Load defaults
    let mut current_config = Config::defaults();

    // 2. The config file, when one is given, must exist and parse: `ids` can only come from it.
    if let Some(path) = cli.config.as_deref() {
        current_config = current_config.merge(Config::from_file(path)?);
    }

    // 3. Environment variables and CLI arguments win over the file.
    Ok(current_config.merge(cli))
}

pub fn load_config() -> Result<Config> {
    Ok(layered(Config::parse())?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn file_config(json: &str) -> Config {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(json.as_bytes()).unwrap();
        let cli = Config {
            config: Some(file.path().to_path_buf()),
            ..Default::default()
        };
        layered(cli).unwrap()
    }

    #[test]
    fn file_keys_use_their_historic_names() {
        let config = file_config(
            r#"{"callsign": "N0CALL", "ids": {"N0CALL-9": "IMEI123", "K1ABC": 300434063000000},
                "N_last_packets": 7, "min_packet_dt": 20.0, "max_packets": 10}"#,
        );
        let settings = config.resolve().unwrap();
        assert_eq!(settings.filter.window_depth, 7);
        assert_eq!(settings.filter.min_interval_secs, 20.0);
        assert_eq!(settings.queue.capacity, 10);
        assert_eq!(settings.identities.iter().count(), 2);
        assert_eq!(settings.connection.addr, "rotate.aprs2.net");
    }

    #[test]
    fn cli_values_override_the_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(br#"{"callsign": "N0CALL", "ids": {"A": 1}, "port": 14580}"#).unwrap();
        let cli = Config::parse_from(["aprs2gpaero", file.path().to_str().unwrap(), "--port", "10153", "--upload=false"]);
        let settings = layered(cli).unwrap().resolve().unwrap();
        assert_eq!(settings.connection.port, 10153);
        assert!(!settings.upload);
    }

    #[test]
    fn socket_timeout_defaults_to_twice_the_wait() {
        let settings = file_config(r#"{"callsign": "N0CALL", "ids": {"A": 1}, "wait_between_checks": 3.0}"#)
            .resolve()
            .unwrap();
        assert_eq!(settings.connection.read_timeout, Duration::from_secs(6));
        assert_eq!(settings.supervisor.base_wait, Duration::from_secs(3));
    }

    #[test]
    fn missing_required_keys_are_reported() {
        let no_ids = file_config(r#"{"callsign": "N0CALL"}"#).resolve();
        assert!(matches!(no_ids, Err(ConfigError::MissingKey("ids"))));

        let no_callsign = file_config(r#"{"ids": {"A": 1}}"#).resolve();
        assert!(matches!(no_callsign, Err(ConfigError::MissingKey("callsign"))));
    }

    #[test]
    fn ogn_dialect_has_its_own_server_and_callsign() {
        let settings = file_config(r#"{"dialect": "ogn", "ids": {"FLRDDA5BA": "IMEI1"}}"#).resolve().unwrap();
        assert_eq!(settings.dialect, Dialect::Ogn);
        assert_eq!(settings.connection.addr, "aprs.glidernet.org");
        assert_eq!(settings.connection.callsign, "N0CALL");
        assert_eq!(settings.address_types_accepted, vec![1, 2, 3]);
        assert_eq!(settings.dst, DstMode::Local);
    }

    #[test]
    fn dst_shift_follows_dialect_unless_a_zone_is_pinned() {
        let aprs = file_config(r#"{"callsign": "N0CALL", "ids": {"A": 1}}"#).resolve().unwrap();
        assert_eq!(aprs.dst, DstMode::Off);

        let ogn_off = file_config(r#"{"dialect": "ogn", "ids": {"A": 1}, "shift_local_dst": false}"#).resolve().unwrap();
        assert_eq!(ogn_off.dst, DstMode::Off);

        let pinned = file_config(r#"{"dialect": "ogn", "ids": {"A": 1}, "dst_timezone": "Europe/Paris"}"#).resolve().unwrap();
        assert!(matches!(pinned.dst, DstMode::Fixed(_)));
    }

    #[test]
    fn verbose_forces_debug_and_unknown_zones_fail() {
        let settings = file_config(r#"{"callsign": "N0CALL", "ids": {"A": 1}, "verbose": true, "log_level": "warn"}"#)
            .resolve()
            .unwrap();
        assert_eq!(settings.log_level, "debug");

        let bad_zone = file_config(r#"{"callsign": "N0CALL", "ids": {"A": 1}, "dst_timezone": "Mars/Olympus"}"#).resolve();
        assert!(matches!(bad_zone, Err(ConfigError::InvalidValue { key: "dst_timezone", .. })));
    }

    #[test]
    fn unreadable_config_file_is_an_error() {
        let cli = Config {
            config: Some(PathBuf::from("/nonexistent/aprs2gpaero.json")),
            ..Default::default()
        };
        assert!(matches!(layered(cli), Err(ConfigError::IoError(_))));
    }
}
