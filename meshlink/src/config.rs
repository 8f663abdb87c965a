use serde::{Deserialize, Serialize};

/// Tunables for the transport. Defaults match the fixed constants: these
/// are exposed for testing (shorter timeouts, smaller fragments), not
/// because real deployments should change them.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Serial baud rate.
    pub baud_rate: u32,
    /// Size, in bytes, of the serial port's input and output buffers.
    pub serial_buffer_size: usize,
    /// Maximum RF payload carried by a single DATA fragment.
    pub fragment_payload_size: u8,
    /// Maximum application message length accepted by `send_message`.
    pub max_message_len: usize,
    /// Inactivity bound on an RX session before an activity-timeout NACK fires.
    pub fragment_timeout_ms: u64,
    /// Total-age bound on a session before it is dropped outright.
    pub session_timeout_ms: u64,
    /// Minimum spacing between NACKs raised for the same session.
    pub nack_interval_ms: u64,
    /// Number of NACK rounds a session tolerates before being dropped.
    pub max_nack_rounds: u32,
    /// Cadence of the housekeeping tick.
    pub housekeeping_interval_ms: u64,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            baud_rate: 115_200,
            serial_buffer_size: 16 * 1024,
            fragment_payload_size: 30,
            max_message_len: 10_240,
            fragment_timeout_ms: 500,
            session_timeout_ms: 30_000,
            nack_interval_ms: 200,
            max_nack_rounds: 10,
            housekeeping_interval_ms: 500,
        }
    }
}

impl Config {
    /// Loads a config from a TOML file, falling back to `Default` fields
    /// for anything the file omits.
    pub fn from_toml_file(path: &str) -> Result<Config, serdeconv::Error> {
        serdeconv::from_toml_file(path)
    }

    pub fn fragment_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.fragment_timeout_ms)
    }

    pub fn session_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.session_timeout_ms)
    }

    pub fn nack_interval(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.nack_interval_ms)
    }

    pub fn housekeeping_interval(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.housekeeping_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_fixed_constants() {
        let config = Config::default();
        assert_eq!(config.baud_rate, 115_200);
        assert_eq!(config.fragment_payload_size, 30);
        assert_eq!(config.max_message_len, 10_240);
        assert_eq!(config.max_nack_rounds, 10);
    }

    #[test]
    fn partial_toml_fills_in_defaults() {
        let config: Config = serdeconv::from_toml_str("baud_rate = 57600\n").unwrap();
        assert_eq!(config.baud_rate, 57_600);
        assert_eq!(config.fragment_payload_size, 30);
    }
}
