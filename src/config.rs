//! Node configuration: flat `KEY=value` file, read once at startup

use std::net::Ipv4Addr;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("line {line}: expected KEY=value, got {text:?}")]
    Malformed { line: usize, text: String },

    #[error("line {line}: unknown key {key:?}")]
    UnknownKey { line: usize, key: String },

    #[error("line {line}: invalid value for {key}: {value:?}")]
    BadValue {
        line: usize,
        key: &'static str,
        value: String,
    },

    #[error("missing key {0}")]
    Missing(&'static str),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Capture node configuration, immutable after load.
///
/// The file format is shared with the rest of the capture fleet, so the
/// recognized keys are fixed: `FRAME_WIDTH`, `FRAME_HEIGHT`, `FPS`,
/// `FRAME_DURATION_MIN`, `FRAME_DURATION_MAX`, `FRAME_BUFFERS`,
/// `DMA_BUFFERS`, `RECORDING_CPU`, `SERVER_IP`, `TCP_PORT`, `UDP_PORT`.
#[derive(Debug, Clone)]
pub struct Config {
    /// Frame width in pixels
    pub frame_width: u32,

    /// Frame height in pixels
    pub frame_height: u32,

    /// Frames per second
    pub fps: u32,

    /// Lower exposure clamp (nanoseconds)
    pub frame_duration_min_ns: i64,

    /// Upper exposure clamp (nanoseconds)
    pub frame_duration_max_ns: i64,

    /// Pool slots N
    pub frame_buffers: usize,

    /// Device DMA buffers / reusable requests M
    pub dma_buffers: usize,

    /// Core the recording process is pinned to
    pub recording_cpu: usize,

    /// Frameset server address
    pub server_ip: Ipv4Addr,

    /// Server ingest port (encoded stream)
    pub tcp_port: u16,

    /// Local control port (timestamp / STOP datagrams)
    pub udp_port: u16,
}

impl Config {
    /// Loads and validates configuration from a flat key/value file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Parses configuration from file contents.
    pub fn from_str(content: &str) -> Result<Self, ConfigError> {
        let mut frame_width = None;
        let mut frame_height = None;
        let mut fps = None;
        let mut frame_duration_min_ns = None;
        let mut frame_duration_max_ns = None;
        let mut frame_buffers = None;
        let mut dma_buffers = None;
        let mut recording_cpu = None;
        let mut server_ip = None;
        let mut tcp_port = None;
        let mut udp_port = None;

        for (idx, raw) in content.lines().enumerate() {
            let line = idx + 1;
            let text = raw.trim();
            if text.is_empty() || text.starts_with('#') {
                continue;
            }

            let (key, value) = text.split_once('=').ok_or_else(|| ConfigError::Malformed {
                line,
                text: text.to_string(),
            })?;
            let (key, value) = (key.trim(), value.trim());

            match key {
                "FRAME_WIDTH" => frame_width = Some(parse(line, "FRAME_WIDTH", value)?),
                "FRAME_HEIGHT" => frame_height = Some(parse(line, "FRAME_HEIGHT", value)?),
                "FPS" => fps = Some(parse(line, "FPS", value)?),
                "FRAME_DURATION_MIN" => {
                    frame_duration_min_ns = Some(parse(line, "FRAME_DURATION_MIN", value)?)
                }
                "FRAME_DURATION_MAX" => {
                    frame_duration_max_ns = Some(parse(line, "FRAME_DURATION_MAX", value)?)
                }
                "FRAME_BUFFERS" => frame_buffers = Some(parse(line, "FRAME_BUFFERS", value)?),
                "DMA_BUFFERS" => dma_buffers = Some(parse(line, "DMA_BUFFERS", value)?),
                "RECORDING_CPU" => recording_cpu = Some(parse(line, "RECORDING_CPU", value)?),
                "SERVER_IP" => server_ip = Some(parse(line, "SERVER_IP", value)?),
                "TCP_PORT" => tcp_port = Some(parse(line, "TCP_PORT", value)?),
                "UDP_PORT" => udp_port = Some(parse(line, "UDP_PORT", value)?),
                _ => {
                    return Err(ConfigError::UnknownKey {
                        line,
                        key: key.to_string(),
                    })
                }
            }
        }

        let config = Config {
            frame_width: frame_width.ok_or(ConfigError::Missing("FRAME_WIDTH"))?,
            frame_height: frame_height.ok_or(ConfigError::Missing("FRAME_HEIGHT"))?,
            fps: fps.ok_or(ConfigError::Missing("FPS"))?,
            frame_duration_min_ns: frame_duration_min_ns
                .ok_or(ConfigError::Missing("FRAME_DURATION_MIN"))?,
            frame_duration_max_ns: frame_duration_max_ns
                .ok_or(ConfigError::Missing("FRAME_DURATION_MAX"))?,
            frame_buffers: frame_buffers.ok_or(ConfigError::Missing("FRAME_BUFFERS"))?,
            dma_buffers: dma_buffers.ok_or(ConfigError::Missing("DMA_BUFFERS"))?,
            recording_cpu: recording_cpu.ok_or(ConfigError::Missing("RECORDING_CPU"))?,
            server_ip: server_ip.ok_or(ConfigError::Missing("SERVER_IP"))?,
            tcp_port: tcp_port.ok_or(ConfigError::Missing("TCP_PORT"))?,
            udp_port: udp_port.ok_or(ConfigError::Missing("UDP_PORT"))?,
        };

        config.validate()?;
        Ok(config)
    }

    /// Bytes per decoded YUV420 frame: Y plane plus two quarter-size chroma planes.
    pub fn frame_bytes(&self) -> usize {
        let y = self.frame_width as usize * self.frame_height as usize;
        y + y / 2
    }

    /// Nanoseconds between frame captures.
    pub fn frame_duration_ns(&self) -> i64 {
        1_000_000_000 / i64::from(self.fps)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.frame_width == 0 || self.frame_height == 0 {
            return Err(ConfigError::Invalid(
                "FRAME_WIDTH and FRAME_HEIGHT must be > 0".to_string(),
            ));
        }

        // YUV420 halves both dimensions for chroma
        if self.frame_width % 2 != 0 || self.frame_height % 2 != 0 {
            return Err(ConfigError::Invalid(format!(
                "FRAME_WIDTH and FRAME_HEIGHT must be even, got {}x{}",
                self.frame_width, self.frame_height
            )));
        }

        if self.fps == 0 || self.fps > 120 {
            return Err(ConfigError::Invalid(format!(
                "FPS must be between 1 and 120, got {}",
                self.fps
            )));
        }

        if self.frame_duration_min_ns <= 0
            || self.frame_duration_max_ns < self.frame_duration_min_ns
        {
            return Err(ConfigError::Invalid(format!(
                "frame duration limits must satisfy 0 < min <= max, got {}..{}",
                self.frame_duration_min_ns, self.frame_duration_max_ns
            )));
        }

        if self.frame_buffers < 3 {
            return Err(ConfigError::Invalid(format!(
                "FRAME_BUFFERS must be >= 3, got {}",
                self.frame_buffers
            )));
        }

        if self.dma_buffers < 2 || self.dma_buffers > self.frame_buffers {
            return Err(ConfigError::Invalid(format!(
                "DMA_BUFFERS must be between 2 and FRAME_BUFFERS ({}), got {}",
                self.frame_buffers, self.dma_buffers
            )));
        }

        if self.tcp_port == 0 || self.udp_port == 0 {
            return Err(ConfigError::Invalid(
                "TCP_PORT and UDP_PORT must be > 0".to_string(),
            ));
        }

        Ok(())
    }
}

fn parse<T: std::str::FromStr>(
    line: usize,
    key: &'static str,
    value: &str,
) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::BadValue {
        line,
        key,
        value: value.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const GOOD: &str = "\
FRAME_WIDTH=640
FRAME_HEIGHT=480
FPS=30
FRAME_DURATION_MIN=16666666
FRAME_DURATION_MAX=33333333
FRAME_BUFFERS=4
DMA_BUFFERS=3
RECORDING_CPU=3
SERVER_IP=192.168.1.100
TCP_PORT=5000
UDP_PORT=5001
";

    #[test]
    fn test_parse_full_config() {
        let config = Config::from_str(GOOD).unwrap();
        assert_eq!(config.frame_width, 640);
        assert_eq!(config.frame_height, 480);
        assert_eq!(config.fps, 30);
        assert_eq!(config.frame_buffers, 4);
        assert_eq!(config.dma_buffers, 3);
        assert_eq!(config.server_ip, Ipv4Addr::new(192, 168, 1, 100));
        assert_eq!(config.tcp_port, 5000);
        assert_eq!(config.udp_port, 5001);
    }

    #[test]
    fn test_comments_and_blank_lines_ignored() {
        let text = format!("# capture node\n\n{}\n# trailing\n", GOOD);
        assert!(Config::from_str(&text).is_ok());
    }

    #[test]
    fn test_frame_bytes() {
        let config = Config::from_str(GOOD).unwrap();
        assert_eq!(config.frame_bytes(), 640 * 480 * 3 / 2);
    }

    #[test]
    fn test_frame_duration() {
        let config = Config::from_str(GOOD).unwrap();
        assert_eq!(config.frame_duration_ns(), 33_333_333);
    }

    #[test]
    fn test_missing_key() {
        let text = GOOD.replace("UDP_PORT=5001\n", "");
        let err = Config::from_str(&text).unwrap_err();
        assert!(matches!(err, ConfigError::Missing("UDP_PORT")));
    }

    #[test]
    fn test_unknown_key_rejected() {
        let text = format!("{}EXPOSURE_MODE=auto\n", GOOD);
        assert!(matches!(
            Config::from_str(&text),
            Err(ConfigError::UnknownKey { .. })
        ));
    }

    #[test]
    fn test_malformed_line() {
        let text = format!("{}FRAME_WIDTH\n", GOOD);
        assert!(matches!(
            Config::from_str(&text),
            Err(ConfigError::Malformed { .. })
        ));
    }

    #[test]
    fn test_odd_dimensions_rejected() {
        let text = GOOD.replace("FRAME_WIDTH=640", "FRAME_WIDTH=641");
        assert!(Config::from_str(&text).is_err());
    }

    #[test]
    fn test_too_few_pool_slots_rejected() {
        let text = GOOD
            .replace("FRAME_BUFFERS=4", "FRAME_BUFFERS=2")
            .replace("DMA_BUFFERS=3", "DMA_BUFFERS=2");
        assert!(Config::from_str(&text).is_err());
    }

    #[test]
    fn test_dma_buffers_bounded_by_pool() {
        let text = GOOD.replace("DMA_BUFFERS=3", "DMA_BUFFERS=5");
        assert!(Config::from_str(&text).is_err());
    }

    #[test]
    fn test_bad_ip() {
        let text = GOOD.replace("SERVER_IP=192.168.1.100", "SERVER_IP=not-an-ip");
        assert!(matches!(
            Config::from_str(&text),
            Err(ConfigError::BadValue {
                key: "SERVER_IP",
                ..
            })
        ));
    }
}
