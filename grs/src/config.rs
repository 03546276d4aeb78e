use std::str::FromStr;
use std::time;

use envconfig::Envconfig;

#[derive(Envconfig, Clone)]
pub struct Config {
    #[envconfig(default = "localhost")]
    pub master_ip: String,

    #[envconfig(default = "8080")]
    pub master_port: u16,

    /// Comma-separated resource region manager URLs.
    #[envconfig(default = "")]
    pub resource_urls: String,

    #[envconfig(default = "500")]
    pub response_chunk_size: usize,

    #[envconfig(default = "10000")]
    pub event_queue_capacity: usize,

    #[envconfig(default = "120000")]
    pub rrm_list_timeout: EnvMsDuration,

    #[envconfig(default = "1800000")]
    pub rrm_watch_timeout: EnvMsDuration,

    #[envconfig(default = "true")]
    pub export_prometheus: bool,

    /// Per-event latency checkpoints; costs a clock read per stage per event.
    #[envconfig(default = "false")]
    pub enable_checkpoints: bool,
}

impl Config {
    /// Produce a host:port address for binding a TcpListener.
    pub fn bind(&self) -> String {
        format!("{}:{}", self.master_ip, self.master_port)
    }

    pub fn resource_urls(&self) -> Vec<String> {
        self.resource_urls
            .split(',')
            .map(str::trim)
            .filter(|url| !url.is_empty())
            .map(str::to_owned)
            .collect()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct EnvMsDuration(pub time::Duration);

#[derive(Debug, PartialEq, Eq)]
pub struct ParseEnvMsDurationError;

impl FromStr for EnvMsDuration {
    type Err = ParseEnvMsDurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ms = s.parse::<u64>().map_err(|_| ParseEnvMsDurationError)?;

        Ok(EnvMsDuration(time::Duration::from_millis(ms)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resource_urls_splits_and_trims() {
        let mut config = Config::init_from_hashmap(&Default::default()).unwrap();
        config.resource_urls = "http://rrm-0:9999, http://rrm-1:9999".to_string();
        assert_eq!(
            config.resource_urls(),
            vec!["http://rrm-0:9999", "http://rrm-1:9999"]
        );

        config.resource_urls = String::new();
        assert!(config.resource_urls().is_empty());
    }

    #[test]
    fn bind_joins_ip_and_port() {
        let config = Config::init_from_hashmap(&Default::default()).unwrap();
        assert_eq!(config.bind(), "localhost:8080");
    }
}
