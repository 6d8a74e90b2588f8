use std::{path::PathBuf, time::Duration};

use rand::Rng;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;

use crate::{error::ConfigError, message::CAR_NAME, protocol::Protocol};

pub const DEFAULT_REST_URL: &str = "http://localhost:5000/externalLights";
pub const DEFAULT_JSONRPC_URL: &str = "http://localhost:4000/jsonrpc";
pub const DEFAULT_COAP_HOST: &str = "localhost";
pub const DEFAULT_COAP_PORT: u16 = 5683;
pub const DEFAULT_COAP_PATH: &str = "60001";

/// Where each server lives, as handed over by whoever loaded the configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TypedBuilder)]
pub struct Endpoints {
    #[builder(default = DEFAULT_REST_URL.to_owned(), setter(into))]
    pub rest_url: String,
    #[builder(default = DEFAULT_JSONRPC_URL.to_owned(), setter(into))]
    pub jsonrpc_url: String,
    #[builder(default = DEFAULT_COAP_HOST.to_owned(), setter(into))]
    pub coap_host: String,
    #[builder(default = DEFAULT_COAP_PORT)]
    pub coap_port: u16,
    /// Resource path of the FETCH target, without the leading slash.
    #[builder(default = DEFAULT_COAP_PATH.to_owned(), setter(into))]
    pub coap_path: String,
}

impl Default for Endpoints {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// Validated connection parameters for one protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndpointConfig {
    Http { url: Url },
    Coap { host: String, port: u16, path: String },
}

impl Endpoints {
    pub fn resolve(&self, protocol: Protocol) -> Result<EndpointConfig, ConfigError> {
        match protocol {
            Protocol::Rest => parse_http(protocol, &self.rest_url),
            Protocol::JsonRpc => parse_http(protocol, &self.jsonrpc_url),
            Protocol::Coap => {
                if self.coap_host.trim().is_empty() {
                    return Err(ConfigError::InvalidEndpoint {
                        protocol,
                        endpoint: self.coap_host.clone(),
                        reason: "host is empty".into(),
                    });
                }
                Ok(EndpointConfig::Coap {
                    host: self.coap_host.clone(),
                    port: self.coap_port,
                    path: self.coap_path.trim_matches('/').to_owned(),
                })
            }
        }
    }
}

fn parse_http(protocol: Protocol, raw: &str) -> Result<EndpointConfig, ConfigError> {
    let invalid = |reason: String| ConfigError::InvalidEndpoint {
        protocol,
        endpoint: raw.to_owned(),
        reason,
    };
    let url = Url::parse(raw).map_err(|e| invalid(e.to_string()))?;
    match url.scheme() {
        "http" | "https" => Ok(EndpointConfig::Http { url }),
        other => Err(invalid(format!("unsupported scheme `{other}`"))),
    }
}

/// Idle delay between two consecutive requests of the same virtual user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThinkTime {
    pub min: Duration,
    pub max: Duration,
}

impl ThinkTime {
    pub fn new(min: Duration, max: Duration) -> Self {
        Self { min, max }
    }

    pub fn fixed(value: Duration) -> Self {
        Self::new(value, value)
    }

    /// Draws a uniformly distributed delay from the range.
    pub fn sample(&self) -> Duration {
        if self.max <= self.min {
            return self.min;
        }
        rand::rng().random_range(self.min..=self.max)
    }
}

impl Default for ThinkTime {
    fn default() -> Self {
        Self::new(Duration::from_millis(10), Duration::from_millis(50))
    }
}

/// Everything a run needs, built once at startup and shared read-only afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TypedBuilder)]
pub struct RunConfig {
    #[builder(default)]
    pub endpoints: Endpoints,
    #[builder(default = true)]
    pub enable_rest: bool,
    #[builder(default = true)]
    pub enable_coap: bool,
    #[builder(default = true)]
    pub enable_jsonrpc: bool,
    /// Virtual users spawned for every enabled protocol.
    #[builder(default = 10)]
    pub users_per_protocol: usize,
    /// Users per second, per protocol.
    #[builder(default = 2.0)]
    pub spawn_rate: f64,
    /// Counted from the moment ramp-up begins.
    #[builder(default = Duration::from_secs(60))]
    pub duration: Duration,
    #[builder(default)]
    pub think_time: ThinkTime,
    /// Upper bound of a single request attempt.
    #[builder(default = Duration::from_secs(10))]
    pub request_timeout: Duration,
    /// How long in-flight attempts may keep running after the stop signal.
    #[builder(default = Duration::from_secs(2))]
    pub grace_period: Duration,
    /// Granularity of the ramp-up governor.
    #[builder(default = Duration::from_millis(100))]
    pub spawn_tick: Duration,
    /// Cap of the think-time multiplier applied after consecutive refused connections.
    #[builder(default = 8)]
    pub max_backoff: u32,
    #[builder(default = CAR_NAME.to_owned(), setter(into))]
    pub car_name: String,
    #[builder(default, setter(strip_option, into))]
    pub csv_output_path: Option<PathBuf>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl RunConfig {
    pub fn is_enabled(&self, protocol: Protocol) -> bool {
        match protocol {
            Protocol::Rest => self.enable_rest,
            Protocol::Coap => self.enable_coap,
            Protocol::JsonRpc => self.enable_jsonrpc,
        }
    }

    pub fn enabled_protocols(&self) -> Vec<Protocol> {
        Protocol::ALL
            .into_iter()
            .filter(|p| self.is_enabled(*p))
            .collect()
    }

    /// Resolved endpoint of every enabled protocol.
    pub fn endpoints(&self) -> Result<Vec<(Protocol, EndpointConfig)>, ConfigError> {
        self.enabled_protocols()
            .into_iter()
            .map(|p| Ok((p, self.endpoints.resolve(p)?)))
            .collect()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.enabled_protocols().is_empty() {
            return Err(ConfigError::NoProtocolEnabled);
        }
        if self.users_per_protocol == 0 {
            return Err(ConfigError::NoUsers);
        }
        if !self.spawn_rate.is_finite() || self.spawn_rate <= 0.0 {
            return Err(ConfigError::InvalidSpawnRate(self.spawn_rate));
        }
        if self.duration.is_zero() {
            return Err(ConfigError::ZeroDuration);
        }
        if self.request_timeout.is_zero() {
            return Err(ConfigError::ZeroInterval("request timeout"));
        }
        if self.spawn_tick.is_zero() {
            return Err(ConfigError::ZeroInterval("spawn tick"));
        }
        if self.think_time.min > self.think_time.max {
            return Err(ConfigError::InvertedThinkTime {
                min_ms: self.think_time.min.as_millis(),
                max_ms: self.think_time.max.as_millis(),
            });
        }
        self.endpoints()?;
        Ok(())
    }
}

/// Parses durations such as `90`, `90s`, `500ms`, `10m` or `1h`. A bare number is seconds.
pub fn parse_duration(raw: &str) -> Result<Duration, String> {
    let raw = raw.trim();
    let split = raw
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .unwrap_or(raw.len());
    let (value, unit) = raw.split_at(split);
    let value: f64 = value
        .parse()
        .map_err(|_| format!("`{raw}` does not start with a number"))?;
    let seconds = match unit.trim() {
        "" | "s" => value,
        "ms" => value / 1000.0,
        "m" => value * 60.0,
        "h" => value * 3600.0,
        other => return Err(format!("unknown duration unit `{other}`")),
    };
    Duration::try_from_secs_f64(seconds).map_err(|e| format!("`{raw}`: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_reference_servers() {
        let config = RunConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.enabled_protocols(), Protocol::ALL.to_vec());
        assert_eq!(config.think_time, ThinkTime::default());
        assert_eq!(
            config.endpoints.resolve(Protocol::Coap).unwrap(),
            EndpointConfig::Coap {
                host: "localhost".into(),
                port: 5683,
                path: "60001".into(),
            }
        );
    }

    #[test]
    fn all_protocols_disabled_is_rejected() {
        let config = RunConfig::builder()
            .enable_rest(false)
            .enable_coap(false)
            .enable_jsonrpc(false)
            .build();
        assert_eq!(config.validate(), Err(ConfigError::NoProtocolEnabled));
    }

    #[test]
    fn disabled_protocol_endpoints_are_not_checked() {
        let config = RunConfig::builder()
            .endpoints(Endpoints::builder().rest_url("not a url").build())
            .enable_rest(false)
            .build();
        assert!(config.validate().is_ok());
        assert_eq!(
            config.enabled_protocols(),
            vec![Protocol::Coap, Protocol::JsonRpc]
        );
    }

    #[test]
    fn bad_urls_are_rejected() {
        let config = RunConfig::builder()
            .endpoints(Endpoints::builder().jsonrpc_url("ftp://localhost/rpc").build())
            .build();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidEndpoint {
                protocol: Protocol::JsonRpc,
                ..
            })
        ));
    }

    #[test]
    fn https_urls_are_accepted() {
        let endpoints = Endpoints::builder()
            .rest_url("https://obu.example:8443/externalLights")
            .build();
        let config = RunConfig::builder().endpoints(endpoints).build();
        assert!(config.validate().is_ok());
        let Ok(EndpointConfig::Http { url }) = config.endpoints.resolve(Protocol::Rest) else {
            panic!("rest endpoint did not resolve to http");
        };
        assert_eq!(url.scheme(), "https");
        assert_eq!(url.port(), Some(8443));
    }

    #[test]
    fn load_parameters_are_checked() {
        let cases = [
            (
                RunConfig::builder().users_per_protocol(0).build(),
                ConfigError::NoUsers,
            ),
            (
                RunConfig::builder().spawn_rate(0.0).build(),
                ConfigError::InvalidSpawnRate(0.0),
            ),
            (
                RunConfig::builder().duration(Duration::ZERO).build(),
                ConfigError::ZeroDuration,
            ),
            (
                RunConfig::builder()
                    .think_time(ThinkTime::new(
                        Duration::from_millis(50),
                        Duration::from_millis(10),
                    ))
                    .build(),
                ConfigError::InvertedThinkTime {
                    min_ms: 50,
                    max_ms: 10,
                },
            ),
        ];
        for (config, expected) in cases {
            assert_eq!(config.validate(), Err(expected));
        }
    }

    #[test]
    fn think_time_samples_stay_in_range() {
        let range = ThinkTime::new(Duration::from_millis(10), Duration::from_millis(50));
        for _ in 0..1000 {
            let t = range.sample();
            assert!(t >= range.min && t <= range.max);
        }
        let fixed = ThinkTime::fixed(Duration::from_millis(7));
        assert_eq!(fixed.sample(), Duration::from_millis(7));
    }

    #[test]
    fn durations_accept_locust_style_units() {
        assert_eq!(parse_duration("90"), Ok(Duration::from_secs(90)));
        assert_eq!(parse_duration("90s"), Ok(Duration::from_secs(90)));
        assert_eq!(parse_duration("250ms"), Ok(Duration::from_millis(250)));
        assert_eq!(parse_duration("10m"), Ok(Duration::from_secs(600)));
        assert_eq!(parse_duration("1h"), Ok(Duration::from_secs(3600)));
        assert_eq!(parse_duration("1.5s"), Ok(Duration::from_millis(1500)));
        assert!(parse_duration("10 parsecs").is_err());
        assert!(parse_duration("soon").is_err());
    }
}
