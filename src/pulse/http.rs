//! HTTP(S) probe driver.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method, Url};
use tracing::debug;

use super::{Args, Prober, Status};
use crate::error::ValidationError;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(2);
const DEFAULT_EXPECT: u16 = 200;

/// Prober issuing one HTTP request per check and comparing the status code.
///
/// Redirects are never followed: a redirect response carries its 3xx code
/// into the comparison and counts as a failure. For `https` targets,
/// certificate verification is skipped so self-signed health endpoints work.
pub struct HttpProber {
    client: Client,
    method: Method,
    url: Url,
    expect: u16,
}

impl HttpProber {
    /// Build a prober for the backend endpoint, honoring the overrides in
    /// `args` (scheme, host, port, path, method, expected status, timeout).
    pub fn new(
        host: &str,
        port: u16,
        default_scheme: &str,
        args: &Args,
    ) -> Result<Self, ValidationError> {
        let scheme = args.scheme.as_deref().unwrap_or(default_scheme);
        let host = args.host.as_deref().unwrap_or(host);
        let port = args.port.unwrap_or(port);
        let path = args.path.as_deref().unwrap_or("/");
        let timeout = args.timeout.map_or(DEFAULT_TIMEOUT, Duration::from_secs);

        let method = match &args.method {
            Some(m) => m
                .parse::<Method>()
                .map_err(|_| ValidationError::InvalidPulse(format!("bad method: {m}")))?,
            None => Method::GET,
        };

        // The Url parser drops default ports, so the Host header never
        // carries :80 or :443.
        let raw = format!("{scheme}://{host}:{port}{path}");
        let url = Url::parse(&raw)
            .map_err(|e| ValidationError::InvalidPulse(format!("bad probe url {raw}: {e}")))?;

        let mut builder = Client::builder()
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::none());
        if scheme == "https" {
            builder = builder.danger_accept_invalid_certs(true);
        }
        let client = builder
            .build()
            .map_err(|e| ValidationError::InvalidPulse(format!("http client: {e}")))?;

        Ok(Self {
            client,
            method,
            url,
            expect: args.expect.unwrap_or(DEFAULT_EXPECT),
        })
    }
}

#[async_trait]
impl Prober for HttpProber {
    async fn check(&self) -> Status {
        match self
            .client
            .request(self.method.clone(), self.url.clone())
            .send()
            .await
        {
            Ok(response) if response.status().as_u16() == self.expect => Status::Up,
            Ok(response) => {
                debug!(
                    url = %self.url,
                    status = response.status().as_u16(),
                    expect = self.expect,
                    "unexpected status code"
                );
                Status::Down
            }
            Err(e) => {
                debug!(url = %self.url, error = %e, "probe request failed");
                Status::Down
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let prober = HttpProber::new("10.0.0.5", 8080, "http", &Args::default()).unwrap();
        assert_eq!(prober.url.as_str(), "http://10.0.0.5:8080/");
        assert_eq!(prober.method, Method::GET);
        assert_eq!(prober.expect, 200);
    }

    #[test]
    fn test_default_port_is_dropped_from_url() {
        let prober = HttpProber::new("health.example", 80, "http", &Args::default()).unwrap();
        assert_eq!(prober.url.port(), None);
        assert_eq!(prober.url.host_str(), Some("health.example"));
    }

    #[test]
    fn test_overrides() {
        let args = Args {
            method: Some("HEAD".into()),
            path: Some("/healthz".into()),
            expect: Some(204),
            scheme: Some("https".into()),
            port: Some(9443),
            host: Some("probe.example".into()),
            ..Args::default()
        };
        let prober = HttpProber::new("10.0.0.5", 8080, "http", &args).unwrap();
        assert_eq!(prober.url.as_str(), "https://probe.example:9443/healthz");
        assert_eq!(prober.method, Method::HEAD);
        assert_eq!(prober.expect, 204);
    }

    #[test]
    fn test_bad_method_rejected() {
        let args = Args {
            method: Some("GE T".into()),
            ..Args::default()
        };
        assert!(HttpProber::new("10.0.0.5", 80, "http", &args).is_err());
    }

    #[tokio::test]
    async fn test_unreachable_backend_is_down() {
        // Reserved TEST-NET-1 address, nothing listens there.
        let args = Args {
            timeout: Some(1),
            ..Args::default()
        };
        let prober = HttpProber::new("192.0.2.1", 80, "http", &args).unwrap();
        assert_eq!(prober.check().await, Status::Down);
    }
}
