use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;
use tokio::net::TcpStream;

use super::types::ServiceCheck;
use crate::error::{Error, Result};

/// Performs a single health check against a service.
///
/// `Ok(())` is a successful check; any error counts as a failure. The
/// monitor measures response time and enforces `timeout` on top of the probe.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ServiceProbe: Send + Sync {
    /// Check `service` once.
    async fn check(&self, service: &str, check: &ServiceCheck, timeout: Duration) -> Result<()>;
}

/// Dispatches to the HTTP, Redis or TCP check named by [`ServiceCheck`].
pub struct DefaultProbe {
    http: Client,
}

impl DefaultProbe {
    /// Create a probe with a shared HTTP client
    pub fn new() -> Result<Self> {
        let http = Client::builder()
            .build()
            .map_err(|e| Error::Configuration(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self { http })
    }

    async fn check_http(&self, service: &str, url: &str, timeout: Duration) -> Result<()> {
        let response = self
            .http
            .get(url)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| Error::from_http(service, &e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::ConnectivityLoss {
                service: service.to_string(),
                message: format!("HTTP {}", status),
            });
        }

        // Bodies that are not JSON, or carry no status field, are fine.
        let body = response.text().await.unwrap_or_default();
        if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(&body) {
            if let Some(reported) = map.get("status").and_then(Value::as_str) {
                if reported != "healthy" && reported != "ok" {
                    return Err(Error::ConnectivityLoss {
                        service: service.to_string(),
                        message: format!("service reported status {:?}", reported),
                    });
                }
            }
        }
        Ok(())
    }

    async fn check_redis(service: &str, url: &str) -> Result<()> {
        let client = redis::Client::open(url)
            .map_err(|e| Error::Configuration(format!("invalid redis url: {}", e)))?;
        let mut conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| connectivity(service, e))?;
        let pong: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| connectivity(service, e))?;
        if pong != "PONG" {
            return Err(Error::ConnectivityLoss {
                service: service.to_string(),
                message: format!("unexpected PING reply {:?}", pong),
            });
        }
        Ok(())
    }

    async fn check_tcp(service: &str, address: &str) -> Result<()> {
        TcpStream::connect(address)
            .await
            .map(drop)
            .map_err(|e| connectivity(service, e))
    }
}

fn connectivity(service: &str, err: impl std::fmt::Display) -> Error {
    Error::ConnectivityLoss {
        service: service.to_string(),
        message: err.to_string(),
    }
}

#[async_trait]
impl ServiceProbe for DefaultProbe {
    async fn check(&self, service: &str, check: &ServiceCheck, timeout: Duration) -> Result<()> {
        match check {
            ServiceCheck::Http(url) => self.check_http(service, url, timeout).await,
            ServiceCheck::Redis(url) => Self::check_redis(service, url).await,
            ServiceCheck::Tcp(address) => Self::check_tcp(service, address).await,
            ServiceCheck::Custom(_) => Err(Error::Configuration(format!(
                "no custom probe registered for {}",
                service
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_tcp_probe_connects() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let probe = DefaultProbe::new().unwrap();

        let result = probe
            .check("db", &ServiceCheck::Tcp(addr), Duration::from_secs(1))
            .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_tcp_probe_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);
        let probe = DefaultProbe::new().unwrap();

        let err = probe
            .check("db", &ServiceCheck::Tcp(addr), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ConnectivityLoss { .. }));
    }

    #[tokio::test]
    async fn test_custom_check_without_probe_fails() {
        let probe = DefaultProbe::new().unwrap();
        let result = probe
            .check(
                "x",
                &ServiceCheck::Custom("anything".to_string()),
                Duration::from_secs(1),
            )
            .await;
        assert!(matches!(result, Err(Error::Configuration(_))));
    }
}
