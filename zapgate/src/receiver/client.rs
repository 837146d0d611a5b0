//! HTTP client for the receiver's web API.

use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Once;
use std::time::Duration;

use crate::{Error, Result};

static CRYPTO_PROVIDER: Once = Once::new();

pub(crate) fn ensure_crypto_provider() {
    CRYPTO_PROVIDER.call_once(|| {
        let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
    });
}

/// Tuner state reported by the receiver.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TunerStatus {
    /// Service reference the tuner is currently locked on.
    pub current_ref: String,
    /// Signal-to-noise ratio; zero means no lock.
    pub snr: i32,
    /// Receiver is in standby.
    pub standby: bool,
    /// Video PID of the current service; zero before lock.
    pub video_pid: i64,
    /// PMT PID of the current service; zero before lock.
    pub pmt_pid: i64,
}

/// Source of tuner status; the readiness checker polls this.
#[async_trait]
pub trait StatusSource: Send + Sync + 'static {
    async fn status(&self) -> Result<TunerStatus>;
}

/// Wire shape of the receiver's status endpoint. Field names follow the
/// box's web API; everything defaults so partial payloads still parse.
#[derive(Debug, Deserialize)]
struct StatusInfoDto {
    #[serde(default)]
    currservice_serviceref: String,
    #[serde(default)]
    snr: i32,
    #[serde(default, rename = "inStandby")]
    in_standby: String,
    #[serde(default)]
    vpid: i64,
    #[serde(default)]
    pmtpid: i64,
}

impl From<StatusInfoDto> for TunerStatus {
    fn from(dto: StatusInfoDto) -> Self {
        Self {
            current_ref: dto.currservice_serviceref,
            snr: dto.snr,
            standby: dto.in_standby.eq_ignore_ascii_case("true"),
            video_pid: dto.vpid,
            pmt_pid: dto.pmtpid,
        }
    }
}

/// Reqwest-backed client for the receiver web API.
#[derive(Debug, Clone)]
pub struct ReceiverClient {
    http: reqwest::Client,
    api_base: String,
}

impl ReceiverClient {
    /// `api_base` is the receiver root, e.g. `http://receiver.lan`.
    pub fn new(api_base: impl Into<String>) -> Result<Self> {
        ensure_crypto_provider();
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| Error::upstream(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            http,
            api_base: api_base.into().trim_end_matches('/').to_string(),
        })
    }

    pub fn with_client(api_base: impl Into<String>, http: reqwest::Client) -> Self {
        Self {
            http,
            api_base: api_base.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn api_base(&self) -> &str {
        &self.api_base
    }

    /// Fetch the mini playlist the receiver publishes for a service. This
    /// is the "web zap": requesting it tunes the box.
    pub async fn web_zap(&self, service_ref: &str, timeout: Duration) -> Result<String> {
        let url = format!(
            "{}/web/stream.m3u?ref={}&name=Stream",
            self.api_base,
            urlencoding::encode(service_ref)
        );

        let response = self
            .http
            .get(&url)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| Error::Zap(format!("web zap request failed: {e}")))?;

        if !response.status().is_success() {
            return Err(Error::Zap(format!(
                "web zap returned HTTP {}",
                response.status()
            )));
        }

        response
            .text()
            .await
            .map_err(|e| Error::Zap(format!("web zap body read failed: {e}")))
    }
}

#[async_trait]
impl StatusSource for ReceiverClient {
    async fn status(&self) -> Result<TunerStatus> {
        let url = format!("{}/api/statusinfo", self.api_base);

        let dto: StatusInfoDto = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| Error::upstream(format!("status request failed: {e}")))?
            .error_for_status()
            .map_err(|e| Error::upstream(format!("status returned {e}")))?
            .json()
            .await
            .map_err(|e| Error::upstream(format!("status body parse failed: {e}")))?;

        Ok(dto.into())
    }
}
