use std::fmt;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;
use shared::{
    domain::{LanePair, Side},
    error::ProtocolError,
    protocol::{LanePayload, LaneResponse},
};
use tracing::debug;
use url::Url;

use crate::{config::SyncSettings, error::SyncError};

/// Remote-state mutations the dashboard is allowed to request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlAction {
    Refresh,
    Flush(Side),
}

impl fmt::Display for ControlAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControlAction::Refresh => f.write_str("refresh"),
            ControlAction::Flush(side) => write!(f, "flush:{side}"),
        }
    }
}

#[async_trait]
pub trait LaneTransport: Send + Sync {
    async fn fetch_lane(&self, side: Side) -> Result<LanePayload, SyncError>;
    async fn trigger_action(&self, action: ControlAction) -> Result<(), SyncError>;
}

pub struct HttpTransport {
    http: Client,
    lane_urls: LanePair<Url>,
    flush_urls: LanePair<Url>,
    refresh_url: Url,
}

impl HttpTransport {
    pub fn new(settings: &SyncSettings) -> Result<Self, SyncError> {
        let http = Client::builder()
            .timeout(settings.request_timeout())
            .build()?;
        Ok(Self {
            http,
            lane_urls: LanePair {
                left: settings.lane_url(Side::Left)?,
                right: settings.lane_url(Side::Right)?,
            },
            flush_urls: LanePair {
                left: settings.flush_url(Side::Left)?,
                right: settings.flush_url(Side::Right)?,
            },
            refresh_url: settings.refresh_url()?,
        })
    }

    fn action_url(&self, action: ControlAction) -> &Url {
        match action {
            ControlAction::Refresh => &self.refresh_url,
            ControlAction::Flush(side) => self.flush_urls.get(side),
        }
    }
}

#[async_trait]
impl LaneTransport for HttpTransport {
    async fn fetch_lane(&self, side: Side) -> Result<LanePayload, SyncError> {
        let url = self.lane_urls.get(side);
        debug!(%side, %url, "transport: fetching lane");
        let body = self
            .http
            .get(url.clone())
            .send()
            .await?
            .error_for_status()?
            .bytes()
            .await?;
        Ok(LaneResponse::from_slice(&body)?.into_payload()?)
    }

    async fn trigger_action(&self, action: ControlAction) -> Result<(), SyncError> {
        let url = self.action_url(action);
        debug!(%action, %url, "transport: triggering action");
        let body = self
            .http
            .post(url.clone())
            .send()
            .await?
            .error_for_status()?
            .bytes()
            .await?;

        // Empty and non-JSON bodies count as success; only an explicit ok=false fails.
        if let Ok(Value::Object(map)) = serde_json::from_slice::<Value>(&body) {
            if map.get("ok") == Some(&Value::Bool(false)) {
                return Err(ProtocolError::NotOk.into());
            }
        }
        Ok(())
    }
}

#[cfg(test)]
#[path = "tests/transport_tests.rs"]
mod tests;
