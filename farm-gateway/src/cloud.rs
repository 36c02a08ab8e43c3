/**
 * COLLABORATEURS CLOUD - Flux de commandes et puits de télémétrie
 *
 * RÔLE :
 * Seule frontière HTTP du maître. Le reste de la passerelle ne voit que deux
 * traits : CommandFeed (commandes à appliquer) et TelemetrySink (lots de
 * mesures à persister).
 *
 * FONCTIONNEMENT :
 * - HttpCloud : client reqwest, timeout 10s
 *   GET  {base}/public/api/farm_commands?organization_group.code=..&sent_date[gte]=..
 *   POST {base}/public/api/farm_data (lot JSON)
 * - LoggingSink : puits de repli quand aucun api_server n'est configuré
 * - Toute erreur remonte en CloudError, le relais passe alors en mode dégradé
 */

use crate::config::ApiServerConf;
use crate::logging::LogContext;
use farm_protocol::{CommandEnvelope, SystemCode, TelemetryBatch};
use futures::future::BoxFuture;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, info};

pub const CLOUD_TIMEOUT: Duration = Duration::from_secs(10);
const COMMANDS_PATH: &str = "/public/api/farm_commands";
const DATA_PATH: &str = "/public/api/farm_data";

#[derive(Debug, thiserror::Error)]
pub enum CloudError {
    #[error("cloud unreachable: {0}")]
    Unreachable(String),
    #[error("cloud HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("cloud answered status {0}")]
    Status(u16),
}

/// Source of commands addressed to this farm.
pub trait CommandFeed: Send + Sync {
    /// Commands sent at or after `since` (unix seconds).
    fn fetch_commands(&self, since: i64) -> BoxFuture<'_, Result<Vec<CommandEnvelope>, CloudError>>;
}

/// Destination of telemetry batches.
pub trait TelemetrySink: Send + Sync {
    fn publish(&self, batch: TelemetryBatch) -> BoxFuture<'_, Result<(), CloudError>>;
}

/// Command as listed by the cloud API. `data` comes as a number or as a
/// numeric string depending on the API version.
#[derive(Debug, Deserialize)]
struct CloudCommand {
    system_code: SystemCode,
    action: String,
    data: CloudValue,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum CloudValue {
    Number(i64),
    Text(String),
}

impl CloudCommand {
    fn into_envelope(self) -> Option<CommandEnvelope> {
        let data = match self.data {
            CloudValue::Number(n) => n,
            CloudValue::Text(s) => s.trim().parse().ok()?,
        };
        Some(CommandEnvelope {
            system_code: self.system_code,
            action: self.action,
            data,
        })
    }
}

pub struct HttpCloud {
    client: reqwest::Client,
    base_url: String,
    licence_key: String,
    log: LogContext,
}

impl HttpCloud {
    pub fn new(conf: &ApiServerConf, log: LogContext) -> Result<Self, CloudError> {
        let client = reqwest::Client::builder().timeout(CLOUD_TIMEOUT).build()?;
        Ok(Self {
            client,
            base_url: conf.base_url(),
            licence_key: conf.licence_key.clone(),
            log,
        })
    }

    async fn get_commands(&self, since: i64) -> Result<Vec<CommandEnvelope>, CloudError> {
        let url = format!("{}{}", self.base_url, COMMANDS_PATH);
        let since = since.to_string();
        let resp = self
            .client
            .get(&url)
            .query(&[
                ("organization_group.code", self.licence_key.as_str()),
                ("sent_date[gte]", since.as_str()),
            ])
            .send()
            .await
            .map_err(classify)?;
        if !resp.status().is_success() {
            return Err(CloudError::Status(resp.status().as_u16()));
        }

        let listed: Vec<CloudCommand> = resp.json().await?;
        let mut commands = Vec::with_capacity(listed.len());
        for cmd in listed {
            let action = cmd.action.clone();
            match cmd.into_envelope() {
                Some(envelope) => commands.push(envelope),
                None => info!(parent: self.log.span(), action = %action, "cloud command with non-numeric data ignored"),
            }
        }
        debug!(parent: self.log.span(), count = commands.len(), "cloud commands fetched");
        Ok(commands)
    }

    async fn post_data(&self, batch: TelemetryBatch) -> Result<(), CloudError> {
        let url = format!("{}{}", self.base_url, DATA_PATH);
        let resp = self.client.post(&url).json(&batch).send().await.map_err(classify)?;
        if !resp.status().is_success() {
            return Err(CloudError::Status(resp.status().as_u16()));
        }
        info!(parent: self.log.span(), codes = batch.len(), "data sent");
        Ok(())
    }
}

/// Connection failures and timeouts mean the cloud is unreachable; anything
/// else is reported as is.
fn classify(e: reqwest::Error) -> CloudError {
    if e.is_connect() || e.is_timeout() {
        CloudError::Unreachable(e.to_string())
    } else {
        CloudError::Http(e)
    }
}

impl CommandFeed for HttpCloud {
    fn fetch_commands(&self, since: i64) -> BoxFuture<'_, Result<Vec<CommandEnvelope>, CloudError>> {
        Box::pin(self.get_commands(since))
    }
}

impl TelemetrySink for HttpCloud {
    fn publish(&self, batch: TelemetryBatch) -> BoxFuture<'_, Result<(), CloudError>> {
        Box::pin(self.post_data(batch))
    }
}

/// Sink used when no api_server is configured: batches end up in the log.
pub struct LoggingSink {
    log: LogContext,
}

impl LoggingSink {
    pub fn new(log: LogContext) -> Self {
        Self { log }
    }
}

impl TelemetrySink for LoggingSink {
    fn publish(&self, batch: TelemetryBatch) -> BoxFuture<'_, Result<(), CloudError>> {
        Box::pin(async move {
            let body = serde_json::to_string(&batch).unwrap_or_default();
            info!(parent: self.log.span(), codes = batch.len(), batch = %body, "data sent");
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cloud_command_accepts_numeric_strings() {
        let listed: Vec<CloudCommand> = serde_json::from_str(
            r#"[
                {"system_code":"Z1","action":"led_color","data":4},
                {"system_code":"Z2","action":"on_off","data":"1"},
                {"system_code":"Z3","action":"on_off","data":"on"}
            ]"#,
        )
        .unwrap();
        let envelopes: Vec<_> = listed.into_iter().filter_map(CloudCommand::into_envelope).collect();
        assert_eq!(envelopes.len(), 2);
        assert_eq!(envelopes[0].data, 4);
        assert_eq!(envelopes[1].system_code, SystemCode::new("Z2"));
        assert_eq!(envelopes[1].data, 1);
    }

    #[test]
    fn http_cloud_builds_from_conf() {
        let conf = ApiServerConf {
            protocol: "http".into(),
            host: "127.0.0.1:1".into(),
            licence_key: "LIC".into(),
        };
        let cloud = HttpCloud::new(&conf, LogContext::disabled()).unwrap();
        assert_eq!(cloud.base_url, "http://127.0.0.1:1");
    }

    #[tokio::test]
    async fn unreachable_cloud_is_an_error() {
        let conf = ApiServerConf {
            protocol: "http".into(),
            host: "127.0.0.1:1".into(),
            licence_key: "LIC".into(),
        };
        let cloud = HttpCloud::new(&conf, LogContext::disabled()).unwrap();
        assert!(matches!(cloud.fetch_commands(0).await, Err(CloudError::Unreachable(_))));
        assert!(cloud.publish(TelemetryBatch::new()).await.is_err());
    }

    #[tokio::test]
    async fn logging_sink_accepts_everything() {
        let sink = LoggingSink::new(LogContext::disabled());
        assert!(sink.publish(TelemetryBatch::new()).await.is_ok());
    }
}
