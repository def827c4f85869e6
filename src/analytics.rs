//! Batched analytics event sink. Connect/disconnect events are queued on an
//! unbounded channel and flushed to the collector every few seconds; delivery
//! is best-effort and never blocks the link path.

use serde::Serialize;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{interval, Duration};
use tracing::{debug, warn};

use crate::config::AnalyticsConfig;

#[derive(Debug, Clone, Serialize)]
pub struct LinkEvent {
    pub env: String,
    pub event: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session: Option<SessionMeta>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionMeta {
    pub session: u32,
    pub drone: String,
    pub user: String,
}

#[derive(Clone)]
pub struct Analytics {
    tx: mpsc::UnboundedSender<LinkEvent>,
    env: String,
}

impl Analytics {
    /// Starts the flush task and returns a cheap handle. With no collector
    /// configured, events are accepted and dropped at flush time.
    pub fn start(config: Arc<AnalyticsConfig>) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<LinkEvent>();
        let env = config.env.clone();

        tokio::spawn(async move {
            let http = reqwest::Client::new();
            let mut tick = interval(Duration::from_secs(config.flush_interval.max(1)));
            let mut batch: Vec<LinkEvent> = Vec::new();
            loop {
                tokio::select! {
                    maybe = rx.recv() => match maybe {
                        Some(event) => batch.push(event),
                        None => break,
                    },
                    _ = tick.tick() => {
                        if batch.is_empty() {
                            continue;
                        }
                        let events = std::mem::take(&mut batch);
                        if config.collector_url.is_empty() {
                            debug!("analytics disabled, dropping {} events", events.len());
                            continue;
                        }
                        let url = format!("{}/events/dronelink", config.collector_url.trim_end_matches('/'));
                        let res = http
                            .post(&url)
                            .header("Authorization", &config.write_key)
                            .json(&events)
                            .send()
                            .await;
                        match res {
                            Ok(resp) if resp.status().is_success() => {
                                debug!("flushed {} analytics events", events.len());
                            }
                            Ok(resp) => warn!("analytics collector returned {}", resp.status()),
                            Err(e) => warn!("analytics flush failed: {}", e),
                        }
                    }
                }
            }
        });

        Self { tx, env }
    }

    pub fn record(&self, event: &str, session: Option<SessionMeta>) {
        let _ = self.tx.send(LinkEvent {
            env: self.env.clone(),
            event: event.to_string(),
            session,
        });
    }
}
