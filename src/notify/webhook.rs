//! Webhook reporter
//!
//! Posts the aggregated flows of every interface as one JSON document per
//! tick. Failures are logged and never retried; the next tick carries the
//! newer data anyway.

use crate::config::WebhookSettings;
use crate::core::accounting::Accounting;
use crate::core::flow::FlowCollection;
use anyhow::bail;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

pub const LAYER3_STRING: &str = "l3";
pub const LAYER4_STRING: &str = "l4";

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct WebhookFlow {
    pub layer: &'static str,
    pub src_addr: String,
    pub dst_addr: String,
    pub src_port: u16,
    pub dst_port: u16,
    pub protocol: String,
    pub inbound_bytes: i64,
    pub inbound_packets: i64,
    pub inbound_duration: i64,
    pub outbound_bytes: i64,
    pub outbound_packets: i64,
    pub outbound_duration: i64,
}

/// Report body; field names are the receiver's contract.
#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct WebhookReport {
    pub router_id: String,
    pub oam_addr: String,
    pub start: i64,
    pub end: i64,
    #[serde(rename = "FLowsMap")]
    pub flows_map: HashMap<String, Vec<WebhookFlow>>,
}

pub struct WebhookNotifier {
    acct: Arc<Accounting>,
    settings: WebhookSettings,
    client: reqwest::Client,
}

impl WebhookNotifier {
    pub fn new(acct: Arc<Accounting>, settings: WebhookSettings) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(settings.post_timeout_secs as u64))
            .build()?;

        Ok(Self {
            acct,
            settings,
            client,
        })
    }

    pub async fn run(&self, cancel: CancellationToken) {
        let period = Duration::from_secs(self.settings.interval_secs as u64);
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("webhook notifier exit");
                    return;
                }
                _ = ticker.tick() => {
                    let report = self.build_report();
                    if let Err(err) = self.post(&report).await {
                        error!(
                            "failed to post flows {} - {} with err: {}",
                            report.start, report.end, err
                        );
                    }
                }
            }
        }
    }

    fn build_report(&self) -> WebhookReport {
        let mut report = WebhookReport {
            router_id: self.settings.node_id.clone(),
            oam_addr: self.settings.node_oam_addr.clone(),
            start: 0,
            end: 0,
            flows_map: HashMap::new(),
        };

        for hist in self.acct.histories() {
            let (collection, window) = hist.aggregate_by_duration(self.settings.interval_secs);
            report.start = window.start;
            report.end = window.end;
            report
                .flows_map
                .insert(hist.interface_name.clone(), flatten_flows(&collection));
        }

        report
    }

    async fn post(&self, report: &WebhookReport) -> anyhow::Result<()> {
        let response = self
            .client
            .post(&self.settings.url)
            .json(report)
            .send()
            .await?;

        if !response.status().is_success() {
            bail!("response code is not 2xx but {}", response.status().as_u16());
        }

        Ok(())
    }
}

fn flatten_flows(collection: &FlowCollection) -> Vec<WebhookFlow> {
    let mut flows = Vec::with_capacity(collection.l3.len() + collection.l4.len());

    for flow in collection.l3.values() {
        flows.push(to_webhook_flow(flow, LAYER3_STRING));
    }
    for flow in collection.l4.values() {
        flows.push(to_webhook_flow(flow, LAYER4_STRING));
    }

    flows
}

fn to_webhook_flow(flow: &crate::core::flow::Flow, layer: &'static str) -> WebhookFlow {
    WebhookFlow {
        layer,
        src_addr: flow.fingerprint.src_addr.clone(),
        dst_addr: flow.fingerprint.dst_addr.clone(),
        src_port: flow.fingerprint.src_port,
        dst_port: flow.fingerprint.dst_port,
        protocol: flow.fingerprint.protocol.clone(),
        inbound_bytes: flow.inbound_bytes,
        inbound_packets: flow.inbound_packets,
        inbound_duration: flow.inbound_duration,
        outbound_bytes: flow.outbound_bytes,
        outbound_packets: flow.outbound_packets,
        outbound_duration: flow.outbound_duration,
    }
}
