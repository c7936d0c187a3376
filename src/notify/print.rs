//! Stdout table reporter

use crate::core::accounting::Accounting;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Renders per-interface flow tables to stdout on a fixed interval.
pub struct PrintNotifier {
    acct: Arc<Accounting>,
    interval_secs: i64,
    decode_l4: bool,
}

impl PrintNotifier {
    pub fn new(acct: Arc<Accounting>, interval_secs: i64, decode_l4: bool) -> Self {
        Self {
            acct,
            interval_secs,
            decode_l4,
        }
    }

    pub async fn run(&self, cancel: CancellationToken) {
        let period = Duration::from_secs(self.interval_secs as u64);
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("print notifier exit");
                    return;
                }
                _ = ticker.tick() => {
                    self.print_once();
                }
            }
        }
    }

    fn print_once(&self) {
        for hist in self.acct.histories() {
            let (collection, window) = hist.aggregate_by_duration(self.interval_secs);

            println!(
                "[{} {} - {}]",
                hist.interface_name,
                format_unix(window.start),
                format_unix(window.end)
            );

            println!("- [Network Layer]");
            println!(
                "{:<6} {:<16} {:<16} {:>12} {:>10} {:>11} {:>8} {:>12} {:>11} {:>12} {:>8}",
                "Index",
                "SrcAddr",
                "DstAddr",
                "BytesIn",
                "PacketsIn",
                "DurationIn",
                "RateIn",
                "BytesOut",
                "PacketsOut",
                "DurationOut",
                "RateOut"
            );
            println!("{}", "-".repeat(132));
            for (index, flow) in collection.l3.values().enumerate() {
                println!(
                    "{:<6} {:<16} {:<16} {:>12} {:>10} {:>11} {:>8} {:>12} {:>11} {:>12} {:>8}",
                    index,
                    flow.fingerprint.src_addr,
                    flow.fingerprint.dst_addr,
                    flow.inbound_bytes,
                    flow.inbound_packets,
                    flow.inbound_duration,
                    format_rate(flow.inbound_bytes, flow.inbound_duration),
                    flow.outbound_bytes,
                    flow.outbound_packets,
                    flow.outbound_duration,
                    format_rate(flow.outbound_bytes, flow.outbound_duration)
                );
            }

            if self.decode_l4 {
                println!("- [Transport Layer]");
                println!(
                    "{:<6} {:<16} {:<16} {:>8} {:>8} {:>9} {:>12} {:>10} {:>11} {:>8} {:>12} {:>11} {:>12} {:>8}",
                    "Index",
                    "SrcAddr",
                    "DstAddr",
                    "SrcPort",
                    "DstPort",
                    "Protocol",
                    "BytesIn",
                    "PacketsIn",
                    "DurationIn",
                    "RateIn",
                    "BytesOut",
                    "PacketsOut",
                    "DurationOut",
                    "RateOut"
                );
                println!("{}", "-".repeat(160));
                for (index, flow) in collection.l4.values().enumerate() {
                    println!(
                        "{:<6} {:<16} {:<16} {:>8} {:>8} {:>9} {:>12} {:>10} {:>11} {:>8} {:>12} {:>11} {:>12} {:>8}",
                        index,
                        flow.fingerprint.src_addr,
                        flow.fingerprint.dst_addr,
                        flow.fingerprint.src_port,
                        flow.fingerprint.dst_port,
                        flow.fingerprint.protocol,
                        flow.inbound_bytes,
                        flow.inbound_packets,
                        flow.inbound_duration,
                        format_rate(flow.inbound_bytes, flow.inbound_duration),
                        flow.outbound_bytes,
                        flow.outbound_packets,
                        flow.outbound_duration,
                        format_rate(flow.outbound_bytes, flow.outbound_duration)
                    );
                }
            }

            println!();
        }
    }
}

/// Rate in Mb/s with two decimals, or `-` when the direction carries no
/// duration (no session observed it during the window).
fn format_rate(bytes: i64, duration: i64) -> String {
    if duration == 0 {
        return "-".to_string();
    }
    let mbps = (bytes * 8 / duration / 1000) as f64 / 1000.0;
    format!("{:.2}", mbps)
}

fn format_unix(ts: i64) -> String {
    match chrono::DateTime::from_timestamp(ts, 0) {
        Some(t) => t.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
        None => ts.to_string(),
    }
}
