//! Capture sessions
//!
//! One session owns the live flow collection for a single
//! `(interface, direction)` pair. Its capture loop decodes packets and
//! updates the collection; its rotate task periodically stamps, snapshots
//! and publishes the collection to the accounting hub.

use crate::capture::{Direction, DriverError, PacketDriver};
use crate::core::flow::{FlowCollection, FlowFingerprint};
use crate::decoder::{DecodeError, LayerClass, LayerDecoder};
use crate::utils::metrics::SessionMetrics;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

pub const DEFAULT_ROTATE_INTERVAL_SECS: i64 = 1;

/// Decode failures naming these protocols are routine on real traffic and
/// are not worth a log line; everything else is reported.
const BENIGN_DECODE_TOKENS: [&str; 10] = [
    "IPv6",
    "DHCPv4",
    "IGMP",
    "TLS",
    "STP",
    "NTP",
    "VRRP",
    "SNAP",
    "LinkLayerDiscovery",
    "Fragment",
];

pub fn is_benign_decode_error(err: &DecodeError) -> bool {
    let msg = err.to_string();
    BENIGN_DECODE_TOKENS.iter().any(|token| msg.contains(token))
}

/// Packet-local scratch, zeroed after every packet and reused so the hot
/// path does not allocate once the string buffers have grown.
#[derive(Default)]
pub struct PacketScratch {
    fingerprint: FlowFingerprint,
    l3_bytes: i64,
    l4_bytes: i64,
    decoded: Vec<LayerClass>,
}

impl PacketScratch {
    fn clear(&mut self) {
        self.fingerprint.clear();
        self.l3_bytes = 0;
        self.l4_bytes = 0;
    }
}

/// One `(interface, direction)` capture and publish pair.
pub struct CaptureSession {
    pub interface_name: String,
    pub direction: Direction,
    pub decode_l4: bool,
    pub metrics: SessionMetrics,
    rotate_interval_secs: i64,
    collection: Mutex<FlowCollection>,
    publish_tx: mpsc::Sender<FlowCollection>,
}

impl CaptureSession {
    pub fn new(
        interface_name: &str,
        direction: Direction,
        decode_l4: bool,
        publish_tx: mpsc::Sender<FlowCollection>,
    ) -> Self {
        Self {
            interface_name: interface_name.to_string(),
            direction,
            decode_l4,
            metrics: SessionMetrics::new(),
            rotate_interval_secs: DEFAULT_ROTATE_INTERVAL_SECS,
            collection: Mutex::new(FlowCollection::new(interface_name)),
            publish_tx,
        }
    }

    /// Decode one packet buffer and fold it into the live collection.
    ///
    /// On an outbound session the fingerprint endpoints are swapped, so the
    /// recorded source is always the remote peer and both directions of a
    /// flow land on the same key.
    pub fn handle_packet(
        &self,
        decoder: &mut LayerDecoder,
        scratch: &mut PacketScratch,
        data: &[u8],
        first_layer: LayerClass,
    ) {
        self.metrics.record_packet(data.len());

        if let Err(err) = decoder.decode_layers(data, first_layer, &mut scratch.decoded) {
            if !is_benign_decode_error(&err) {
                self.metrics.record_decode_error();
                error!(
                    "error decoding packet on {}: {}",
                    self.interface_name, err
                );
            }
        }

        let outbound = self.direction == Direction::Outbound;
        for layer in &scratch.decoded {
            match layer {
                LayerClass::Ipv4 => {
                    if outbound {
                        scratch.fingerprint.set_addrs(decoder.ipv4.dst, decoder.ipv4.src);
                    } else {
                        scratch.fingerprint.set_addrs(decoder.ipv4.src, decoder.ipv4.dst);
                    }
                    scratch.l3_bytes = decoder.ipv4.total_length as i64;
                }
                LayerClass::Tcp => {
                    if outbound {
                        scratch.fingerprint.src_port = decoder.tcp.dst_port;
                        scratch.fingerprint.dst_port = decoder.tcp.src_port;
                    } else {
                        scratch.fingerprint.src_port = decoder.tcp.src_port;
                        scratch.fingerprint.dst_port = decoder.tcp.dst_port;
                    }
                    scratch.fingerprint.set_protocol("tcp");
                    scratch.l4_bytes = decoder.tcp.segment_len as i64;
                }
                LayerClass::Udp => {
                    if outbound {
                        scratch.fingerprint.src_port = decoder.udp.dst_port;
                        scratch.fingerprint.dst_port = decoder.udp.src_port;
                    } else {
                        scratch.fingerprint.src_port = decoder.udp.src_port;
                        scratch.fingerprint.dst_port = decoder.udp.dst_port;
                    }
                    scratch.fingerprint.set_protocol("udp");
                    scratch.l4_bytes = decoder.udp.length as i64;
                }
                LayerClass::Icmpv4 => {
                    scratch.fingerprint.set_protocol("icmp");
                    scratch.l4_bytes = decoder.icmpv4.message_len as i64;
                }
                _ => {}
            }
        }

        if !scratch.fingerprint.src_addr.is_empty() {
            let mut collection = self.collection.lock().unwrap();
            match self.direction {
                Direction::Outbound => {
                    collection.update_l3_outbound(&scratch.fingerprint, scratch.l3_bytes, 1)
                }
                Direction::Inbound => {
                    collection.update_l3_inbound(&scratch.fingerprint, scratch.l3_bytes, 1)
                }
            }

            if self.decode_l4 && !scratch.fingerprint.protocol.is_empty() {
                // L4 rows carry the IPv4 total length, so the network and
                // transport tables agree on byte totals for a flow.
                match self.direction {
                    Direction::Outbound => {
                        collection.update_l4_outbound(&scratch.fingerprint, scratch.l3_bytes, 1)
                    }
                    Direction::Inbound => {
                        collection.update_l4_inbound(&scratch.fingerprint, scratch.l3_bytes, 1)
                    }
                }
            }
        }

        scratch.clear();
    }

    /// Blocking read loop over a pull driver. Runs on its own thread until
    /// cancellation; driver read timeouts are the cancellation poll points.
    pub fn run_capture(&self, mut driver: Box<dyn PacketDriver>, cancel: CancellationToken) {
        let mut decoder = LayerDecoder::new(self.decode_l4);
        let first_layer = match decoder.first_layer(driver.link_kind()) {
            Some(layer) => layer,
            None => {
                error!(
                    "failed to find first decode layer type for {} ({})",
                    self.interface_name,
                    self.direction.as_str()
                );
                driver.close();
                return;
            }
        };

        info!(
            "capture started on {} ({})",
            self.interface_name,
            self.direction.as_str()
        );

        let mut scratch = PacketScratch::default();
        while !cancel.is_cancelled() {
            match driver.read_packet() {
                Ok(data) => self.handle_packet(&mut decoder, &mut scratch, data, first_layer),
                Err(DriverError::Timeout) => continue,
                Err(err) => {
                    self.metrics.record_read_error();
                    error!("error getting packet on {}: {}", self.interface_name, err);
                }
            }
        }

        driver.close();
        info!(
            "capture exit on {} ({}): {}",
            self.interface_name,
            self.direction.as_str(),
            self.metrics.summary()
        );
    }

    /// Stamp, snapshot and reset the live collection for the window ending
    /// at `now`. The snapshot is the unit of ownership transfer to the hub.
    pub fn rotate_now(&self, now: i64) -> FlowCollection {
        let mut collection = self.collection.lock().unwrap();
        collection.set_timestamp(now - self.rotate_interval_secs, now);
        collection.stamp_duration(self.direction, self.rotate_interval_secs);
        let snapshot = collection.snapshot();
        collection.reset();
        snapshot
    }

    /// Periodic rotate-and-publish task. Publishes every window, empty
    /// ones included, so the hub's notion of the latest window keeps
    /// advancing with wall-clock time.
    pub async fn run_rotate(&self, cancel: CancellationToken) {
        let period = Duration::from_secs(self.rotate_interval_secs as u64);
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!(
                        "rotate exit on {} ({})",
                        self.interface_name,
                        self.direction.as_str()
                    );
                    return;
                }
                _ = ticker.tick() => {
                    let snapshot = self.rotate_now(chrono::Utc::now().timestamp());
                    if self.publish_tx.send(snapshot).await.is_err() {
                        info!(
                            "publish channel closed, rotate exit on {} ({})",
                            self.interface_name,
                            self.direction.as_str()
                        );
                        return;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::layers::testutil::{
        eth_frame, ipv4_header, ipv4_header_with_len, tcp_header, udp_header, ETHERTYPE_IPV4,
    };

    fn session(direction: Direction, decode_l4: bool) -> (CaptureSession, mpsc::Receiver<FlowCollection>) {
        let (tx, rx) = mpsc::channel(16);
        (CaptureSession::new("eth0", direction, decode_l4, tx), rx)
    }

    fn udp_packet(src: &str, dst: &str, sp: u16, dp: u16, total_len: u16) -> Vec<u8> {
        let udp = udp_header(sp, dp, &[0u8; 16]);
        let ip = ipv4_header_with_len(src, dst, 17, total_len, &udp);
        eth_frame(ETHERTYPE_IPV4, &ip)
    }

    #[test]
    fn test_outbound_udp_flow_through_rotate() {
        let (session, _rx) = session(Direction::Outbound, false);
        let mut decoder = LayerDecoder::new(false);
        let mut scratch = PacketScratch::default();

        for _ in 0..3 {
            let pkt = udp_packet("10.0.0.1", "8.8.8.8", 53, 53, 60);
            session.handle_packet(&mut decoder, &mut scratch, &pkt, LayerClass::Ethernet);
        }

        let snapshot = session.rotate_now(1000);

        assert_eq!(snapshot.window.start, 999);
        assert_eq!(snapshot.window.end, 1000);
        assert_eq!(snapshot.l3.len(), 1);

        let expected = FlowFingerprint {
            src_addr: "8.8.8.8".to_string(),
            dst_addr: "10.0.0.1".to_string(),
            ..Default::default()
        };
        let flow = &snapshot.l3[&expected];
        assert_eq!(flow.outbound_bytes, 180);
        assert_eq!(flow.outbound_packets, 3);
        assert_eq!(flow.outbound_duration, 1);
        assert_eq!(flow.inbound_bytes, 0);
        assert_eq!(flow.inbound_packets, 0);
        assert_eq!(flow.inbound_duration, 0);
    }

    #[test]
    fn test_rotate_resets_live_collection() {
        let (session, _rx) = session(Direction::Outbound, false);
        let mut decoder = LayerDecoder::new(false);
        let mut scratch = PacketScratch::default();

        let pkt = udp_packet("10.0.0.1", "8.8.8.8", 53, 53, 60);
        session.handle_packet(&mut decoder, &mut scratch, &pkt, LayerClass::Ethernet);

        let first = session.rotate_now(1000);
        let second = session.rotate_now(1001);

        assert_eq!(first.l3.len(), 1);
        assert!(second.l3.is_empty());
        assert_eq!(second.window.end, 1001);
    }

    #[test]
    fn test_direction_swap_shares_flow_key() {
        let (outbound, _rx_out) = session(Direction::Outbound, false);
        let (inbound, _rx_in) = session(Direction::Inbound, false);
        let mut decoder = LayerDecoder::new(false);
        let mut scratch = PacketScratch::default();

        // A request seen by the outbound session and its reply seen by the
        // inbound session must land on the same fingerprint.
        let request = udp_packet("10.0.0.1", "8.8.8.8", 53, 53, 60);
        let reply = udp_packet("8.8.8.8", "10.0.0.1", 53, 53, 80);

        outbound.handle_packet(&mut decoder, &mut scratch, &request, LayerClass::Ethernet);
        inbound.handle_packet(&mut decoder, &mut scratch, &reply, LayerClass::Ethernet);

        let out_snapshot = outbound.rotate_now(1000);
        let in_snapshot = inbound.rotate_now(1000);

        let out_key = out_snapshot.l3.keys().next().unwrap().clone();
        let in_key = in_snapshot.l3.keys().next().unwrap().clone();
        assert_eq!(out_key, in_key);
        assert_eq!(out_key.src_addr, "8.8.8.8");
        assert_eq!(out_key.dst_addr, "10.0.0.1");
    }

    #[test]
    fn test_l4_rows_use_network_layer_length() {
        let (session, _rx) = session(Direction::Inbound, true);
        let mut decoder = LayerDecoder::new(true);
        let mut scratch = PacketScratch::default();

        // 16 payload bytes behind a 20-byte header: the UDP length field
        // reads 24, the IPv4 total length 44.
        let pkt = udp_packet("10.0.0.1", "10.0.0.2", 40000, 9999, 44);
        session.handle_packet(&mut decoder, &mut scratch, &pkt, LayerClass::Ethernet);

        let snapshot = session.rotate_now(1000);
        let l4_flow = snapshot.l4.values().next().unwrap();
        assert_eq!(l4_flow.fingerprint.protocol, "udp");
        assert_eq!(l4_flow.fingerprint.src_port, 40000);
        assert_eq!(l4_flow.inbound_bytes, 44);
    }

    #[test]
    fn test_first_fragment_accounts_transport_layer() {
        let (session, _rx) = session(Direction::Inbound, true);
        let mut decoder = LayerDecoder::new(true);
        let mut scratch = PacketScratch::default();

        let udp = udp_header(40000, 9999, &[0xde, 0xad]);
        let ip = ipv4_header("172.16.0.1", "172.16.0.2", 17, 0, true, &udp);
        let pkt = eth_frame(ETHERTYPE_IPV4, &ip);

        session.handle_packet(&mut decoder, &mut scratch, &pkt, LayerClass::Ethernet);

        let snapshot = session.rotate_now(1000);
        assert_eq!(snapshot.l3.len(), 1);
        assert_eq!(snapshot.l4.len(), 1);
        let l4_flow = snapshot.l4.values().next().unwrap();
        assert_eq!(l4_flow.fingerprint.protocol, "udp");
        assert_eq!(l4_flow.inbound_packets, 1);
    }

    #[test]
    fn test_benign_transport_gap_counts_l3_only() {
        let (session, _rx) = session(Direction::Inbound, true);
        let mut decoder = LayerDecoder::new(true);
        let mut scratch = PacketScratch::default();

        // IGMP is not decodable past IPv4: the network layer is counted,
        // no transport row appears and nothing is treated as an error.
        let ip = ipv4_header("10.0.0.5", "224.0.0.1", 2, 0, false, &[0x11, 0x64, 0x00, 0x00]);
        let pkt = eth_frame(ETHERTYPE_IPV4, &ip);

        session.handle_packet(&mut decoder, &mut scratch, &pkt, LayerClass::Ethernet);

        let snapshot = session.rotate_now(1000);
        assert_eq!(snapshot.l3.len(), 1);
        assert!(snapshot.l4.is_empty());
        assert_eq!(session.metrics.decode_errors(), 0);
    }

    #[test]
    fn test_truncated_transport_still_counts_decoded_layers() {
        let (session, _rx) = session(Direction::Inbound, true);
        let mut decoder = LayerDecoder::new(true);
        let mut scratch = PacketScratch::default();

        // Valid IPv4 claiming TCP, with only 4 bytes of it captured.
        let ip = ipv4_header("10.0.0.5", "10.0.0.6", 6, 0, false, &[0x01, 0xbb, 0x00, 0x50]);
        let pkt = eth_frame(ETHERTYPE_IPV4, &ip);

        session.handle_packet(&mut decoder, &mut scratch, &pkt, LayerClass::Ethernet);

        let snapshot = session.rotate_now(1000);
        assert_eq!(snapshot.l3.len(), 1);
        assert!(snapshot.l4.is_empty());
        assert_eq!(session.metrics.decode_errors(), 1);
    }

    #[test]
    fn test_tcp_ports_swapped_on_outbound() {
        let (session, _rx) = session(Direction::Outbound, true);
        let mut decoder = LayerDecoder::new(true);
        let mut scratch = PacketScratch::default();

        let tcp = tcp_header(40000, 80, b"GET / HTTP/1.1");
        let ip = ipv4_header("10.0.0.1", "93.184.216.34", 6, 0, false, &tcp);
        let pkt = eth_frame(ETHERTYPE_IPV4, &ip);

        session.handle_packet(&mut decoder, &mut scratch, &pkt, LayerClass::Ethernet);

        let snapshot = session.rotate_now(1000);
        let key = snapshot.l4.keys().next().unwrap();
        assert_eq!(key.src_addr, "93.184.216.34");
        assert_eq!(key.src_port, 80);
        assert_eq!(key.dst_addr, "10.0.0.1");
        assert_eq!(key.dst_port, 40000);
        assert_eq!(key.protocol, "tcp");
    }

    #[test]
    fn test_benign_error_tokens() {
        let benign = DecodeError::truncated("IPv6", 40, 12);
        assert!(is_benign_decode_error(&benign));

        let benign = DecodeError::Malformed {
            layer: "TLS",
            reason: "record header truncated",
        };
        assert!(is_benign_decode_error(&benign));

        let reported = DecodeError::truncated("DNS", 12, 4);
        assert!(!is_benign_decode_error(&reported));
    }

    #[tokio::test]
    async fn test_run_rotate_publishes_windows() {
        let (tx, mut rx) = mpsc::channel(16);
        let session = std::sync::Arc::new(CaptureSession::new(
            "eth0",
            Direction::Inbound,
            false,
            tx,
        ));
        let cancel = CancellationToken::new();

        let task = tokio::spawn({
            let session = session.clone();
            let cancel = cancel.clone();
            async move { session.run_rotate(cancel).await }
        });

        let published = tokio::time::timeout(Duration::from_secs(3), rx.recv())
            .await
            .expect("rotate should publish within its interval")
            .expect("channel open");
        assert_eq!(published.interface_name, "eth0");
        assert_eq!(
            published.window.end - published.window.start,
            DEFAULT_ROTATE_INTERVAL_SECS
        );

        cancel.cancel();
        task.await.unwrap();
    }
}
