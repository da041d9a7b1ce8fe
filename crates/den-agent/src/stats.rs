//! Traffic statistics
//!
//! Aggregates the overlay's per-connection counters into the report shape
//! the control plane expects, and serves the same snapshot over HTTP on the
//! statistics overlay port.

use std::collections::HashMap;
use std::time::Duration;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use hyper::body::Incoming;
use hyper::Request;
use hyper_util::rt::{TokioExecutor, TokioIo};
use tower::Service;
use tower_http::timeout::TimeoutLayer;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use den_core::client::StatsCollector;
use den_core::overlay::{ConnectionKey, Counts, OverlayListener};
use den_protocol::AgentStats;

/// Applies to reads, headers, and writes of the telemetry endpoint.
const HTTP_TIMEOUT: Duration = Duration::from_secs(20);

/// Roll per-connection counters up into one report.
pub fn aggregate(counts: HashMap<ConnectionKey, Counts>) -> AgentStats {
    let mut stats = AgentStats {
        num_conns: counts.len() as i64,
        ..Default::default()
    };

    for (conn, count) in counts {
        *stats.conns_by_proto.entry(conn.proto.to_string()).or_insert(0) += 1;
        stats.rx_packets += count.rx_packets as i64;
        stats.rx_bytes += count.rx_bytes as i64;
        stats.tx_packets += count.tx_packets as i64;
        stats.tx_bytes += count.tx_bytes as i64;
    }

    stats
}

async fn stats_snapshot(State(collect): State<StatsCollector>) -> Json<AgentStats> {
    Json(collect())
}

/// Serve the telemetry endpoint on an overlay listener until shutdown.
pub(crate) async fn serve_statistics(
    listener: Box<dyn OverlayListener>,
    collect: StatsCollector,
    shutdown: CancellationToken,
    tracker: TaskTracker,
) {
    let app = Router::new()
        .route("/", get(stats_snapshot))
        .layer(TimeoutLayer::new(HTTP_TIMEOUT))
        .with_state(collect);

    loop {
        let stream = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(stream) => stream,
                Err(err) => {
                    tracing::debug!(error = %err, "statistics listener closed");
                    break;
                }
            },
        };

        let tower_service = app.clone();
        tracker.spawn(async move {
            let io = TokioIo::new(stream);
            let hyper_service = hyper::service::service_fn(move |request: Request<Incoming>| {
                tower_service.clone().call(request)
            });
            if let Err(err) = hyper_util::server::conn::auto::Builder::new(TokioExecutor::new())
                .serve_connection(io, hyper_service)
                .await
            {
                tracing::debug!(error = %err, "serve statistics connection");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use den_core::overlay::Proto;

    fn key(proto: Proto, src: &str) -> ConnectionKey {
        ConnectionKey {
            proto,
            src: src.to_string(),
            dst: "peer:1".to_string(),
        }
    }

    #[test]
    fn test_aggregate_empty() {
        let stats = aggregate(HashMap::new());
        assert_eq!(stats, AgentStats::default());
    }

    #[test]
    fn test_aggregate_sums_counters() {
        let mut counts = HashMap::new();
        counts.insert(
            key(Proto::Tcp, "a:1"),
            Counts {
                rx_packets: 10,
                rx_bytes: 1000,
                tx_packets: 5,
                tx_bytes: 500,
            },
        );
        counts.insert(
            key(Proto::Tcp, "b:2"),
            Counts {
                rx_packets: 1,
                rx_bytes: 100,
                tx_packets: 2,
                tx_bytes: 200,
            },
        );
        counts.insert(
            key(Proto::Udp, "c:3"),
            Counts {
                rx_packets: 3,
                rx_bytes: 30,
                tx_packets: 4,
                tx_bytes: 40,
            },
        );

        let stats = aggregate(counts);
        assert_eq!(stats.num_conns, 3);
        assert_eq!(stats.conns_by_proto.get("tcp"), Some(&2));
        assert_eq!(stats.conns_by_proto.get("udp"), Some(&1));
        assert_eq!(stats.rx_packets, 14);
        assert_eq!(stats.rx_bytes, 1130);
        assert_eq!(stats.tx_packets, 11);
        assert_eq!(stats.tx_bytes, 740);
    }
}
