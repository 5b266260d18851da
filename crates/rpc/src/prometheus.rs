//! Prometheus exposition of an [`Inventory`].

use metrics::{describe_gauge, gauge};
use metrics_exporter_prometheus::PrometheusBuilder;
use rehost_core::Inventory;

/// Render the inventory's gauges in Prometheus text format.
///
/// Uses a recorder local to this call so every scrape reflects exactly the
/// sources of this walk and nothing from earlier ones.
pub fn render_prometheus(inventory: &Inventory, detailed: bool) -> String {
    let recorder = PrometheusBuilder::new().build_recorder();
    let handle = recorder.handle();
    let totals = inventory.metrics();

    metrics::with_local_recorder(&recorder, || {
        describe_gauge!(
            "rehost_nr_connections",
            "Amount of open connections to other peers"
        );
        describe_gauge!("rehost_total_bytes", "Bytes needed to host all entries");
        describe_gauge!(
            "rehost_nr_incomplete_cores",
            "Amount of sources which are not fully downloaded"
        );
        describe_gauge!("rehost_total_cores", "Total amount of rehosted sources");
        describe_gauge!(
            "rehost_cores_without_peers",
            "Amount of sources without other peers"
        );

        gauge!("rehost_nr_connections").set(totals.nr_connections as f64);
        gauge!("rehost_total_bytes").set(totals.total_bytes as f64);
        gauge!("rehost_nr_incomplete_cores").set(totals.nr_incomplete_cores as f64);
        gauge!("rehost_total_cores").set(totals.total_cores as f64);
        gauge!("rehost_cores_without_peers").set(totals.cores_without_peers as f64);

        if detailed {
            describe_gauge!("rehost_source_bytes", "Bytes stored for a source");
            describe_gauge!("rehost_source_peers", "Peers replicating a source");
            describe_gauge!(
                "rehost_source_missing_blocks",
                "Known blocks of a source not yet downloaded"
            );
            for node in &inventory.nodes {
                let key = node.identifier.to_hex();
                gauge!("rehost_source_bytes", "key" => key.clone())
                    .set(node.state.byte_size as f64);
                gauge!("rehost_source_peers", "key" => key.clone())
                    .set(node.state.peer_count as f64);
                gauge!("rehost_source_missing_blocks", "key" => key)
                    .set(node.state.missing_blocks() as f64);
            }
        }
    });

    handle.render()
}
