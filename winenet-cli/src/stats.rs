//! Statistics display and formatting

use std::time::Duration;
use winenet::io::MediumStats;
use winenet::{NodeSnapshot, PeerId};

/// Format bytes in human-readable form
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

/// Format duration with millisecond precision
pub fn format_elapsed(duration: Duration) -> String {
    let millis = duration.as_millis();
    if millis >= 60_000 {
        format!("{}m {:02}s", millis / 60_000, (millis % 60_000) / 1000)
    } else if millis >= 1000 {
        format!("{:.2}s", duration.as_secs_f64())
    } else {
        format!("{}ms", millis)
    }
}

/// Result of one node in a simulation run
#[derive(Debug, Clone)]
pub struct NodeReport {
    pub id: PeerId,
    pub snapshot: NodeSnapshot,
    /// Submitted buffers that completed
    pub completed: usize,
    /// Submitted buffers that aborted
    pub aborted: usize,
    /// Buffers received from other nodes
    pub received: usize,
    pub bytes_received: u64,
}

/// Display the per-node summary of a run
pub fn display_summary(reports: &[NodeReport], medium: &MediumStats, elapsed: Duration) {
    println!("\n┌─────────────────────────────────────────────────────────────┐");
    println!("│ SIMULATION SUMMARY                                          │");
    println!("├─────────────────────────────────────────────────────────────┤");
    println!(
        "│ Nodes: {}   Elapsed: {}                                     ",
        reports.len(),
        format_elapsed(elapsed)
    );
    println!(
        "│ Medium: {} frames sent / {} delivered / {} lost            ",
        medium.frames_sent, medium.frames_delivered, medium.frames_dropped
    );
    println!("└─────────────────────────────────────────────────────────────┘");

    if reports.is_empty() {
        return;
    }

    println!("\n┌──────────────────┬──────┬───────┬──────────┬──────────┬───────┬────────┐");
    println!("│ Node             │ Done │ Abort │ Received │ Bytes    │ Retx  │ Yields │");
    println!("├──────────────────┼──────┼───────┼──────────┼──────────┼───────┼────────┤");
    for report in reports {
        display_node_row(report);
    }
    println!("└──────────────────┴──────┴───────┴──────────┴──────────┴───────┴────────┘");
}

fn display_node_row(report: &NodeReport) {
    let stats = &report.snapshot.stats;
    println!(
        "│ {:16} │ {:4} │ {:5} │ {:8} │ {:8} │ {:5} │ {:6} │",
        report.id.to_string(),
        report.completed,
        report.aborted,
        report.received,
        format_bytes(report.bytes_received),
        stats.retransmissions,
        stats.elections_yielded
    );
}

/// One line per node, for verbose runs
pub fn display_counters(report: &NodeReport) {
    let stats = &report.snapshot.stats;
    println!(
        "{} [{}] beacons {}/{} data {}/{} decode errors {} aborted sessions {}",
        report.id,
        report.snapshot.state,
        stats.beacons_sent,
        stats.beacons_received,
        stats.data_packets_sent,
        stats.data_packets_received,
        stats.decode_errors,
        stats.sessions_aborted
    );
}
