//! Converts batches of small records through the pools and prints the memory statistics.
//!
//! Run with `RUST_LOG=lw_pools=debug` to see pool installation and cleanup events.

use lw_pools::{ControlPanel, MAX_POOLED_LENGTH};
use tracing_subscriber::EnvFilter;

const BATCHES: usize = 3;
const RECORDS_PER_BATCH: usize = 10_000;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let panel = ControlPanel::global();

    for batch in 0..BATCHES {
        let scope = panel.leak_scope("batch");

        // Record sizes cycle through a few typical shapes, plus the odd oversized one.
        let records: Vec<_> = (0..RECORDS_PER_BATCH)
            .map(|i| {
                let length = match i % 100 {
                    0 => MAX_POOLED_LENGTH + 512,
                    n if n < 60 => 24,
                    n if n < 90 => 160,
                    _ => 1200,
                };

                let mut block = panel.acquire(length);
                block.fill(0xAB);
                (block, length)
            })
            .collect();

        println!("batch {batch}: {} records in flight", records.len());
        print_stats(panel);

        for (block, length) in records {
            panel.release(block, length);
        }

        println!("batch {batch}: net outstanding {}", scope.net_outstanding());
        drop(scope);

        if panel.conversion_finished() {
            println!("batch {batch}: released all pooled memory");
        }

        print_stats(panel);
    }
}

fn print_stats(panel: &ControlPanel) {
    let stats = panel.stats();

    println!(
        "  allocated {} B, used {} B, unused {} B, waste {:.1}%, pools {}, direct {} B",
        stats.total_allocated,
        stats.total_used,
        stats.unused_but_allocated(),
        stats.waste_fraction() * 100.0,
        stats.installed_pools,
        stats.direct_bytes_outstanding,
    );
}
