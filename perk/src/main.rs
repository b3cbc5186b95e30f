use clap::Parser;

use perk::Runtime;

#[derive(Parser, Debug)]
#[command(author, version, about = "perk runtime", long_about = None)]
struct Cli {
    /// The main script (.prk source with a compiled .pck next to it)
    script: String,

    /// Log collector statistics at exit
    #[arg(long)]
    gc_stats: bool,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();
    let runtime = Runtime::create();
    let code = runtime.run(&cli.script);

    if cli.gc_stats {
        for (i, snapshot) in runtime.heap_snapshots().into_iter().enumerate() {
            tracing::info!(
                target: "gc",
                allocator = i,
                shared_allocated_bytes = snapshot.stats.shared_allocated_bytes,
                shared_freed_bytes = snapshot.stats.shared_freed_bytes,
                shared_used_bytes = snapshot.shared.used_bytes as u64,
                nursery_collections = snapshot.stats.nursery_collections,
                promoted = snapshot.stats.promoted,
                longest_pause_us = snapshot.stats.longest_pause.as_micros() as u64,
                "allocator statistics"
            );
        }
    }

    std::process::exit(code);
}
