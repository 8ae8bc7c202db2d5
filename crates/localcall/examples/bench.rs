//! Round-trip latency benchmark.
//!
//! Spins up an in-process echo service and times calls across payload
//! sizes, reporting average and tail latencies plus throughput.
//!
//! Run with: `cargo run --release --example bench -- --iters 200`

use std::time::{Duration, Instant};

use clap::Parser;
use localcall::{Endpoint, ServiceCaller};

#[derive(Parser)]
#[command(about = "localcall round-trip latency benchmark")]
struct Args {
    /// Iterations per payload size.
    #[arg(long, default_value_t = 200)]
    iters: usize,

    /// Payload sizes in bytes.
    #[arg(long = "size", default_values_t = vec![921_600usize, 2_764_800, 6_220_800])]
    sizes: Vec<usize>,
}

fn percentile(sorted: &[Duration], p: f64) -> Duration {
    if sorted.is_empty() {
        return Duration::ZERO;
    }
    let k = ((p / 100.0) * (sorted.len() - 1) as f64).round() as usize;
    sorted[k.min(sorted.len() - 1)]
}

fn mib(bytes: usize) -> f64 {
    bytes as f64 / (1024.0 * 1024.0)
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let service = format!("bench-{}", std::process::id());
    let endpoint = std::sync::Arc::new(Endpoint::new()?);
    endpoint.create_service(&service, |request: &[u8]| -> Result<Vec<u8>, String> {
        Ok(request.to_vec())
    })?;
    let spin = tokio::spawn({
        let endpoint = endpoint.clone();
        async move {
            let _ = endpoint.spin().await;
        }
    });

    let caller = ServiceCaller::new(&service)?;

    // Warm up cold-start effects before measuring.
    for _ in 0..3 {
        caller.call(&vec![0u8; 1024]).await?;
    }

    println!("service: {service}");
    println!("iters:   {}", args.iters);
    for &size in &args.sizes {
        let payload = vec![0x6cu8; size];
        let mut latencies = Vec::with_capacity(args.iters);
        for _ in 0..args.iters {
            let start = Instant::now();
            let reply = caller.call(&payload).await?;
            latencies.push(start.elapsed());
            assert_eq!(reply.len(), size);
        }
        latencies.sort();

        let total: Duration = latencies.iter().sum();
        let avg = total / args.iters as u32;
        println!(
            "  {:>8.2} MiB | avg={:>7.2?} | p50={:>7.2?} | p95={:>7.2?} | p99={:>7.2?} | ~{:.0} MiB/s",
            mib(size),
            avg,
            percentile(&latencies, 50.0),
            percentile(&latencies, 95.0),
            percentile(&latencies, 99.0),
            mib(size) / avg.as_secs_f64(),
        );
    }

    spin.abort();
    endpoint.remove_service(&service)?;
    Ok(())
}
