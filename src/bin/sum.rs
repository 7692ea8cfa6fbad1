//! Reproducible summation over a file of doubles.
//!
//! ```bash
//! sum data.psllh 4        # ASCII doubles, one per line, 4 local ranks
//! sum data.binpsllh 8     # raw little-endian f64 stream, 8 local ranks
//! ```
//!
//! The array is distributed evenly across an in-process cluster (remainder
//! elements go to the last ranks) and reduced with the dual-tree kernel;
//! the printed sum is identical for every rank count.

use canopy::{CanopyConfig, DualTreeSummation, MemoryTransport, io};
use std::path::Path;
use std::process::exit;
use std::sync::Arc;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args: Vec<String> = std::env::args().collect();
    if args.len() != 3 {
        eprintln!("Usage: {} <file.psllh|file.binpsllh> <ranks>", args[0]);
        exit(-1);
    }

    let ranks: u32 = match args[2].parse() {
        Ok(k) if k > 0 => k,
        _ => {
            eprintln!("Invalid rank count: {}", args[2]);
            exit(-1);
        }
    };

    let path = Path::new(&args[1]);
    let data = if args[1].ends_with(".psllh") {
        io::read_psllh(path)
    } else if args[1].ends_with(".binpsllh") {
        io::read_binpsllh(path)
    } else {
        eprintln!("File must end with .psllh or .binpsllh");
        exit(-2);
    };
    let data = match data {
        Ok(values) => Arc::new(values),
        Err(e) => {
            eprintln!("{e}");
            exit(-2);
        }
    };

    let n = data.len() as u64;
    println!("Summing {n} summands");
    println!("Cluster size: {ranks}");

    // Even distribution; the remainder lands on the last ranks.
    let per_rank = n / ranks as u64;
    let remainder = n % ranks as u64;
    let mut regions = Vec::with_capacity(ranks as usize);
    let mut start = 0u64;
    for r in 0..ranks as u64 {
        let count = if r >= ranks as u64 - remainder {
            per_rank + 1
        } else {
            per_rank
        };
        regions.push(canopy::Region::new(start, count));
        start += count;
    }

    let mut handles = Vec::with_capacity(ranks as usize);
    for transport in MemoryTransport::cluster(ranks) {
        let data = Arc::clone(&data);
        let regions = regions.clone();
        handles.push(tokio::spawn(async move {
            let rank = canopy::Transport::rank(&transport) as usize;
            let region = regions[rank];
            let mut summation = DualTreeSummation::new(
                Arc::new(transport),
                &regions,
                CanopyConfig::default(),
            )
            .await?;
            summation
                .buffer_mut()
                .copy_from_slice(&data[region.start as usize..region.end() as usize]);
            summation.accumulate().await
        }));
    }

    let mut result = 0.0;
    for handle in handles {
        match handle.await {
            Ok(Ok(sum)) => result = sum,
            Ok(Err(e)) => {
                eprintln!("reduction failed: {e}");
                exit(-2);
            }
            Err(e) => {
                eprintln!("rank task panicked: {e}");
                exit(-2);
            }
        }
    }

    println!("{result:.32}");
}
