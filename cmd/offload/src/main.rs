//! Offload example
//!
//! A context hashes a buffer on the offload threads while a ticker context
//! keeps running on the reactor, then a pool fans out a batch of jobs.
//!
//! # Environment Variables
//!
//! - `GCTX_OLE_THREADS=8` - Offload worker threads
//! - `GCTX_LOG_LEVEL=debug` - Shows offload worker lifecycle

use gctx::ole::{self, Opts};
use gctx::{concurrent_for_each, kinfo, this_ctx, Context, CtxError, CtxResult, Pool, Runtime};
use std::cell::Cell;
use std::rc::Rc;
use std::time::{Duration, Instant};

fn checksum(data: &[u8]) -> u64 {
    data.iter().fold(0xcbf2_9ce4_8422_2325_u64, |h, &b| (h ^ b as u64).wrapping_mul(0x100_0000_01b3))
}

fn main() -> CtxResult<()> {
    println!("=== gctx Offload Example ===\n");

    let runtime = Runtime::new()?;

    runtime.block_on(|| -> CtxResult<()> {
        let ticks = Rc::new(Cell::new(0u32));
        let t = ticks.clone();
        let ticker = Context::new("ticker", move || -> CtxResult<()> {
            loop {
                this_ctx::sleep(Duration::from_millis(1))?;
                t.set(t.get() + 1);
            }
        })?;

        let start = Instant::now();
        let data = vec![7u8; 32 << 20];
        let sum = ole::offload(move || checksum(&data))?;
        println!("checksum {:016x} in {:?}; reactor ticked {} times meanwhile", sum, start.elapsed(), ticks.get());

        let opts = Opts { name: "spin", concurrency: 4, prio: 0 };
        let ids = ole::offload_with(&opts, || std::thread::current().name().map(str::to_owned))?;
        println!("fan-out ran on {:?}", ids);

        drop(ticker);

        let pool = Pool::new("jobs", 4)?;
        let done = Rc::new(Cell::new(0));
        let d = done.clone();
        concurrent_for_each(&pool, 0..16u64, move |n| -> Result<(), CtxError> {
            this_ctx::sleep(Duration::from_millis(n))?;
            d.set(d.get() + 1);
            Ok(())
        })?;
        kinfo!("pool finished {} jobs", done.get());
        Ok(())
    })??;

    println!("\nOffload engine: {:?}", ole::stats());
    println!("\n=== Example Complete ===");
    Ok(())
}
