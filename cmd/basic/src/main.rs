//! Basic gctx example
//!
//! Spawns a few contexts that yield, sleep and meet on a latch, then
//! prints the reactor and descriptor statistics.
//!
//! # Environment Variables
//!
//! - `GCTX_FLUSH_EPRINT=1` - Flush debug output immediately (useful for crash debugging)
//! - `GCTX_LOG_LEVEL=debug` - Set log level (off, error, warn, info, debug, trace)

use gctx::{ios, kdebug, kinfo, this_ctx, Context, CtxResult, Latch, Runtime, SharedMutex};
use std::cell::Cell;
use std::rc::Rc;
use std::time::Duration;

// GCTX_LOG_LEVEL=debug GCTX_FLUSH_EPRINT=1 cargo run -p gctx-basic
fn main() -> CtxResult<()> {
    println!("=== gctx Basic Example ===\n");

    let runtime = Runtime::new()?;

    let completed = runtime.block_on(|| -> CtxResult<usize> {
        kinfo!("Spawning contexts...");
        let latch = Rc::new(Latch::new(3));
        let lock = Rc::new(SharedMutex::new());
        let completed = Rc::new(Cell::new(0));

        let mut ctxs = Vec::new();
        for i in 1..=3 {
            let (latch, lock, done) = (latch.clone(), lock.clone(), completed.clone());
            let ctx = Context::new(format!("worker-{}", i), move || -> CtxResult<()> {
                kdebug!("[{}] started", i);
                for j in 0..3 {
                    kdebug!("[{}] iteration {}", i, j);
                    this_ctx::yield_now()?;
                }
                {
                    let _read = lock.read()?;
                    this_ctx::sleep(Duration::from_millis(5 * i))?;
                }
                latch.count_down_and_wait()?;
                kdebug!("[{}] finished", i);
                done.set(done.get() + 1);
                Ok(())
            })?;
            println!("Spawned context {} (ID={})", i, ctx.id());
            ctxs.push(ctx);
        }

        for ctx in &ctxs {
            ctx.join()?;
        }
        Ok(completed.get())
    })??;

    kinfo!("{} context(s) completed", completed);
    println!("\nReactor: {:?}", runtime.stats());
    for desc in ios::descriptors() {
        println!("  {}", desc);
    }

    println!("\n=== Example Complete ===");
    Ok(())
}
