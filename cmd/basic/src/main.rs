//! Basic noblock example
//!
//! Spawns more tasks than there are fibers, interleaves them with yields
//! and sleeps, and shows nested timeouts.
//!
//! # Environment Variables
//!
//! - `NB_POOL_SIZE=2` - fibers in the pool (default here: 3)
//! - `NB_FAIR_HANDOFF=1` - defer backlog pickup by one pass
//! - `NB_LOG_LEVEL=debug` - log level (off, error, warn, info, debug, trace)
//! - `NB_FLUSH_EPRINT=1` - flush debug output immediately

use std::cell::Cell;
use std::rc::Rc;
use std::time::{Duration, Instant};

use noblock::{env_get, kdebug, kinfo, NbResult, Runtime, RuntimeConfig, Spawned, TimeoutKind};

// NB_LOG_LEVEL=debug cargo run -p noblock-basic
fn main() -> NbResult<()> {
    println!("=== noblock Basic Example ===\n");

    let config = RuntimeConfig::from_env().pool_size(env_get("NB_POOL_SIZE", 3));
    config.print();
    let runtime = Runtime::new(config)?;

    let completed = Rc::new(Cell::new(0usize));
    let start = Instant::now();

    runtime.block_on({
        let completed = completed.clone();
        move |ctx| async move {
            kinfo!("Spawning tasks...");

            for i in 1..=5 {
                let c = completed.clone();
                let spawned = ctx.spawn(move |ctx| async move {
                    kdebug!("[task {}] started on fiber {}", i, ctx.id());
                    for j in 0..3 {
                        kdebug!("[task {}] iteration {}", i, j);
                        ctx.yield_now().await?;
                    }
                    ctx.sleep(Duration::from_millis(10 * i)).await?;
                    kdebug!("[task {}] finished", i);
                    c.set(c.get() + 1);
                    Ok(())
                });
                match spawned {
                    Spawned::Started(fiber) => println!("task {} started on fiber {}", i, fiber),
                    Spawned::Queued { position } => println!("task {} queued at {}", i, position),
                    Spawned::Rejected => println!("task {} rejected", i),
                }
            }

            // An outer deadline interrupts the inner block's sleep
            let outcome = ctx
                .with_timeout(Duration::from_millis(20), TimeoutKind::GENERIC, async {
                    ctx.with_timeout(Duration::from_millis(200), TimeoutKind::READ, async {
                        ctx.sleep(Duration::from_secs(1)).await
                    })
                    .await
                })
                .await;
            println!("nested timeout: {:?}", outcome);
            println!("active timeouts after: {}", ctx.active_timeouts());
            Ok(())
        }
    })?;

    let stats = runtime.stats();
    println!("\n=== Results ===");
    println!("Completed: {}/5", completed.get());
    println!("Pool: {:?}", stats);
    println!("Loop: {:?}", runtime.event_loop().stats());
    println!("Timers: {:?}", runtime.event_loop().timer_stats());
    println!("Elapsed: {:?}", start.elapsed());
    println!("\n=== Done ===");
    Ok(())
}
