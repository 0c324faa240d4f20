//! noblock Echo Server
//!
//! Single-threaded TCP echo server: one fiber accepts, every connection
//! gets its own fiber from the pool. Connections beyond the pool size wait
//! in the backlog until a fiber frees up.
//!
//! Usage:
//!     cargo build --release -p noblock-echo
//!     ./target/release/noblock-echo [port]
//!
//! Test with:
//!     echo "hello" | nc localhost 9999
//!
//! # Environment Variables
//!
//! - `ECHO_PORT=9999` - listen port (overridden by the first argument)
//! - `ECHO_IDLE_MS=30000` - close connections idle for this long (0 = never)
//! - `ECHO_MAX_CONNS=0` - stop after this many connections (0 = unlimited)
//! - `NB_POOL_SIZE`, `NB_LOG_LEVEL`, ... - runtime settings

use std::net::{Ipv4Addr, SocketAddrV4};
use std::time::Duration;

use noblock::io::{NbBufReader, NbListener, NbStream};
use noblock::{env_get, kinfo, kwarn, FiberCtx, NbResult, Runtime, RuntimeConfig};

const BUF_SIZE: usize = 4096;

async fn serve(ctx: FiberCtx, stream: NbStream, idle: Option<Duration>) -> NbResult<()> {
    let mut reader = NbBufReader::with_capacity(BUF_SIZE, stream);
    reader.set_read_timeout(idle);
    let mut buf = [0u8; BUF_SIZE];
    loop {
        let n = match reader.read(&ctx, &mut buf).await {
            Ok(0) => return Ok(()),
            Ok(n) => n,
            Err(e) if e.is_timeout() => {
                kinfo!("fd {}: idle, closing", reader.get_ref().fd());
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        reader.get_ref().write_all(&ctx, &buf[..n]).await?;
    }
}

fn main() -> NbResult<()> {
    let port: u16 = std::env::args()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .unwrap_or_else(|| env_get("ECHO_PORT", 9999));
    let idle = match env_get("ECHO_IDLE_MS", 30_000u64) {
        0 => None,
        ms => Some(Duration::from_millis(ms)),
    };
    let max_conns: usize = env_get("ECHO_MAX_CONNS", 0);

    let runtime = Runtime::new(RuntimeConfig::from_env())?;
    runtime.on_task_failure(|failure| kwarn!("connection task failed: {}", failure));

    runtime.block_on(move |ctx| async move {
        let listener = NbListener::bind(&ctx, SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port))?;
        println!("noblock echo listening on {}", listener.local_addr()?);

        let mut accepted = 0usize;
        while max_conns == 0 || accepted < max_conns {
            let (stream, peer) = listener.accept(&ctx).await?;
            accepted += 1;
            kinfo!("accepted {} (fd {})", peer, stream.fd());
            let spawned = ctx.spawn(move |ctx| serve(ctx, stream, idle));
            if spawned.is_queued() {
                kinfo!("pool saturated, connection from {} queued", peer);
            }
        }
        Ok(())
    })?;

    println!("Pool: {:?}", runtime.stats());
    Ok(())
}
