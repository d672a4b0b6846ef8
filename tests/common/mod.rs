//! Shared test fixtures: an in-memory half-duplex bus.

use std::sync::Arc;

use osdp_protocol::Channel;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::Mutex;

/// Build an in-memory bus connecting one CP endpoint to `pd_count` PD
/// endpoints.
///
/// CP writes are broadcast to every PD (as on a shared RS-485 pair); PD
/// writes are forwarded to the CP. Endpoints whose device has stopped are
/// dropped from the broadcast set.
pub fn bus(pd_count: usize) -> (Box<dyn Channel>, Vec<Box<dyn Channel>>) {
    let (cp_side, cp_hub) = tokio::io::duplex(4096);
    let (mut cp_hub_read, cp_hub_write) = tokio::io::split(cp_hub);
    let cp_hub_write = Arc::new(Mutex::new(cp_hub_write));

    let mut pd_sides: Vec<Box<dyn Channel>> = Vec::with_capacity(pd_count);
    let mut pd_writers = Vec::with_capacity(pd_count);
    for _ in 0..pd_count {
        let (pd_side, pd_hub) = tokio::io::duplex(4096);
        let (mut pd_hub_read, pd_hub_write) = tokio::io::split(pd_hub);
        pd_sides.push(Box::new(pd_side));
        pd_writers.push(pd_hub_write);

        let to_cp = cp_hub_write.clone();
        tokio::spawn(async move {
            let mut buf = [0u8; 1024];
            loop {
                match pd_hub_read.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if to_cp.lock().await.write_all(&buf[..n]).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });
    }

    tokio::spawn(async move {
        let mut writers: Vec<_> = pd_writers.into_iter().map(Some).collect();
        let mut buf = [0u8; 1024];
        loop {
            match cp_hub_read.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    for slot in writers.iter_mut() {
                        if let Some(writer) = slot {
                            if writer.write_all(&buf[..n]).await.is_err() {
                                *slot = None;
                            }
                        }
                    }
                }
            }
        }
    });

    (Box::new(cp_side), pd_sides)
}
