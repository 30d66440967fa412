//! Stream frames from a server to a client thread over the in-process loopback
//!
//! Run with: RUST_LOG=debug cargo run --package memcon-core --example loopback

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use memcon_core::loopback;
use memcon_core::{
    ClientConnection, LocalMemoryProvider, MemoryProvider, ReceiverState, Server, ServerConfig, ServerMessage,
    SideChannel,
};
use tracing_subscriber::EnvFilter;

const FRAMES: u32 = 32;

fn main() -> memcon_core::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let provider: Arc<dyn MemoryProvider> = Arc::new(LocalMemoryProvider::new());
    let config = ServerConfig {
        number_of_slots: 8,
        slot_content_size: 256,
        ..ServerConfig::default()
    };
    let mut server = Server::new(&config, provider.clone())?;

    let mut endpoint = None;
    let id = server.add_receiver("default", |events| {
        let (side, end) = loopback::pair(events);
        endpoint = Some(end);
        Box::new(side) as Box<dyn SideChannel>
    })?;
    let Some(endpoint) = endpoint else {
        return Ok(());
    };

    let client = thread::spawn(move || -> memcon_core::Result<u32> {
        let Some(ServerMessage::ConnectionRequest(request)) = endpoint.recv_timeout(Duration::from_secs(1)) else {
            return Ok(0);
        };
        let mut client = ClientConnection::accept(request, provider, Box::new(endpoint.channel()))?;
        client.start_listening()?;

        let mut received = 0;
        while received < FRAMES {
            match client.receive()? {
                Some(index) => {
                    let content = client.slot(index)?.content();
                    let end = content.iter().position(|b| *b == 0).unwrap_or(content.len());
                    println!("slot {index}: {}", String::from_utf8_lossy(&content[..end]));
                    client.release(index)?;
                    received += 1;
                }
                None => {
                    if let Some(message) = endpoint.recv_timeout(Duration::from_millis(10)) {
                        client.handle_message(message)?;
                    }
                }
            }
        }
        client.shutdown()?;
        Ok(received)
    });

    let mut sent = 0;
    while server.number_of_receivers() > 0 {
        server.process_events();
        server.reclaim_slots();
        if sent < FRAMES && server.receiver_state(id) == Some(ReceiverState::Connected) {
            if let Some(index) = server.acquire_slot() {
                let mut frame = format!("frame {sent}").into_bytes();
                frame.push(0);
                server.slot_mut(index)?.write(&frame)?;
                server.send_slot(index)?;
                sent += 1;
                continue;
            }
        }
        thread::sleep(Duration::from_millis(1));
    }

    match client.join() {
        Ok(received) => println!("client received {} frames", received?),
        Err(_) => eprintln!("client thread panicked"),
    }
    Ok(())
}
