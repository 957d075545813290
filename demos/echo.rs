//! Echo server demo: whatever arrives on a connection is written straight
//! back. Run with `cargo run --example echo`.

use seine::{NetAddress, Server};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let addr: NetAddress = "127.0.0.1:20080".parse()?;
    let mut config = seine::ServerConfig::new(addr);
    config.inactivity_timeout_ms = 30_000;

    Server::with_config(config)?
        .on_accept(|server_conn| {
            log::info!("echo: accepted on listener fd={}", server_conn.fd());
        })
        .on_handle(|conn| {
            let (read, closed) = conn.recv();
            if read > 0 {
                let payload = conn.read_buffer().to_vec();
                conn.write_to_write_buffer(payload);
                if conn.send().is_err() {
                    conn.request_close();
                    return;
                }
                conn.clear_read_buffer();
            }
            if closed {
                conn.request_close();
            }
        })
        .begin()?;
    Ok(())
}
