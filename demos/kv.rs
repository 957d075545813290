//! Newline-framed key-value store demo over the shared content cache.
//!
//! Protocol: `SET <key> <value>\n` answers `OK` or `ERR`; `GET <key>\n`
//! answers the value or `(nil)`. Run with `cargo run --example kv`.

use seine::{NetAddress, Server};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let addr: NetAddress = "127.0.0.1:20081".parse()?;
    let server = Server::new(addr)?;
    let cache = server.shared_cache();

    server
        .on_handle(move |conn| {
            let (_, closed) = conn.recv();
            while let Some(frame) = conn.find_and_pop_until(b"\n") {
                let line = String::from_utf8_lossy(&frame);
                let mut parts = line.split_whitespace();
                match (parts.next(), parts.next()) {
                    (Some("GET"), Some(key)) => {
                        let mut value = Vec::new();
                        if cache.try_load(key, &mut value) {
                            conn.write_to_write_buffer(value);
                            conn.write_to_write_buffer("\n");
                        } else {
                            conn.write_to_write_buffer("(nil)\n");
                        }
                    }
                    (Some("SET"), Some(key)) => {
                        let value = parts.collect::<Vec<_>>().join(" ");
                        let stored = cache.try_insert(key, value.as_bytes());
                        conn.write_to_write_buffer(if stored { "OK\n" } else { "ERR\n" });
                    }
                    _ => conn.write_to_write_buffer("ERR\n"),
                }
            }
            if conn.write_buffer_len() > 0 && conn.send().is_err() {
                conn.request_close();
                return;
            }
            if closed {
                conn.request_close();
            }
        })
        .begin()?;
    Ok(())
}
