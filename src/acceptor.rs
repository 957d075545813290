// Copyright 2022 Ryan Seipp
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Bridges the listening socket into the worker reactor pool.

use std::io::{self, ErrorKind};
use std::sync::Arc;

use mio::Interest;
use rand::Rng;

use crate::connection::{Connection, Handler};
use crate::looper::Looper;
use crate::net::socket::Socket;

/// Owns the listening connection on the listener reactor. On readiness it
/// accepts pending clients and hands each off to a worker reactor chosen
/// uniformly at random: uniform in the long run, not strictly round-robin.
#[derive(Debug)]
pub struct Acceptor {
    reactors: Vec<Arc<Looper>>,
}

impl Acceptor {
    /// Parks `listen_socket` as a connection on the listener reactor and
    /// wires the accept path: base accept logic, then the optional embedder
    /// `on_accept` with the listener connection. Each accepted client gets
    /// `on_handle` wrapped with a timer-refresh pre-step, so handlers never
    /// need to know about timers.
    pub fn new(
        listener: &Arc<Looper>,
        reactors: Vec<Arc<Looper>>,
        listen_socket: Socket,
        on_accept: Option<Handler>,
        on_handle: Handler,
    ) -> io::Result<Self> {
        let mut conn = Box::new(Connection::new(listen_socket));
        conn.set_interest(Interest::READABLE);

        let accept_reactors = reactors.clone();
        conn.set_handler(Arc::new(move |server_conn: &mut Connection| {
            base_accept(server_conn, &accept_reactors, &on_handle);
            if let Some(on_accept) = &on_accept {
                on_accept(server_conn);
            }
        }));
        listener.add_acceptor(conn)?;

        Ok(Self { reactors })
    }

    /// Number of worker reactors accepting dispatches.
    pub fn worker_count(&self) -> usize {
        self.reactors.len()
    }
}

/// Accepts until would-block. Accept failures are warnings; the listener
/// keeps running.
fn base_accept(server_conn: &mut Connection, reactors: &[Arc<Looper>], on_handle: &Handler) {
    loop {
        match server_conn.socket().accept() {
            Ok((socket, peer)) => {
                let mut conn = Box::new(Connection::new(socket));
                conn.set_interest(Interest::READABLE);

                let idx = rand::thread_rng().gen_range(0..reactors.len());
                let reactor = &reactors[idx];
                let refresh_target = Arc::downgrade(reactor);
                let user_handle = Arc::clone(on_handle);
                conn.set_handler(Arc::new(move |client_conn: &mut Connection| {
                    if let Some(looper) = refresh_target.upgrade() {
                        looper.refresh_connection(client_conn.fd());
                    }
                    user_handle(client_conn);
                }));

                log::info!("new client {peer} fd={} maps to reactor {idx}", conn.fd());
                if let Err(err) = reactor.add_connection(conn) {
                    log::warn!("failed to register accepted connection: {err}");
                }
            }
            Err(ref err) if err.kind() == ErrorKind::WouldBlock => break,
            Err(ref err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => {
                log::warn!("accept failed: {err}");
                break;
            }
        }
    }
}
