//! UDP socket pool and inbound routing.
//!
//! BMC fleets get large; one socket per session would burn a file handle
//! each. The reactor shares sockets between sessions (64 to a socket) and
//! routes inbound datagrams to the session registered for the source
//! address. Every session holds an `Arc<Reactor>`; a process-wide default
//! is available via [`Reactor::shared`].

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, OnceLock};

use tokio::net::UdpSocket;
use tokio::sync::mpsc;

/// No more than this many sessions share one UDP socket.
pub const MAX_BMCS_PER_SOCKET: usize = 64;

type RouteMap = Arc<Mutex<HashMap<SocketAddr, mpsc::UnboundedSender<Vec<u8>>>>>;

struct Pool {
    socket: Arc<UdpSocket>,
    routes: RouteMap,
    v6: bool,
}

/// Owns the socket pool and the per-socket read tasks.
pub struct Reactor {
    pools: Mutex<Vec<Pool>>,
}

/// A session's registration: the socket to transmit on and the stream of
/// datagrams arriving from its BMC. Dropping it unroutes the peer.
#[derive(Debug)]
pub struct Registration {
    /// Shared transmit socket.
    pub socket: Arc<UdpSocket>,
    /// Datagrams from the registered peer, in arrival order.
    pub rx: mpsc::UnboundedReceiver<Vec<u8>>,
    routes: RouteMap,
    peer: SocketAddr,
}

impl Drop for Registration {
    fn drop(&mut self) {
        if let Ok(mut routes) = self.routes.lock() {
            routes.remove(&self.peer);
        }
    }
}

impl Reactor {
    /// A reactor with no sockets yet; they are created on demand.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            pools: Mutex::new(Vec::new()),
        })
    }

    /// The process-wide reactor most sessions use.
    pub fn shared() -> Arc<Self> {
        static SHARED: OnceLock<Arc<Reactor>> = OnceLock::new();
        SHARED.get_or_init(Reactor::new).clone()
    }

    /// Register a BMC address, reusing a pooled socket of the matching
    /// address family when one has room.
    pub async fn register(&self, peer: SocketAddr) -> std::io::Result<Registration> {
        let want_v6 = peer.is_ipv6();

        // Fast path: an existing socket with capacity and no route for
        // this peer yet.
        {
            let pools = self.pools.lock().expect("reactor lock");
            for pool in pools.iter() {
                if pool.v6 != want_v6 {
                    continue;
                }
                let mut routes = pool.routes.lock().expect("route lock");
                if routes.len() >= MAX_BMCS_PER_SOCKET || routes.contains_key(&peer) {
                    continue;
                }
                let (tx, rx) = mpsc::unbounded_channel();
                routes.insert(peer, tx);
                return Ok(Registration {
                    socket: pool.socket.clone(),
                    rx,
                    routes: pool.routes.clone(),
                    peer,
                });
            }
        }

        let bind_addr = if want_v6 { "[::]:0" } else { "0.0.0.0:0" };
        let socket = Arc::new(UdpSocket::bind(bind_addr).await?);
        let routes: RouteMap = Arc::new(Mutex::new(HashMap::new()));
        let (tx, rx) = mpsc::unbounded_channel();
        routes.lock().expect("route lock").insert(peer, tx);

        tokio::spawn(read_loop(socket.clone(), routes.clone()));

        let registration = Registration {
            socket: socket.clone(),
            rx,
            routes: routes.clone(),
            peer,
        };
        self.pools
            .lock()
            .expect("reactor lock")
            .push(Pool { socket, routes, v6: want_v6 });
        Ok(registration)
    }
}

async fn read_loop(socket: Arc<UdpSocket>, routes: RouteMap) {
    let mut buf = vec![0u8; 3000];
    loop {
        let (len, from) = match socket.recv_from(&mut buf).await {
            Ok(r) => r,
            Err(e) => {
                log::warn!("[bmclink] socket receive failed: {e}");
                continue;
            }
        };
        let tx = routes.lock().expect("route lock").get(&from).cloned();
        match tx {
            // A closed receiver means the session went away between the
            // lookup and the send; nothing to do.
            Some(tx) => drop(tx.send(buf[..len].to_vec())),
            None => log::debug!("[bmclink] dropping datagram from unknown peer {from}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn routes_by_source_address() {
        let reactor = Reactor::new();
        let bmc = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let peer = bmc.local_addr().unwrap();

        let mut reg = reactor.register(peer).await.unwrap();
        let local = reg.socket.local_addr().unwrap();

        bmc.send_to(b"hello", local).await.unwrap();
        let got = reg.rx.recv().await.unwrap();
        assert_eq!(got, b"hello");
    }

    #[tokio::test]
    async fn sessions_share_a_socket() {
        let reactor = Reactor::new();
        let a = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let b = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        let ra = reactor.register(a.local_addr().unwrap()).await.unwrap();
        let rb = reactor.register(b.local_addr().unwrap()).await.unwrap();
        assert_eq!(
            ra.socket.local_addr().unwrap(),
            rb.socket.local_addr().unwrap()
        );
    }

    #[tokio::test]
    async fn dropping_registration_unroutes() {
        let reactor = Reactor::new();
        let bmc = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let peer = bmc.local_addr().unwrap();

        let reg = reactor.register(peer).await.unwrap();
        drop(reg);
        // The address can register again.
        let again = reactor.register(peer).await.unwrap();
        drop(again);
    }
}
