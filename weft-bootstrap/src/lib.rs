//! Blocking, synchronous bootstrap tree: handshake, port-range rendezvous,
//! binomial topology, and tree collectives. Spec §4.8 and §5: this runs to
//! completion before any reactor starts, on plain blocking sockets.
//!
//! Grounded on `examples/original_source/cobo-testers/cobo-orig/cobo.c`
//! (`cobo_open_tree`, `cobo_compute_children`, `cobo_bcast_tree`,
//! `cobo_allreduce_max_int_tree`, `cobo_gather_tree`, `cobo_scatter_tree`).

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream, ToSocketAddrs};
use std::time::{Duration, Instant};

use tracing::{debug, error, trace};
use weft_base::{err, fatal, not_found, proto, Config, ErrorKind, Result};
use weft_hostlist::HostList;

mod topology;
pub use topology::compute_children;

/// Fixed at compile time, exchanged on every handshake; distinguishes this
/// protocol's connections from anything else that might land on the port.
const SERVICE_ID: u32 = 0x7765_6674;
/// The server's half of the handshake reply, read back by the client.
const ACCEPT_ID: u32 = 0x6163_6365;
/// Final ack written by the client once it has verified the server's reply.
const ACK: u32 = 0x6f6b_6179;

fn write_u32(stream: &mut TcpStream, v: u32) -> Result<()> {
    stream.write_all(&v.to_be_bytes())?;
    Ok(())
}

fn read_u32(stream: &mut TcpStream) -> Result<u32> {
    let mut buf = [0u8; 4];
    stream.read_exact(&mut buf)?;
    Ok(u32::from_be_bytes(buf))
}

/// Client side of the handshake: write service-id, session-id; read back
/// service-id, accept-id and verify; write a final ack.
fn client_handshake(stream: &mut TcpStream, session_id: u32) -> Result<()> {
    write_u32(stream, SERVICE_ID)?;
    write_u32(stream, session_id)?;
    let recv_service = read_u32(stream)?;
    let recv_accept = read_u32(stream)?;
    if recv_service != SERVICE_ID || recv_accept != ACCEPT_ID {
        return Err(proto("bootstrap handshake: bad service/accept id from server"));
    }
    write_u32(stream, ACK)?;
    Ok(())
}

/// Server side of the handshake: read service-id, session-id and verify;
/// write back service-id, accept-id; read the final ack. Per spec scenario
/// 7, a session-id mismatch returns an error before any rank is assigned —
/// the caller closes the connection without sending the hostlist.
fn server_handshake(stream: &mut TcpStream, session_id: u32) -> Result<()> {
    let recv_service = read_u32(stream)?;
    let recv_session = read_u32(stream)?;
    if recv_service != SERVICE_ID || recv_session != session_id {
        return Err(proto("bootstrap handshake: session id mismatch"));
    }
    write_u32(stream, SERVICE_ID)?;
    write_u32(stream, ACCEPT_ID)?;
    let ack = read_u32(stream)?;
    if ack != ACK {
        return Err(proto("bootstrap handshake: missing ack"));
    }
    Ok(())
}

fn send_identity(stream: &mut TcpStream, rank: u32, nprocs: u32, hostlist: &str) -> Result<()> {
    write_u32(stream, rank)?;
    write_u32(stream, nprocs)?;
    let bytes = hostlist.as_bytes();
    write_u32(stream, bytes.len() as u32)?;
    stream.write_all(bytes)?;
    Ok(())
}

fn recv_identity(stream: &mut TcpStream) -> Result<(u32, u32, HostList)> {
    let rank = read_u32(stream)?;
    let nprocs = read_u32(stream)?;
    let len = read_u32(stream)? as usize;
    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf)?;
    let text = String::from_utf8(buf).map_err(|e| fatal(e.to_string()))?;
    let hostlist = HostList::parse(&text)?;
    Ok((rank, nprocs, hostlist))
}

fn listen_first_bindable(ports: &[u16]) -> Result<(TcpListener, u16)> {
    for &port in ports {
        match TcpListener::bind(("0.0.0.0", port)) {
            Ok(listener) => return Ok((listener, port)),
            Err(e) => {
                trace!(target: "weft", port, error = %e, "bootstrap port unavailable");
                continue;
            }
        }
    }
    Err(not_found("no bindable port in configured range"))
}

/// Scans `ports` on `host`, dialing each with an exponentially backed-off
/// connect/reply timeout, until the handshake succeeds or `cfg`'s overall
/// time limit expires.
fn connect_with_backoff(host: &str, ports: &[u16], session_id: u32, cfg: &Config) -> Result<TcpStream> {
    let deadline = Instant::now() + Duration::from_secs(cfg.connect_timelimit_s);
    let mut connect_timeout = Duration::from_millis(cfg.connect_timeout_ms);
    let mut reply_timeout = Duration::from_millis(cfg.connect_timeout_ms);

    loop {
        for &port in ports {
            if Instant::now() >= deadline {
                return Err(err(ErrorKind::TimedOut, "bootstrap connect time limit exceeded"));
            }
            let Some(addr) = (host, port).to_socket_addrs().ok().and_then(|mut a| a.next()) else {
                continue;
            };
            let Ok(mut stream) = TcpStream::connect_timeout(&addr, connect_timeout) else {
                continue;
            };
            if stream.set_read_timeout(Some(reply_timeout)).is_err() {
                continue;
            }
            if client_handshake(&mut stream, session_id).is_ok() {
                let _ = stream.set_read_timeout(None);
                return Ok(stream);
            }
        }
        if Instant::now() >= deadline {
            return Err(err(ErrorKind::TimedOut, "bootstrap connect time limit exceeded"));
        }
        std::thread::sleep(Duration::from_millis(cfg.connect_sleep_ms));
        connect_timeout *= cfg.connect_backoff;
        reply_timeout *= cfg.connect_backoff;
    }
}

/// A read or write failure on a tree edge is fatal per spec §4.8: log and
/// exit the process rather than propagate, matching `cobo_error(...);
/// exit(1);` at every such call site in the original.
fn edge_io<T>(what: &'static str, res: std::io::Result<T>) -> T {
    match res {
        Ok(v) => v,
        Err(e) => {
            error!(target: "weft", what, error = %e, "bootstrap tree edge failed, exiting");
            std::process::exit(1);
        }
    }
}

/// A participant's place in the bootstrap tree: its rank, the shared
/// hostlist, and open sockets to its parent (if any) and children.
pub struct BootstrapTree {
    pub me: u32,
    pub nprocs: u32,
    pub hostlist: HostList,
    parent: Option<TcpStream>,
    children: Vec<TcpStream>,
    children_incl: Vec<u32>,
}

impl BootstrapTree {
    /// Joins the tree: listens on the first bindable port in `ports`,
    /// accepts a single inbound connection (the parent in the tree, or —
    /// for rank 0 — the external coordinator that dials host 0 per spec
    /// §4.8), serves the handshake, and learns this process's rank, the
    /// total process count, and the hostlist. Then connects out to this
    /// rank's own children, per the binomial topology.
    pub fn join(session_id: u32, ports: &[u16], cfg: &Config) -> Result<BootstrapTree> {
        let (listener, port) = listen_first_bindable(ports)?;
        debug!(target: "weft", port, "bootstrap tree listening");
        let (mut stream, peer) = listener.accept()?;
        trace!(target: "weft", %peer, "bootstrap tree accepted connection");
        server_handshake(&mut stream, session_id)?;
        let (me, nprocs, hostlist) = recv_identity(&mut stream)?;
        debug!(target: "weft", me, nprocs, "bootstrap tree identity assigned");

        let mut tree =
            BootstrapTree { me, nprocs, hostlist, parent: Some(stream), children: Vec::new(), children_incl: Vec::new() };
        tree.connect_children(session_id, ports, cfg)?;
        Ok(tree)
    }

    fn connect_children(&mut self, session_id: u32, ports: &[u16], cfg: &Config) -> Result<()> {
        let (_parent, children) = compute_children(self.me, self.nprocs);
        let hostlist_str = self.hostlist.to_compact_string();
        for (child_rank, subtree_size) in children {
            let host = self
                .hostlist
                .nth(child_rank as u64)
                .ok_or_else(|| not_found(format!("no hostname for rank {child_rank}")))?;
            let mut stream = connect_with_backoff(&host, ports, session_id, cfg)?;
            send_identity(&mut stream, child_rank, self.nprocs, &hostlist_str)?;
            debug!(target: "weft", child_rank, %host, "bootstrap tree child connected");
            self.children.push(stream);
            self.children_incl.push(subtree_size);
        }
        Ok(())
    }

    /// Number of descendants of this node, including itself.
    pub fn subtree_size(&self) -> u32 {
        self.children_incl.iter().sum::<u32>() + 1
    }

    /// Broadcasts `buf` (read from the parent on non-root ranks) to every
    /// child. Root's `buf` content is the value broadcast.
    pub fn broadcast(&mut self, root: u32, buf: &mut [u8]) {
        debug_assert_eq!(root, 0, "only rank 0 roots a collective, per spec §4.8");
        if self.me != 0 {
            let parent = self.parent.as_mut().expect("non-root rank always has a parent");
            edge_io("broadcast read from parent", parent.read_exact(buf));
        }
        for child in &mut self.children {
            edge_io("broadcast write to child", child.write_all(buf));
        }
    }

    /// Reduces `sendval` to its maximum across all ranks, post-order toward
    /// rank 0, then broadcasts the result back down.
    pub fn allreduce_max_int(&mut self, sendval: i32) -> i32 {
        let mut max_val = sendval;
        for child in self.children.iter_mut().rev() {
            let mut buf = [0u8; 4];
            edge_io("allreduce read from child", child.read_exact(&mut buf));
            max_val = max_val.max(i32::from_be_bytes(buf));
        }
        if self.me != 0 {
            let parent = self.parent.as_mut().expect("non-root rank always has a parent");
            edge_io("allreduce write to parent", parent.write_all(&max_val.to_be_bytes()));
        }
        let mut buf = max_val.to_be_bytes();
        self.broadcast(0, &mut buf);
        i32::from_be_bytes(buf)
    }

    /// Concatenates `senddata` from every rank, in rank order, into a
    /// single buffer. Only rank 0's return value is meaningful; other
    /// ranks receive an empty vector (they forward their assembled subtree
    /// buffer to their parent and keep nothing locally).
    pub fn gather(&mut self, root: u32, senddata: &[u8]) -> Vec<u8> {
        debug_assert_eq!(root, 0, "only rank 0 roots a collective, per spec §4.8");
        let sendcount = senddata.len();
        let bigcount = sendcount * self.subtree_size() as usize;
        let mut bigbuf = vec![0u8; bigcount];
        bigbuf[..sendcount].copy_from_slice(senddata);

        let mut offset = sendcount;
        for (child, incl) in self.children.iter_mut().zip(self.children_incl.iter()).rev() {
            let span = sendcount * (*incl as usize);
            edge_io("gather read from child", child.read_exact(&mut bigbuf[offset..offset + span]));
            offset += span;
        }

        if self.me != 0 {
            let parent = self.parent.as_mut().expect("non-root rank always has a parent");
            edge_io("gather write to parent", parent.write_all(&bigbuf));
            Vec::new()
        } else {
            bigbuf
        }
    }

    /// Inverse of [`gather`](Self::gather): rank 0 supplies `bigcount =
    /// sendcount * nprocs` bytes in `senddata`; every rank receives its
    /// `sendcount`-byte chunk back.
    ///
    /// Preserves the original's order exactly: each child's chunk is
    /// forwarded before this rank's own chunk is copied out below. Spec §9
    /// flags this as an open question — a latent bug if a caller aliased
    /// the send and receive buffers — but is not reachable here since the
    /// parent/forward buffer and the returned chunk are distinct
    /// allocations.
    pub fn scatter(&mut self, root: u32, senddata: Option<&[u8]>, sendcount: usize) -> Vec<u8> {
        debug_assert_eq!(root, 0, "only rank 0 roots a collective, per spec §4.8");
        let bigcount = sendcount * self.subtree_size() as usize;
        let bigbuf = if self.me != 0 {
            let mut buf = vec![0u8; bigcount];
            let parent = self.parent.as_mut().expect("non-root rank always has a parent");
            edge_io("scatter read from parent", parent.read_exact(&mut buf));
            buf
        } else {
            let data = senddata.expect("root must supply senddata for scatter");
            debug_assert_eq!(data.len(), bigcount, "senddata must cover every rank");
            data.to_vec()
        };

        let mut offset = sendcount;
        for (child, incl) in self.children.iter_mut().zip(self.children_incl.iter()).rev() {
            let span = sendcount * (*incl as usize);
            edge_io("scatter write to child", child.write_all(&bigbuf[offset..offset + span]));
            offset += span;
        }

        bigbuf[..sendcount].to_vec()
    }

    /// Gather followed by broadcast: every rank ends up with the full
    /// concatenated buffer.
    pub fn allgather(&mut self, senddata: &[u8]) -> Vec<u8> {
        let sendcount = senddata.len();
        let gathered = self.gather(0, senddata);
        let total = sendcount * self.nprocs as usize;
        let mut buf = if self.me == 0 { gathered } else { vec![0u8; total] };
        self.broadcast(0, &mut buf);
        buf
    }

    /// Gathers one variable-length string per rank: first computes the
    /// longest (via `allreduce_max_int`), pads every string to that length,
    /// allgathers, then splits back into per-rank strings at the first NUL.
    pub fn allgather_strings(&mut self, mystr: &str) -> Vec<String> {
        let mylen = mystr.len() as i32 + 1;
        let maxlen = self.allreduce_max_int(mylen).max(1) as usize;

        let mut padded = vec![0u8; maxlen];
        padded[..mystr.len()].copy_from_slice(mystr.as_bytes());

        let all = self.allgather(&padded);
        all.chunks(maxlen)
            .map(|chunk| {
                let end = chunk.iter().position(|&b| b == 0).unwrap_or(chunk.len());
                String::from_utf8_lossy(&chunk[..end]).into_owned()
            })
            .collect()
    }

    /// An allreduce_max_int of 1, discarded; synchronizes all ranks.
    pub fn barrier(&mut self) {
        self.allreduce_max_int(1);
    }
}
