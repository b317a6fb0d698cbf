//! Userspace loader for the socket-redirect programs.
//!
//! Kernel contract:
//! - `sock_map` (SOCKHASH, key = socket cookie): populated by the
//!   cgroup-attached `sock_ops` program on connection establishment,
//!   cleaned up by the kernel on close.
//! - `sock_pair_map` (HASH, cookie -> peer cookie): populated here per
//!   splice session, both directions, removed at teardown.
//! - `sock_verdict` (sk_skb stream verdict, attached to `sock_map`):
//!   looks up the sender's peer in the pair map and redirects.
//!
//! The compiled object file is supplied by the deployment via
//! `SOCKMAP_OBJECT_PATH`; its source lives with the deploy artifacts.

use std::fs::File;
use std::os::fd::AsRawFd;
use std::sync::Mutex;

use aya::maps::{HashMap as BpfHashMap, MapData, SockHash};
use aya::programs::{CgroupAttachMode, CgroupSockOps, SkSkb};
use aya::Ebpf;
use thiserror::Error;
use tokio::net::TcpStream;

use super::SocketPair;

/// SO_COOKIE socket option, Linux 4.6+.
const SO_COOKIE: libc::c_int = 57;

#[derive(Debug, Error)]
pub enum SockMapError {
    #[error("failed to load BPF object: {0}")]
    Load(#[from] aya::EbpfError),

    #[error("program error: {0}")]
    Program(#[from] aya::programs::ProgramError),

    #[error("map error: {0}")]
    Map(#[from] aya::maps::MapError),

    #[error("object is missing {0}")]
    Missing(&'static str),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub struct SockMap {
    // Keeps programs and links alive for the process lifetime.
    _bpf: Ebpf,
    pairs: Mutex<BpfHashMap<MapData, u64, u64>>,
}

impl SockMap {
    pub fn load(object_path: &str, cgroup_path: &str) -> Result<Self, SockMapError> {
        let mut bpf = Ebpf::load_file(object_path)?;

        // sock_ops keeps the socket map current with established
        // connections in our cgroup.
        let cgroup = File::open(cgroup_path)?;
        let sock_ops: &mut CgroupSockOps = bpf
            .program_mut("sock_ops_handler")
            .ok_or(SockMapError::Missing("program sock_ops_handler"))?
            .try_into()?;
        sock_ops.load()?;
        sock_ops.attach(&cgroup, CgroupAttachMode::Single)?;

        // The verdict program hangs off the socket map itself.
        let sock_map_fd = {
            let sock_map = SockHash::<_, u64>::try_from(
                bpf.map("sock_map")
                    .ok_or(SockMapError::Missing("map sock_map"))?,
            )?;
            sock_map.fd().try_clone()?
        };
        let verdict: &mut SkSkb = bpf
            .program_mut("sock_verdict")
            .ok_or(SockMapError::Missing("program sock_verdict"))?
            .try_into()?;
        verdict.load()?;
        verdict.attach(&sock_map_fd)?;

        let pairs = BpfHashMap::try_from(
            bpf.take_map("sock_pair_map")
                .ok_or(SockMapError::Missing("map sock_pair_map"))?,
        )?;

        tracing::debug!(cgroup = cgroup_path, "sock_ops attached");

        Ok(Self {
            _bpf: bpf,
            pairs: Mutex::new(pairs),
        })
    }

    pub fn register(
        &self,
        client: &TcpStream,
        upstream: &TcpStream,
    ) -> Result<SocketPair, SockMapError> {
        let pair = SocketPair {
            client: socket_cookie(client)?,
            upstream: socket_cookie(upstream)?,
        };

        let mut pairs = self.pairs.lock().unwrap_or_else(|e| e.into_inner());
        pairs.insert(pair.client, pair.upstream, 0)?;
        pairs.insert(pair.upstream, pair.client, 0)?;

        tracing::debug!(
            client = pair.client,
            upstream = pair.upstream,
            "Socket pair registered for kernel redirect"
        );
        Ok(pair)
    }

    pub fn unregister(&self, pair: &SocketPair) {
        let mut pairs = self.pairs.lock().unwrap_or_else(|e| e.into_inner());
        if let Err(e) = pairs.remove(&pair.client) {
            tracing::debug!(error = %e, "Pair map cleanup (client side)");
        }
        if let Err(e) = pairs.remove(&pair.upstream) {
            tracing::debug!(error = %e, "Pair map cleanup (upstream side)");
        }
    }
}

/// The kernel-assigned socket cookie, stable for the socket's lifetime.
fn socket_cookie(stream: &TcpStream) -> Result<u64, SockMapError> {
    let fd = stream.as_raw_fd();
    let mut cookie: u64 = 0;
    let mut len = std::mem::size_of::<u64>() as libc::socklen_t;
    let rc = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            SO_COOKIE,
            &mut cookie as *mut u64 as *mut libc::c_void,
            &mut len,
        )
    };
    if rc != 0 {
        return Err(SockMapError::Io(std::io::Error::last_os_error()));
    }
    Ok(cookie)
}
