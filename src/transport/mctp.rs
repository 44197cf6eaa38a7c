// SPDX-License-Identifier: GPL-3.0-only
/*
 * Copyright (c) 2025 Code Construct
 */
//! NVMe-MI exchanges over an AF_MCTP datagram socket.
//!
//! A request goes out as one datagram gathered from three regions: the
//! header minus its leading type byte (the kernel carries the type in the
//! addressing), the payload, and the little-endian integrity check word.
//! The receive side scatters symmetrically into the caller's response
//! buffers, then reconciles the datagram length against the advertised
//! header/payload split so truncated responses land without copies.
//!
//! A device may answer with a More Processing Required message first; the
//! receive is then re-armed with the advertised processing time while the
//! message tag stays allocated, so the eventual response can still be
//! routed back to this socket.

use std::ffi::{c_int, c_ulong};
use std::fmt;
use std::io::{self, IoSlice, IoSliceMut};
use std::mem;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd};
use std::sync::Arc;
use std::time::Instant;

use log::{debug, error, info, warn};
use mctp::{Eid, MCTP_TAG_OWNER};

use crate::message::{MIC_LEN, MIN_RESP_LEN, MSGTYPE_NVME, Request, Response};
use crate::transport::{EndpointParams, Transport};
use crate::{Error, Result, mic};

/* Not yet in the libc crate; from linux/mctp.h. */
const AF_MCTP: libc::sa_family_t = 45;
const MCTP_TAG_PREALLOC: u8 = 0x10;
const SIOCPROTOPRIVATE: c_ulong = 0x89e0;

/// Allocate a tag for a peer, held until dropped.
pub const SIOCMCTPALLOCTAG: c_ulong = SIOCPROTOPRIVATE;
/// Release a previously allocated tag.
pub const SIOCMCTPDROPTAG: c_ulong = SIOCPROTOPRIVATE + 1;

#[repr(C)]
#[allow(non_camel_case_types)]
struct sockaddr_mctp {
    smctp_family: libc::sa_family_t,
    __smctp_pad0: u16,
    smctp_network: u32,
    smctp_addr: u8,
    smctp_type: u8,
    smctp_tag: u8,
    __smctp_pad1: u8,
}

/// Control block for the tag allocation ioctls.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct TagCtl {
    /// Peer endpoint the tag is held against.
    pub peer_addr: u8,
    /// Tag value; filled by allocation, consumed by release.
    pub tag: u8,
    /// Reserved, must be zero.
    pub flags: u16,
}

/// Destination addressing for one datagram.
pub struct MctpSockAddr(sockaddr_mctp);

impl MctpSockAddr {
    pub fn new(eid: u8, net: u32, typ: u8, tag: u8) -> Self {
        MctpSockAddr(sockaddr_mctp {
            smctp_family: AF_MCTP,
            __smctp_pad0: 0,
            smctp_network: net,
            smctp_addr: eid,
            smctp_type: typ,
            smctp_tag: tag,
            __smctp_pad1: 0,
        })
    }

    pub fn eid(&self) -> u8 {
        self.0.smctp_addr
    }

    pub fn net(&self) -> u32 {
        self.0.smctp_network
    }

    pub fn typ(&self) -> u8 {
        self.0.smctp_type
    }

    pub fn tag(&self) -> u8 {
        self.0.smctp_tag
    }

    fn as_raw(&self) -> (*const libc::sockaddr, libc::socklen_t) {
        (
            &self.0 as *const sockaddr_mctp as *const libc::sockaddr,
            mem::size_of::<sockaddr_mctp>() as libc::socklen_t,
        )
    }
}

impl fmt::Debug for MctpSockAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "MctpSockAddr(net={}, addr={}, type={:#04x}, tag={:#04x})",
            self.0.smctp_network, self.0.smctp_addr, self.0.smctp_type, self.0.smctp_tag
        )
    }
}

/// Socket system interface used by the MCTP transport.
///
/// The stock implementation is [`LibcSocketOps`]. Test harnesses substitute
/// their own to script the device side of an exchange; the vtable is held
/// per transport, so no process-wide state is involved and `&mut` ownership
/// of the endpoint serialises its use.
pub trait SocketOps: Send + Sync {
    /// Open an MCTP datagram socket.
    fn socket(&self) -> io::Result<OwnedFd>;

    /// Send one datagram, gathered from `bufs`, to `addr`.
    fn sendmsg(
        &self,
        sock: BorrowedFd<'_>,
        addr: &MctpSockAddr,
        bufs: &[IoSlice<'_>],
    ) -> io::Result<usize>;

    /// Receive one datagram, scattered into `bufs`.
    fn recvmsg(
        &self,
        sock: BorrowedFd<'_>,
        bufs: &mut [IoSliceMut<'_>],
        flags: c_int,
    ) -> io::Result<usize>;

    /// Wait for readability. A negative `timeout_ms` waits indefinitely.
    /// Returns the number of ready descriptors, zero on timeout.
    fn poll(&self, sock: BorrowedFd<'_>, timeout_ms: c_int) -> io::Result<u32>;

    /// Tag allocation control.
    fn ioctl_tag(&self, sock: BorrowedFd<'_>, req: c_ulong, ctl: &mut TagCtl) -> io::Result<()>;
}

/// [`SocketOps`] backed by the host kernel.
pub struct LibcSocketOps;

impl SocketOps for LibcSocketOps {
    fn socket(&self) -> io::Result<OwnedFd> {
        let rc = unsafe { libc::socket(AF_MCTP.into(), libc::SOCK_DGRAM | libc::SOCK_CLOEXEC, 0) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        // The new descriptor is exclusively ours.
        Ok(unsafe { OwnedFd::from_raw_fd(rc) })
    }

    fn sendmsg(
        &self,
        sock: BorrowedFd<'_>,
        addr: &MctpSockAddr,
        bufs: &[IoSlice<'_>],
    ) -> io::Result<usize> {
        let (name, namelen) = addr.as_raw();
        let mut msg: libc::msghdr = unsafe { mem::zeroed() };
        msg.msg_name = name as *mut libc::c_void;
        msg.msg_namelen = namelen;
        // IoSlice is guaranteed ABI-compatible with iovec.
        msg.msg_iov = bufs.as_ptr() as *mut libc::iovec;
        msg.msg_iovlen = bufs.len() as _;

        let rc = unsafe { libc::sendmsg(sock.as_raw_fd(), &msg, 0) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(rc as usize)
    }

    fn recvmsg(
        &self,
        sock: BorrowedFd<'_>,
        bufs: &mut [IoSliceMut<'_>],
        flags: c_int,
    ) -> io::Result<usize> {
        let mut msg: libc::msghdr = unsafe { mem::zeroed() };
        msg.msg_iov = bufs.as_mut_ptr() as *mut libc::iovec;
        msg.msg_iovlen = bufs.len() as _;

        let rc = unsafe { libc::recvmsg(sock.as_raw_fd(), &mut msg, flags) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(rc as usize)
    }

    fn poll(&self, sock: BorrowedFd<'_>, timeout_ms: c_int) -> io::Result<u32> {
        let mut fds = [libc::pollfd {
            fd: sock.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        }];

        let rc = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as _, timeout_ms) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(rc as u32)
    }

    fn ioctl_tag(&self, sock: BorrowedFd<'_>, req: c_ulong, ctl: &mut TagCtl) -> io::Result<()> {
        let rc = unsafe { libc::ioctl(sock.as_raw_fd(), req, ctl as *mut TagCtl) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

// MI v2.0, 4.2.1, response status
const RESP_STATUS_MPR: u8 = 0x01;

/// A More Processing Required message: common header, status byte, one
/// reserved byte, and the worst-case processing time in 100 ms units.
const MPR_MSG_LEN: usize = 8;

/// Wait applied when neither the device nor the endpoint bounds an MPR, in
/// milliseconds.
const MPR_WAIT_MAX_MS: u32 = 0xffff;

/// Default command/response timeout for MCTP endpoints, in milliseconds.
///
/// Assumes the worst case of a two-wire transport at 100 kHz with the
/// smallest MTU and full clock stretching, with room for a retry or two in
/// the lower layers.
pub(crate) const DEFAULT_TIMEOUT_MS: u32 = 5000;

/// Holds a message tag for the duration of an exchange. Dropping releases
/// it on every exit path; releasing the owner-bit fallback value is a
/// no-op.
struct TagGuard<'t> {
    ops: &'t dyn SocketOps,
    sock: BorrowedFd<'t>,
    peer: Eid,
    tag: u8,
}

impl Drop for TagGuard<'_> {
    fn drop(&mut self) {
        if self.tag & MCTP_TAG_PREALLOC == 0 {
            return;
        }

        let mut ctl = TagCtl {
            peer_addr: self.peer.0,
            tag: self.tag,
            flags: 0,
        };
        if let Err(e) = self.ops.ioctl_tag(self.sock, SIOCMCTPDROPTAG, &mut ctl) {
            debug!("failed releasing tag {:#04x}: {e}", self.tag);
        }
    }
}

/// If the received message is a More Processing Required response with a
/// valid integrity check, return the advertised processing time in
/// milliseconds.
///
/// This happens before the response spans are reconciled, so the check word
/// may sit in the header buffer, the payload buffer, or the standalone
/// word, depending on the advertised header length.
fn mpr_time(resp: &Response<'_>, mic_word: &[u8; MIC_LEN], len: usize) -> Option<u32> {
    if len != MPR_MSG_LEN + MIC_LEN {
        return None;
    }

    let (hdr, payload) = resp.bufs();
    if hdr[4] != RESP_STATUS_MPR {
        return None;
    }

    let mut word = [0u8; MIC_LEN];
    if hdr.len() >= MPR_MSG_LEN + MIC_LEN {
        word.copy_from_slice(&hdr[MPR_MSG_LEN..MPR_MSG_LEN + MIC_LEN]);
    } else if payload.len() >= MIC_LEN {
        word.copy_from_slice(&payload[..MIC_LEN]);
    } else {
        word = *mic_word;
    }

    if u32::from_le_bytes(word) != mic::message_integrity(&[&hdr[..MPR_MSG_LEN]]) {
        return None;
    }

    let mprt = u16::from_le_bytes([hdr[6], hdr[7]]);
    Some(u32::from(mprt) * 100)
}

/// NVMe-MI over an AF_MCTP socket, addressed by `(network, eid)`.
pub struct MctpTransport {
    net: u32,
    eid: Eid,
    sock: OwnedFd,
    ops: Arc<dyn SocketOps>,
    tag_fallback_logged: bool,
}

impl MctpTransport {
    /// Open a kernel MCTP socket for the peer at `(net, eid)`.
    pub fn new(net: u32, eid: Eid) -> Result<Self> {
        Self::with_ops(net, eid, Arc::new(LibcSocketOps))
    }

    /// As [`new`](Self::new), with an alternative socket vtable.
    pub fn with_ops(net: u32, eid: Eid, ops: Arc<dyn SocketOps>) -> Result<Self> {
        let sock = ops.socket()?;
        Ok(Self {
            net,
            eid,
            sock,
            ops,
            tag_fallback_logged: false,
        })
    }

    pub fn net(&self) -> u32 {
        self.net
    }

    pub fn eid(&self) -> Eid {
        self.eid
    }

    fn alloc_tag(&mut self) -> u8 {
        let mut ctl = TagCtl {
            peer_addr: self.eid.0,
            ..Default::default()
        };

        match self
            .ops
            .ioctl_tag(self.sock.as_fd(), SIOCMCTPALLOCTAG, &mut ctl)
        {
            Ok(()) => ctl.tag,
            Err(_) => {
                // Without a preallocated tag the kernel will not keep the
                // reverse path pinned across a More Processing Required
                // reply.
                if !self.tag_fallback_logged {
                    info!("system does not support explicit tag allocation");
                    self.tag_fallback_logged = true;
                }
                MCTP_TAG_OWNER
            }
        }
    }

    /// Wait for the socket to become readable within `timeout_ms`, zero
    /// waiting indefinitely. An interrupted wait resumes with the
    /// remaining budget.
    fn wait_readable(&self, timeout_ms: u32) -> Result<()> {
        let start = Instant::now();
        loop {
            let remaining = if timeout_ms == 0 {
                -1
            } else {
                let elapsed = start.elapsed().as_millis().min(u128::from(u32::MAX)) as u32;
                timeout_ms.saturating_sub(elapsed).min(i32::MAX as u32) as c_int
            };

            match self.ops.poll(self.sock.as_fd(), remaining) {
                Ok(0) => {
                    debug!("timeout on MCTP socket");
                    return Err(Error::Timeout);
                }
                Ok(_) => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!("failed polling on MCTP socket: {e}");
                    return Err(Error::Transport(e));
                }
            }
        }
    }

    fn exchange(
        &self,
        params: &EndpointParams,
        req: &Request<'_>,
        resp: &mut Response<'_>,
        tag: u8,
    ) -> Result<()> {
        let addr = MctpSockAddr::new(self.eid.0, self.net, MSGTYPE_NVME, tag);

        let req_mic = req.mic.to_le_bytes();
        let mut iovs: Vec<IoSlice<'_>> = Vec::with_capacity(3);
        // The kernel carries the type byte in the addressing.
        iovs.push(IoSlice::new(&req.header[1..]));
        if !req.payload.is_empty() {
            iovs.push(IoSlice::new(req.payload));
        }
        iovs.push(IoSlice::new(&req_mic));

        self.ops
            .sendmsg(self.sock.as_fd(), &addr, &iovs)
            .map_err(|e| {
                error!("failure sending MCTP message: {e}");
                Error::Transport(e)
            })?;

        let mut timeout_ms = params.timeout_ms;
        loop {
            self.wait_readable(timeout_ms)?;

            let mut mic_word = [0u8; MIC_LEN];
            let received = {
                let (hdr, payload) = resp.bufs_mut();
                let mut iovs = [
                    IoSliceMut::new(&mut hdr[1..]),
                    IoSliceMut::new(payload),
                    IoSliceMut::new(&mut mic_word),
                ];
                self.ops
                    .recvmsg(self.sock.as_fd(), &mut iovs, libc::MSG_DONTWAIT)
                    .map_err(|e| {
                        error!("failure receiving MCTP message: {e}");
                        Error::Transport(e)
                    })?
            };

            if received == 0 {
                warn!("no data from MCTP endpoint");
                return Err(Error::Protocol("empty datagram"));
            }

            // Restore the type byte so downstream sees a contiguous
            // header, and account for it in the length.
            resp.header_buf_mut()[0] = MSGTYPE_NVME;
            let len = received + 1;

            if len < MIN_RESP_LEN + MIC_LEN {
                error!(
                    "invalid MCTP response: too short ({len} bytes, needed {})",
                    MIN_RESP_LEN + MIC_LEN
                );
                return Err(Error::Protocol("response too short"));
            }

            if len % 4 != 0 {
                warn!("response message has unaligned length ({len})");
                return Err(Error::Protocol("response length unaligned"));
            }

            // A More Processing Required reply keeps the exchange open:
            // re-arm the wait with the device's advertised processing time
            // and receive again on the same tag.
            if let Some(device_ms) = mpr_time(resp, &mic_word, len) {
                debug!("received More Processing Required, waiting for response");

                let mut wait = if device_ms > 0 {
                    device_ms
                } else if params.timeout_ms > 0 {
                    params.timeout_ms
                } else {
                    MPR_WAIT_MAX_MS
                };
                if params.mprt_max_ms > 0 {
                    wait = wait.min(params.mprt_max_ms);
                }

                timeout_ms = wait;
                continue;
            }

            // Reconcile the datagram length against the advertised spans.
            // The header/payload split is dword-aligned, so the integrity
            // check word sits wholly within one region.
            let hdr_cap = resp.header_capacity();
            let payload_cap = resp.payload_capacity();
            let word = if len == hdr_cap + payload_cap + MIC_LEN {
                // Expected size; the spans are already laid out correctly.
                resp.set_lengths(hdr_cap, payload_cap);
                mic_word
            } else if len < hdr_cap + MIC_LEN {
                // Shorter than the advertised header; the check word sits
                // inside the header buffer.
                let hdr_len = len - MIC_LEN;
                let mut word = [0u8; MIC_LEN];
                word.copy_from_slice(&resp.bufs().0[hdr_len..hdr_len + MIC_LEN]);
                resp.set_lengths(hdr_len, 0);
                word
            } else {
                // Full header, truncated payload; the check word sits in
                // the payload buffer.
                let payload_len = len - hdr_cap - MIC_LEN;
                let mut word = [0u8; MIC_LEN];
                word.copy_from_slice(&resp.bufs().1[payload_len..payload_len + MIC_LEN]);
                resp.set_lengths(hdr_cap, payload_len);
                word
            };
            resp.set_mic(u32::from_le_bytes(word));

            return Ok(());
        }
    }
}

impl Transport for MctpTransport {
    fn name(&self) -> &'static str {
        "mctp"
    }

    fn mic_enabled(&self) -> bool {
        true
    }

    fn submit(
        &mut self,
        params: &EndpointParams,
        req: &Request<'_>,
        resp: &mut Response<'_>,
    ) -> Result<()> {
        // Room for at least a generic (error) response.
        if resp.header_capacity() < MIN_RESP_LEN {
            return Err(Error::InvalidArgument("response header below minimum"));
        }

        let tag = self.alloc_tag();
        let _guard = TagGuard {
            ops: self.ops.as_ref(),
            sock: self.sock.as_fd(),
            peer: self.eid,
            tag,
        };

        self.exchange(params, req, resp, tag)
    }

    fn describe(&self) -> Option<String> {
        Some(format!("net {} eid {}", self.net, self.eid.0))
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}
