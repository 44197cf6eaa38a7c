// SPDX-License-Identifier: GPL-3.0-only
/*
 * Copyright (c) 2025 Code Construct
 */
extern crate simplelog;

use std::collections::VecDeque;
use std::ffi::{c_int, c_ulong};
use std::fs::File;
use std::io::{self, IoSlice, IoSliceMut};
use std::os::fd::{BorrowedFd, OwnedFd};
use std::sync::{Arc, Mutex, MutexGuard};

use log::LevelFilter;
use simplelog::{ColorChoice, Config, TermLogger, TerminalMode};

use nvme_mi_req::message::MSGTYPE_NVME;
use nvme_mi_req::mic;
use nvme_mi_req::transport::mctp::{
    MctpSockAddr, SIOCMCTPALLOCTAG, SIOCMCTPDROPTAG, SocketOps, TagCtl,
};
use nvme_mi_req::{Endpoint, Root};

pub const NET: u32 = 1;
pub const EID: u8 = 9;

pub fn setup() {
    let _ = TermLogger::init(
        LevelFilter::Debug,
        Config::default(),
        TerminalMode::Mixed,
        ColorChoice::Auto,
    );
}

pub fn new_endpoint<'r>(root: &'r mut Root, sock: &Arc<ScriptedSock>) -> &'r mut Endpoint {
    root.open_mctp_with_ops(NET, nvme_mi_req::Eid(EID), sock.clone())
        .expect("open scripted endpoint")
}

/// One datagram the transport sent, as observed by the mock.
pub struct Sent {
    pub eid: u8,
    pub net: u32,
    pub typ: u8,
    pub tag: u8,
    pub bytes: Vec<u8>,
}

impl Sent {
    /// The message as a contiguous byte stream with the type byte
    /// restored, excluding the trailing integrity check word.
    pub fn message(&self) -> Vec<u8> {
        let mut msg = vec![self.typ];
        msg.extend_from_slice(&self.bytes[..self.bytes.len() - 4]);
        msg
    }

    /// The integrity check word the transport sent.
    pub fn mic(&self) -> u32 {
        let tail = &self.bytes[self.bytes.len() - 4..];
        u32::from_le_bytes(tail.try_into().unwrap())
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PollStep {
    Ready,
    TimedOut,
    Interrupted,
}

#[derive(Default)]
pub struct ScriptState {
    pub sent: Vec<Sent>,
    pub responses: VecDeque<Vec<u8>>,
    /// Outcome of each poll, in order; once exhausted, polls report ready.
    pub polls: VecDeque<PollStep>,
    /// Timeout passed to each poll, in order.
    pub poll_timeouts: Vec<c_int>,
    pub deny_tag_alloc: bool,
    pub tag_allocs: Vec<u8>,
    pub tag_drops: Vec<u8>,
    next_tag: u8,
}

/// Scripted socket implementation standing in for the kernel: responses
/// are queued ahead of time, sends and tag operations are recorded.
#[derive(Default)]
pub struct ScriptedSock(Mutex<ScriptState>);

impl ScriptedSock {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn state(&self) -> MutexGuard<'_, ScriptState> {
        self.0.lock().unwrap()
    }

    /// Queue a complete wire message (type byte first, integrity check
    /// last) for a subsequent receive.
    pub fn respond(&self, message: Vec<u8>) {
        self.state().responses.push_back(message);
    }
}

impl SocketOps for ScriptedSock {
    fn socket(&self) -> io::Result<OwnedFd> {
        // Any descriptor will do; nothing is transferred through it.
        Ok(File::open("/dev/null")?.into())
    }

    fn sendmsg(
        &self,
        _sock: BorrowedFd<'_>,
        addr: &MctpSockAddr,
        bufs: &[IoSlice<'_>],
    ) -> io::Result<usize> {
        let bytes: Vec<u8> = bufs.iter().flat_map(|b| b.iter().copied()).collect();
        let len = bytes.len();
        self.state().sent.push(Sent {
            eid: addr.eid(),
            net: addr.net(),
            typ: addr.typ(),
            tag: addr.tag(),
            bytes,
        });
        Ok(len)
    }

    fn recvmsg(
        &self,
        _sock: BorrowedFd<'_>,
        bufs: &mut [IoSliceMut<'_>],
        _flags: c_int,
    ) -> io::Result<usize> {
        let mut state = self.state();
        let Some(msg) = state.responses.pop_front() else {
            return Err(io::Error::from(io::ErrorKind::WouldBlock));
        };

        // The kernel delivers the message body; the type byte travels in
        // the addressing. Bytes beyond the scatter list are discarded, as
        // a datagram receive does.
        let mut src = &msg[1..];
        let mut filled = 0;
        for buf in bufs.iter_mut() {
            let n = src.len().min(buf.len());
            buf[..n].copy_from_slice(&src[..n]);
            src = &src[n..];
            filled += n;
        }
        Ok(filled)
    }

    fn poll(&self, _sock: BorrowedFd<'_>, timeout_ms: c_int) -> io::Result<u32> {
        let mut state = self.state();
        state.poll_timeouts.push(timeout_ms);
        match state.polls.pop_front().unwrap_or(PollStep::Ready) {
            PollStep::Ready => Ok(1),
            PollStep::TimedOut => Ok(0),
            PollStep::Interrupted => Err(io::Error::from(io::ErrorKind::Interrupted)),
        }
    }

    fn ioctl_tag(&self, _sock: BorrowedFd<'_>, req: c_ulong, ctl: &mut TagCtl) -> io::Result<()> {
        let mut state = self.state();
        if req == SIOCMCTPALLOCTAG {
            if state.deny_tag_alloc {
                return Err(io::Error::from(io::ErrorKind::Unsupported));
            }
            // owner and preallocated bits plus a rotating value
            let tag = 0x18 | state.next_tag;
            state.next_tag = (state.next_tag + 1) % 8;
            ctl.tag = tag;
            state.tag_allocs.push(tag);
            Ok(())
        } else if req == SIOCMCTPDROPTAG {
            state.tag_drops.push(ctl.tag);
            Ok(())
        } else {
            Err(io::Error::from(io::ErrorKind::InvalidInput))
        }
    }
}

/// Append the integrity check and return the complete wire message.
pub fn with_mic(mut msg: Vec<u8>) -> Vec<u8> {
    let word = mic::message_integrity(&[&msg]);
    msg.extend_from_slice(&word.to_le_bytes());
    msg
}

/// Build an MI response message: header, status dword, payload, MIC.
pub fn mi_response(status: u8, payload: &[u8]) -> Vec<u8> {
    let mut msg = vec![MSGTYPE_NVME, 0x88, 0x00, 0x00, status, 0x00, 0x00, 0x00];
    msg.extend_from_slice(payload);
    with_mic(msg)
}

/// Build an Admin response message: header, status, CQE dwords, payload,
/// MIC.
pub fn admin_response(status: u8, cdw0: u32, payload: &[u8]) -> Vec<u8> {
    let mut msg = vec![MSGTYPE_NVME, 0x98, 0x00, 0x00, status, 0x00, 0x00, 0x00];
    msg.extend_from_slice(&cdw0.to_le_bytes());
    msg.extend_from_slice(&0u32.to_le_bytes()); // cqe dword 1
    msg.extend_from_slice(&0u32.to_le_bytes()); // cqe dword 3
    msg.extend_from_slice(payload);
    with_mic(msg)
}

/// Build a More Processing Required response advertising a processing time
/// in 100 ms units.
pub fn mpr_response(mprt: u16) -> Vec<u8> {
    let mut msg = vec![MSGTYPE_NVME, 0x88, 0x00, 0x00, 0x01, 0x00];
    msg.extend_from_slice(&mprt.to_le_bytes());
    with_mic(msg)
}
