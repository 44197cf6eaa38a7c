// SPDX-License-Identifier: GPL-3.0-only
/*
 * Copyright (c) 2025 Code Construct
 */
//! Out-of-band management of NVMe subsystems over MCTP, from the requester
//! side.
//!
//! A [`Root`] owns a set of [`Endpoint`]s, each reachable through exactly
//! one [`Transport`](transport::Transport); the stock transport speaks
//! NVMe-MI over an AF_MCTP datagram socket. Management Interface commands
//! (inventory reads, health polling, configuration) are issued directly on
//! an endpoint. Admin commands (Identify, Get Log Page, Security Send and
//! Receive) are issued on a [`Controller`] handle naming one of the
//! endpoint's controllers.
//!
//! Exchanges are strictly synchronous, one outstanding request per
//! endpoint; an exchange owns its endpoint until the response arrives or
//! the endpoint timeout expires.
//!
//! ```no_run
//! use nvme_mi_req::{Eid, Root, admin::Identify};
//!
//! fn main() -> nvme_mi_req::Result<()> {
//!     let mut root = Root::new();
//!     let ep = root.open_mctp(1, Eid(9))?;
//!     ep.scan(false)?;
//!
//!     for id in ep.controller_ids().to_vec() {
//!         let mut data = [0u8; 4096];
//!         let args = Identify {
//!             cns: 0x01,
//!             ..Default::default()
//!         };
//!         ep.controller(id).identify(&args, 0, &mut data)?;
//!     }
//!     Ok(())
//! }
//! ```

pub mod admin;
pub mod discover;
pub mod message;
pub mod mgmt;
pub mod mic;
pub mod transport;

use std::sync::Arc;

use log::{debug, info, warn};

pub use mctp::Eid;

use crate::message::{MSG_HDR_LEN, MSGTYPE_NVME, NMP_ROR_RESPONSE, NMP_SLOT_MASK, Request, Response};
use crate::transport::mctp::{LibcSocketOps, MctpTransport, SocketOps};
use crate::transport::{EndpointParams, Transport};

/// Errors surfaced by management interface operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A precondition on sizes, offsets, alignment or data direction was
    /// violated. Raised before any I/O takes place.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// A send or receive on the underlying transport failed; the OS error
    /// is preserved.
    #[error("transport failure: {0}")]
    Transport(#[from] std::io::Error),

    /// No response arrived within the endpoint timeout.
    #[error("timed out waiting for a response")]
    Timeout,

    /// The response was syntactically invalid.
    #[error("protocol error: {0}")]
    Protocol(&'static str),

    /// The response integrity check did not verify.
    #[error("message integrity check mismatch")]
    MicMismatch,

    /// Request and response disagreed on the command slot.
    #[error("command slot mismatch: request {request}, response {response}")]
    SlotMismatch { request: u8, response: u8 },

    /// The exchange succeeded but the device reported a failure; carries
    /// the response status byte verbatim.
    #[error("device status {0:#04x}")]
    Status(u8),

    /// A message could not be encoded or decoded.
    #[error("message codec failure: {0}")]
    Codec(#[from] deku::DekuError),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Default per-request timeout for newly added endpoints, in milliseconds.
const DEFAULT_TIMEOUT_MS: u32 = 1000;

/// Process-scoped container of management endpoints.
///
/// Endpoints are kept in insertion order. Dropping the root closes every
/// endpoint it owns, which in turn closes their transports.
#[derive(Default)]
pub struct Root {
    endpoints: Vec<Endpoint>,
}

impl Root {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an endpoint reached through the given transport. The endpoint
    /// starts out with the generic default timeout.
    pub fn add_endpoint(&mut self, transport: Box<dyn Transport>) -> &mut Endpoint {
        self.endpoints.push(Endpoint::new(transport));
        self.endpoints.last_mut().expect("endpoint just added")
    }

    /// Open an endpoint to the MCTP peer at `(net, eid)`.
    pub fn open_mctp(&mut self, net: u32, eid: Eid) -> Result<&mut Endpoint> {
        self.open_mctp_with_ops(net, eid, Arc::new(LibcSocketOps))
    }

    /// As [`open_mctp`](Self::open_mctp), with an alternative socket
    /// vtable for the new endpoint's transport.
    pub fn open_mctp_with_ops(
        &mut self,
        net: u32,
        eid: Eid,
        ops: Arc<dyn SocketOps>,
    ) -> Result<&mut Endpoint> {
        let transport = MctpTransport::with_ops(net, eid, ops)?;
        let ep = self.add_endpoint(Box::new(transport));
        ep.timeout_ms = transport::mctp::DEFAULT_TIMEOUT_MS;
        Ok(ep)
    }

    pub fn endpoints(&self) -> impl Iterator<Item = &Endpoint> {
        self.endpoints.iter()
    }

    pub fn endpoints_mut(&mut self) -> impl Iterator<Item = &mut Endpoint> {
        self.endpoints.iter_mut()
    }
}

/// One addressable NVMe-MI peer, reachable through exactly one transport.
pub struct Endpoint {
    transport: Box<dyn Transport>,
    controllers: Vec<u16>,
    controllers_scanned: bool,
    timeout_ms: u32,
    mprt_max_ms: u32,
}

impl Endpoint {
    fn new(transport: Box<dyn Transport>) -> Self {
        Self {
            transport,
            controllers: Vec::new(),
            controllers_scanned: false,
            timeout_ms: DEFAULT_TIMEOUT_MS,
            mprt_max_ms: 0,
        }
    }

    /// Set the per-request timeout in milliseconds; zero waits
    /// indefinitely. The transport may reject values it cannot honour.
    pub fn set_timeout(&mut self, timeout_ms: u32) -> Result<()> {
        self.transport.check_timeout(timeout_ms)?;
        self.timeout_ms = timeout_ms;
        Ok(())
    }

    pub fn timeout(&self) -> u32 {
        self.timeout_ms
    }

    /// Bound the wait a device may request through a More Processing
    /// Required response, in milliseconds. Zero leaves it unbounded.
    pub fn set_mprt_max(&mut self, mprt_max_ms: u32) {
        self.mprt_max_ms = mprt_max_ms;
    }

    pub fn mprt_max(&self) -> u32 {
        self.mprt_max_ms
    }

    pub(crate) fn transport(&self) -> &dyn Transport {
        self.transport.as_ref()
    }

    /// Human-readable description of how this endpoint is reached.
    pub fn describe(&self) -> String {
        match self.transport.describe() {
            Some(desc) => format!("{}: {}", self.transport.name(), desc),
            None => format!("{} endpoint", self.transport.name()),
        }
    }

    /// Identifiers of the controllers recorded by [`scan`](Self::scan).
    pub fn controller_ids(&self) -> &[u16] {
        &self.controllers
    }

    /// Handle on one controller behind this endpoint.
    pub fn controller(&mut self, id: u16) -> Controller<'_> {
        Controller { ep: self, id }
    }

    /// Discover the controllers behind this endpoint.
    ///
    /// Issues a controller list read and records every non-zero
    /// identifier. Scanning an already scanned endpoint is a no-op unless
    /// `force` is set, which discards the previous result first.
    pub fn scan(&mut self, force: bool) -> Result<()> {
        if self.controllers_scanned {
            if !force {
                return Ok(());
            }
            self.controllers.clear();
        }

        let list = self.read_mi_data_ctrl_list(0)?;
        self.controllers
            .extend(list.identifiers.iter().copied().filter(|&id| id != 0));
        self.controllers_scanned = true;
        Ok(())
    }

    /// Issue one request/response exchange on this endpoint.
    ///
    /// Validates the frame invariants, stamps and verifies the message
    /// integrity check when the transport carries one, and applies the
    /// common response header checks. On return the response frame's
    /// lengths reflect what the transport placed.
    pub fn submit(&mut self, req: &mut Request<'_>, resp: &mut Response<'_>) -> Result<()> {
        if req.header.len() < MSG_HDR_LEN {
            return Err(Error::InvalidArgument("request header too short"));
        }
        if req.header.len() % 4 != 0 {
            return Err(Error::InvalidArgument("request header length unaligned"));
        }
        if req.payload.len() % 4 != 0 {
            return Err(Error::InvalidArgument("request payload length unaligned"));
        }
        if resp.header_capacity() < MSG_HDR_LEN {
            return Err(Error::InvalidArgument("response header too short"));
        }
        if resp.header_capacity() % 4 != 0 {
            return Err(Error::InvalidArgument("response header length unaligned"));
        }
        if resp.payload_capacity() % 4 != 0 {
            return Err(Error::InvalidArgument("response payload length unaligned"));
        }

        if self.transport.mic_enabled() {
            req.mic = mic::message_integrity(&[req.header, req.payload]);
        }

        let params = EndpointParams {
            timeout_ms: self.timeout_ms,
            mprt_max_ms: self.mprt_max_ms,
        };
        self.transport.submit(&params, req, resp).map_err(|e| {
            info!("transport failure: {e}");
            e
        })?;

        if self.transport.mic_enabled() {
            let crc = mic::message_integrity(&[resp.header(), resp.payload()]);
            if resp.mic() != crc {
                warn!("integrity check mismatch on response");
                return Err(Error::MicMismatch);
            }
        }

        if resp.header_len() < MSG_HDR_LEN {
            debug!("bad response header length: {}", resp.header_len());
            return Err(Error::Protocol("response header too short"));
        }

        let hdr = resp.header();
        if hdr[0] != MSGTYPE_NVME {
            debug!("invalid response message type {:#04x}", hdr[0]);
            return Err(Error::Protocol("bad message type"));
        }

        if hdr[1] & NMP_ROR_RESPONSE == 0 {
            debug!("ROR value in response indicates a request");
            return Err(Error::Protocol("response flagged as a request"));
        }

        let request = req.header[1] & NMP_SLOT_MASK;
        let response = hdr[1] & NMP_SLOT_MASK;
        if request != response {
            warn!("command slot mismatch: request {request}, response {response}");
            return Err(Error::SlotMismatch { request, response });
        }

        Ok(())
    }
}

impl Drop for Endpoint {
    fn drop(&mut self) {
        self.transport.close();
    }
}

/// One NVMe controller behind an endpoint: nothing more than the pairing
/// of the endpoint with a 16-bit controller identifier.
pub struct Controller<'ep> {
    pub(crate) ep: &'ep mut Endpoint,
    pub(crate) id: u16,
}

impl Controller<'_> {
    pub fn id(&self) -> u16 {
        self.id
    }
}
