// SPDX-License-Identifier: GPL-3.0-only
/*
 * Copyright (c) 2025 Code Construct
 */
//! Transport abstraction under the submit pipeline.

pub mod mctp;

use std::any::Any;

use crate::Result;
use crate::message::{Request, Response};

/// Per-endpoint parameters a transport consults during an exchange.
#[derive(Clone, Copy, Debug)]
pub struct EndpointParams {
    /// Per-request timeout in milliseconds. Zero waits indefinitely.
    pub timeout_ms: u32,
    /// Upper bound on the wait a device may request before completing a
    /// command, in milliseconds. Zero leaves it unbounded.
    pub mprt_max_ms: u32,
}

/// One way of reaching an NVMe-MI endpoint.
///
/// An endpoint owns exactly one transport instance, holding whatever state
/// the transport needs (sockets, addressing). The submit pipeline is
/// written once against this interface.
pub trait Transport: Any {
    /// Short transport name, used in endpoint descriptions.
    fn name(&self) -> &'static str;

    /// Whether messages on this transport carry an integrity check. This
    /// decides both stamping of requests and verification of responses.
    fn mic_enabled(&self) -> bool;

    /// Perform one request/response exchange.
    ///
    /// On success the response frame's lengths reflect the received
    /// message and its integrity check word is populated.
    fn submit(
        &mut self,
        params: &EndpointParams,
        req: &Request<'_>,
        resp: &mut Response<'_>,
    ) -> Result<()>;

    /// Release transport resources ahead of drop.
    fn close(&mut self) {}

    /// Transport-specific endpoint description, typically addressing.
    fn describe(&self) -> Option<String> {
        None
    }

    /// Veto per-request timeouts the transport cannot honour.
    fn check_timeout(&self, _timeout_ms: u32) -> Result<()> {
        Ok(())
    }

    /// The concrete transport, for identity queries.
    fn as_any(&self) -> &dyn Any;
}
