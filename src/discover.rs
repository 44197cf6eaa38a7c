// SPDX-License-Identifier: GPL-3.0-only
/*
 * Copyright (c) 2025 Code Construct
 */
//! Endpoint discovery from platform MCTP endpoint records.
//!
//! MCTP endpoint enumeration belongs to the platform's MCTP control
//! daemon; on a typical system that is the D-Bus object tree under
//! `xyz.openbmc_project.MCTP`, whose objects carry the
//! `xyz.openbmc_project.MCTP.Endpoint` interface. Callers collect one
//! [`EndpointRecord`] per advertised endpoint, however they reach that
//! daemon, and [`Root::discover`] adds an MCTP endpoint for every record
//! that speaks NVMe-MI.

use std::sync::Arc;

use log::{debug, error};
use mctp::Eid;

use crate::transport::mctp::{LibcSocketOps, MctpTransport, SocketOps};
use crate::{Result, Root};

/// MCTP message type advertised by NVMe-MI-capable endpoints, without the
/// integrity check bit.
pub const MCTP_TYPE_NVME: u8 = 0x04;

/// Properties of one MCTP endpoint, as published by the platform's
/// endpoint enumeration.
#[derive(Clone, Debug, Default)]
pub struct EndpointRecord {
    /// The `EID` property.
    pub eid: Option<u8>,
    /// The `NetworkId` property.
    pub network_id: Option<i32>,
    /// The `SupportedMessageTypes` property.
    pub message_types: Vec<u8>,
}

impl EndpointRecord {
    fn supports_nvme_mi(&self) -> bool {
        self.message_types.contains(&MCTP_TYPE_NVME)
    }
}

impl Root {
    /// Add an endpoint for every NVMe-MI-capable record.
    ///
    /// Records that do not advertise NVMe-MI are ignored, as are records
    /// whose `(network, eid)` is already present. An NVMe-MI-capable
    /// record missing its address properties is an error for that record
    /// alone and does not stop the rest. Returns the number of endpoints
    /// added.
    pub fn discover(&mut self, records: impl IntoIterator<Item = EndpointRecord>) -> usize {
        self.discover_with_ops(records, Arc::new(LibcSocketOps))
    }

    /// As [`discover`](Self::discover), with an alternative socket vtable
    /// for the endpoints created.
    pub fn discover_with_ops(
        &mut self,
        records: impl IntoIterator<Item = EndpointRecord>,
        ops: Arc<dyn SocketOps>,
    ) -> usize {
        let mut added = 0;
        for record in records {
            if !record.supports_nvme_mi() {
                continue;
            }

            let (Some(eid), Some(net)) = (record.eid, record.network_id) else {
                error!("MCTP endpoint record missing EID or NetworkId");
                continue;
            };

            match self.add_mctp(net as u32, Eid(eid), ops.clone()) {
                Ok(true) => added += 1,
                Ok(false) => debug!("already have an endpoint for net {net} eid {eid}"),
                Err(e) => error!("error adding net {net} eid {eid}: {e}"),
            }
        }
        added
    }

    /// Add an MCTP endpoint unless one for `(net, eid)` already exists.
    /// Returns whether an endpoint was added.
    pub fn add_mctp(&mut self, net: u32, eid: Eid, ops: Arc<dyn SocketOps>) -> Result<bool> {
        let present = self.endpoints().any(|ep| {
            ep.transport()
                .as_any()
                .downcast_ref::<MctpTransport>()
                .is_some_and(|t| t.net() == net && t.eid() == eid)
        });
        if present {
            return Ok(false);
        }

        self.open_mctp_with_ops(net, eid, ops)?;
        Ok(true)
    }
}
