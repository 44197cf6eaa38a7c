// SPDX-License-Identifier: GPL-3.0-only
/*
 * Copyright (c) 2025 Code Construct
 */
//! Admin commands tunnelled through the management interface.
//!
//! Every Admin exchange follows the same envelope: a request header
//! carrying the submission queue entry dwords and a description of the data
//! window, an optional dword-aligned payload flowing in at most one
//! direction, and a response header with the status byte and three
//! completion queue dwords. Data windows are limited to 4 KiB each way;
//! transfers larger than that are segmented by the caller-facing helpers.

use deku::prelude::*;
use log::debug;

use crate::message::{MSGTYPE_NVME, MessageClass, Request, Response};
use crate::{Controller, Error, Result};

// Base v2.1, 5.1, admin opcodes issued out-of-band
const OPCODE_GET_LOG_PAGE: u8 = 0x02;
const OPCODE_IDENTIFY: u8 = 0x06;
const OPCODE_SECURITY_SEND: u8 = 0x81;
const OPCODE_SECURITY_RECV: u8 = 0x82;

/// Hard limit on an Admin data window in either direction.
pub const ADMIN_DATA_MAX: usize = 4096;

// DOFST/DLEN validity bits in the request flags field
const FLAGS_DLEN: u8 = 0x1;
const FLAGS_DOFF: u8 = 0x2;

/// Admin request message header.
// MI v2.0, 6
#[derive(Clone, Debug, Default, DekuRead, DekuWrite, Eq, PartialEq)]
#[deku(endian = "little")]
pub struct AdminRequestHeader {
    pub typ: u8,
    pub nmp: u8,
    pub meb: u8,
    pub rsvd0: u8,
    pub opcode: u8,
    pub flags: u8,
    pub ctrl_id: u16,
    pub cdw1: u32,
    pub cdw2: u32,
    pub cdw3: u32,
    pub cdw4: u32,
    pub cdw5: u32,
    pub doff: u32,
    pub dlen: u32,
    pub rsvd1: u32,
    pub rsvd2: u32,
    pub cdw10: u32,
    pub cdw11: u32,
    pub cdw12: u32,
    pub cdw13: u32,
    pub cdw14: u32,
    pub cdw15: u32,
}

/// Encoded size of [`AdminRequestHeader`].
pub const ADMIN_REQ_HDR_LEN: usize = 68;

impl AdminRequestHeader {
    /// Zeroed slot-0 request envelope for `opcode` against `ctrl_id`.
    pub fn new(ctrl_id: u16, opcode: u8) -> Self {
        Self {
            typ: MSGTYPE_NVME,
            nmp: (MessageClass::Admin as u8) << 3,
            opcode,
            ctrl_id,
            ..Default::default()
        }
    }
}

/// Admin response message header.
// MI v2.0, 6
#[derive(Clone, Debug, Default, DekuRead, DekuWrite, Eq, PartialEq)]
#[deku(endian = "little")]
pub struct AdminResponseHeader {
    pub typ: u8,
    pub nmp: u8,
    pub meb: u8,
    pub rsvd0: u8,
    pub status: u8,
    pub rsvd1: [u8; 3],
    pub cdw0: u32,
    pub cdw1: u32,
    pub cdw3: u32,
}

/// Encoded size of [`AdminResponseHeader`].
pub const ADMIN_RESP_HDR_LEN: usize = 20;

/// Parameters for an Identify command.
// Base v2.1, 5.1.13
#[derive(Clone, Copy, Debug, Default)]
pub struct Identify {
    pub nsid: u32,
    pub cns: u8,
    pub cntid: u16,
    pub cns_specific_id: u16,
    pub csi: u8,
    pub uuidx: u8,
}

/// Parameters for a Get Log Page command.
// Base v2.1, 5.1.12
#[derive(Clone, Copy, Debug, Default)]
pub struct GetLogPage {
    pub nsid: u32,
    /// Log page identifier.
    pub lid: u8,
    /// Log specific parameter.
    pub lsp: u8,
    /// Log specific identifier.
    pub lsi: u16,
    /// Offset into the log page itself.
    pub lpo: u64,
    pub csi: u8,
    /// Offset type: offsets are index entries rather than bytes.
    pub ot: bool,
    /// Retain the asynchronous event associated with this page.
    pub rae: bool,
    pub uuidx: u8,
}

/// Security protocol addressing shared by Security Send and Receive.
// Base v2.1, 5.1.25
#[derive(Clone, Copy, Debug, Default)]
pub struct SecurityProtocol {
    pub secp: u8,
    pub spsp0: u8,
    pub spsp1: u8,
    pub nssf: u8,
}

fn security_cdw10(prot: &SecurityProtocol) -> u32 {
    u32::from(prot.secp) << 24
        | u32::from(prot.spsp0) << 16
        | u32::from(prot.spsp1) << 8
        | u32::from(prot.nssf)
}

impl Controller<'_> {
    /// Build, submit and complete one Admin exchange. Returns the parsed
    /// response header and the received payload length; a non-zero device
    /// status comes back verbatim as [`Error::Status`].
    fn admin_submit(
        &mut self,
        req_hdr: &AdminRequestHeader,
        req_data: &[u8],
        resp_data: &mut [u8],
    ) -> Result<(AdminResponseHeader, usize)> {
        let hdr_bytes = req_hdr.to_bytes()?;

        let mut resp_hdr_buf = [0u8; ADMIN_RESP_HDR_LEN];
        let payload_len = {
            let mut req = Request::new(&hdr_bytes, req_data);
            let mut resp = Response::new(&mut resp_hdr_buf, resp_data);
            self.ep.submit(&mut req, &mut resp)?;
            resp.payload_len()
        };

        let (_, hdr) = AdminResponseHeader::from_bytes((resp_hdr_buf.as_ref(), 0))?;
        if hdr.status != 0 {
            return Err(Error::Status(hdr.status));
        }
        Ok((hdr, payload_len))
    }

    /// Issue an Identify, reading `data.len()` bytes of the selected data
    /// structure starting at `offset` into `data`.
    ///
    /// The window must be served in full; a shorter reply is a protocol
    /// error. Returns completion dword 0.
    pub fn identify(&mut self, args: &Identify, offset: u32, data: &mut [u8]) -> Result<u32> {
        let size = data.len();
        if size == 0 {
            return Err(Error::InvalidArgument("identify window empty"));
        }
        if size > u32::MAX as usize {
            return Err(Error::InvalidArgument("identify window too large"));
        }
        if offset % 4 != 0 {
            return Err(Error::InvalidArgument("identify offset unaligned"));
        }

        let mut hdr = AdminRequestHeader::new(self.id, OPCODE_IDENTIFY);
        hdr.cdw1 = args.nsid;
        hdr.cdw10 = u32::from(args.cntid) << 16 | u32::from(args.cns);
        hdr.cdw11 = u32::from(args.csi) << 24 | u32::from(args.cns_specific_id);
        hdr.cdw14 = u32::from(args.uuidx);
        hdr.flags = FLAGS_DLEN;
        hdr.dlen = size as u32;
        if offset != 0 {
            hdr.flags |= FLAGS_DOFF;
            hdr.doff = offset;
        }

        let (resp_hdr, received) = self.admin_submit(&hdr, &[], data)?;

        // Callers expect the structure window in full; a truncated
        // identify data structure is not usable.
        if received != size {
            debug!("short identify response: {received} of {size} bytes");
            return Err(Error::Protocol("short identify response"));
        }

        Ok(resp_hdr.cdw0)
    }

    /// Read `log.len()` bytes of the log page selected by `args`,
    /// segmented into management-interface-sized windows.
    ///
    /// A window served short ends the transfer without error; the number
    /// of bytes obtained is returned. While any window other than the last
    /// is outstanding, the retain-asynchronous-event flag is forced on so
    /// the device does not clear event state mid-transfer.
    pub fn get_log_page(&mut self, args: &GetLogPage, log: &mut [u8]) -> Result<usize> {
        let total = log.len();
        let mut offset = 0;

        while offset < total {
            let chunk = ADMIN_DATA_MAX.min(total - offset);
            let last = offset + chunk >= total;
            let window = &mut log[offset..offset + chunk];

            let received = self.get_log_window(args, offset, window, last)?;
            offset += received;
            if received != chunk {
                // The device reached the end of the page.
                break;
            }
        }

        Ok(offset)
    }

    fn get_log_window(
        &mut self,
        args: &GetLogPage,
        offset: usize,
        window: &mut [u8],
        last: bool,
    ) -> Result<usize> {
        let len = window.len();
        if len < 4 || len > ADMIN_DATA_MAX {
            return Err(Error::InvalidArgument("log window size"));
        }
        if offset > u32::MAX as usize {
            return Err(Error::InvalidArgument("log window offset too large"));
        }

        let ndw = (len as u32 >> 2) - 1;
        let rae = args.rae || !last;

        let mut hdr = AdminRequestHeader::new(self.id, OPCODE_GET_LOG_PAGE);
        hdr.cdw1 = args.nsid;
        hdr.cdw10 = (ndw & 0xffff) << 16
            | u32::from(rae) << 15
            | u32::from(args.lsp) << 8
            | u32::from(args.lid);
        hdr.cdw11 = u32::from(args.lsi) << 16 | ndw >> 16;
        hdr.cdw12 = args.lpo as u32;
        hdr.cdw13 = (args.lpo >> 32) as u32;
        hdr.cdw14 = u32::from(args.csi) << 24 | u32::from(args.ot) << 23 | u32::from(args.uuidx);
        hdr.flags = FLAGS_DLEN;
        hdr.dlen = len as u32;
        if offset != 0 {
            hdr.flags |= FLAGS_DOFF;
            hdr.doff = offset as u32;
        }

        let (_, received) = self.admin_submit(&hdr, &[], window)?;
        Ok(received)
    }

    /// Send a security protocol payload to the controller. Returns
    /// completion dword 0.
    pub fn security_send(&mut self, prot: &SecurityProtocol, data: &[u8]) -> Result<u32> {
        if data.len() > ADMIN_DATA_MAX {
            return Err(Error::InvalidArgument("security payload too large"));
        }

        let mut hdr = AdminRequestHeader::new(self.id, OPCODE_SECURITY_SEND);
        hdr.cdw10 = security_cdw10(prot);
        hdr.cdw11 = data.len() as u32;
        hdr.flags = FLAGS_DLEN;
        hdr.dlen = data.len() as u32;

        let (resp_hdr, _) = self.admin_submit(&hdr, data, &mut [])?;
        Ok(resp_hdr.cdw0)
    }

    /// Retrieve a security protocol payload from the controller. Returns
    /// the number of bytes placed in `data` and completion dword 0.
    pub fn security_receive(
        &mut self,
        prot: &SecurityProtocol,
        data: &mut [u8],
    ) -> Result<(usize, u32)> {
        if data.len() > ADMIN_DATA_MAX {
            return Err(Error::InvalidArgument("security window too large"));
        }

        let mut hdr = AdminRequestHeader::new(self.id, OPCODE_SECURITY_RECV);
        hdr.cdw10 = security_cdw10(prot);
        hdr.cdw11 = data.len() as u32;
        hdr.flags = FLAGS_DLEN;
        hdr.dlen = data.len() as u32;

        let (resp_hdr, received) = self.admin_submit(&hdr, &[], data)?;
        Ok((received, resp_hdr.cdw0))
    }

    /// Transfer a caller-built Admin command.
    ///
    /// `req_hdr` carries the opcode, controller id and command dwords; the
    /// envelope fields (message type and class, data window description)
    /// are filled in here. `resp_data.len()` bytes are requested at
    /// `resp_data_offset` within the command's response data. The number
    /// of bytes actually placed is returned, and `resp_hdr` receives the
    /// raw response header, status byte included and uninterpreted.
    pub fn xfer(
        &mut self,
        req_hdr: &mut AdminRequestHeader,
        req_data: &[u8],
        resp_hdr: &mut AdminResponseHeader,
        resp_data: &mut [u8],
        resp_data_offset: u32,
    ) -> Result<usize> {
        // The data length field covers at most 4 KiB, data flows in at
        // most one direction, and an offset needs a window to offset into.
        if resp_data.len() > ADMIN_DATA_MAX {
            return Err(Error::InvalidArgument("response window too large"));
        }
        if req_data.len() > ADMIN_DATA_MAX {
            return Err(Error::InvalidArgument("request payload too large"));
        }
        if resp_data_offset % 4 != 0 {
            return Err(Error::InvalidArgument("response offset unaligned"));
        }
        if !req_data.is_empty() && !resp_data.is_empty() {
            return Err(Error::InvalidArgument("bidirectional data"));
        }
        if resp_data.is_empty() && resp_data_offset != 0 {
            return Err(Error::InvalidArgument("response offset without window"));
        }

        req_hdr.typ = MSGTYPE_NVME;
        req_hdr.nmp = (MessageClass::Admin as u8) << 3;
        req_hdr.flags = FLAGS_DLEN | FLAGS_DOFF;
        req_hdr.dlen = resp_data.len() as u32;
        req_hdr.doff = resp_data_offset;

        let hdr_bytes = req_hdr.to_bytes()?;
        let mut resp_hdr_buf = [0u8; ADMIN_RESP_HDR_LEN];
        let payload_len = {
            let mut req = Request::new(&hdr_bytes, req_data);
            let mut resp = Response::new(&mut resp_hdr_buf, resp_data);
            self.ep.submit(&mut req, &mut resp)?;
            resp.payload_len()
        };

        let (_, hdr) = AdminResponseHeader::from_bytes((resp_hdr_buf.as_ref(), 0))?;
        *resp_hdr = hdr;
        Ok(payload_len)
    }
}
