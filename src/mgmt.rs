// SPDX-License-Identifier: GPL-3.0-only
/*
 * Copyright (c) 2025 Code Construct
 */
//! Management Interface command set: inventory reads, health polling and
//! configuration.
//!
//! These commands use the same envelope as the Admin set but with the MI
//! message class and a two-dword request. The data structures returned by
//! Read NVMe-MI Data Structure are fixed 32-byte layouts, except for the
//! controller list, which is sized by its leading count.

use deku::prelude::*;
use flagset::{FlagSet, flags};
use log::warn;

use crate::message::{MSGTYPE_NVME, MessageClass, Request, Response};
use crate::{Endpoint, Error, Result};

// MI v2.0, 5, MI command opcodes
const OPCODE_READ_DATA: u8 = 0x00;
const OPCODE_SUBSYS_HEALTH_STATUS_POLL: u8 = 0x01;
const OPCODE_CONFIGURATION_SET: u8 = 0x03;
const OPCODE_CONFIGURATION_GET: u8 = 0x04;

// MI v2.0, 5.7, data structure types
const DTYP_SUBSYS_INFO: u8 = 0x00;
const DTYP_PORT_INFO: u8 = 0x01;
const DTYP_CTRL_LIST: u8 = 0x02;
const DTYP_CTRL_INFO: u8 = 0x03;

/// Largest number of identifiers a controller list can carry.
pub const CTRL_LIST_MAX: usize = 2047;

/// MI request message header.
// MI v2.0, 5
#[derive(Clone, Debug, Default, DekuRead, DekuWrite, Eq, PartialEq)]
#[deku(endian = "little")]
pub struct MiRequestHeader {
    pub typ: u8,
    pub nmp: u8,
    pub meb: u8,
    pub rsvd0: u8,
    #[deku(pad_bytes_after = "3")]
    pub opcode: u8,
    pub cdw0: u32,
    pub cdw1: u32,
}

/// Encoded size of [`MiRequestHeader`].
pub const MI_REQ_HDR_LEN: usize = 16;

impl MiRequestHeader {
    /// Zeroed slot-0 request envelope for `opcode`.
    fn new(opcode: u8) -> Self {
        Self {
            typ: MSGTYPE_NVME,
            nmp: (MessageClass::Mi as u8) << 3,
            opcode,
            ..Default::default()
        }
    }
}

/// MI response message header.
// MI v2.0, 5
#[derive(Clone, Debug, Default, DekuRead, DekuWrite, Eq, PartialEq)]
#[deku(endian = "little")]
pub struct MiResponseHeader {
    pub typ: u8,
    pub nmp: u8,
    pub meb: u8,
    pub rsvd0: u8,
    pub status: u8,
    pub nmresp: [u8; 3],
}

/// Encoded size of [`MiResponseHeader`].
pub const MI_RESP_HDR_LEN: usize = 8;

impl MiResponseHeader {
    /// Management response value, a 24-bit little-endian field.
    pub fn nmresp(&self) -> u32 {
        u32::from(self.nmresp[0]) | u32::from(self.nmresp[1]) << 8 | u32::from(self.nmresp[2]) << 16
    }
}

/// NVM subsystem information data structure.
// MI v2.0, 5.7.1
#[derive(Clone, Copy, Debug, Default, DekuRead, DekuWrite, Eq, PartialEq)]
#[deku(endian = "little")]
pub struct SubsystemInfo {
    /// Number of ports, zeroes based.
    pub nump: u8,
    /// Management interface major version.
    pub mjr: u8,
    /// Management interface minor version.
    #[deku(pad_bytes_after = "29")]
    pub mnr: u8,
}

impl SubsystemInfo {
    pub const LEN: usize = 32;

    /// Number of ports the subsystem exposes.
    pub fn num_ports(&self) -> usize {
        usize::from(self.nump) + 1
    }
}

/// Port type values in [`PortInfo::porttyp`].
// MI v2.0, 5.7.2
pub const PORT_TYPE_INACTIVE: u8 = 0x00;
pub const PORT_TYPE_PCIE: u8 = 0x01;
pub const PORT_TYPE_TWO_WIRE: u8 = 0x02;

/// Port information data structure.
///
/// The trailing 24 bytes are port-type-specific; use
/// [`pcie`](Self::pcie) or [`two_wire`](Self::two_wire) to decode them.
// MI v2.0, 5.7.2
#[derive(Clone, Copy, Debug, DekuRead, DekuWrite, Eq, PartialEq)]
#[deku(endian = "little")]
pub struct PortInfo {
    #[deku(pad_bytes_after = "1")]
    pub porttyp: u8,
    /// Largest MCTP transmission unit the port supports.
    pub mmctptus: u16,
    /// Management endpoint buffer size, in bytes.
    pub meb: u32,
    pub detail: [u8; 24],
}

impl PortInfo {
    pub const LEN: usize = 32;

    /// PCIe port data, when this is a PCIe port.
    pub fn pcie(&self) -> Option<PciePortInfo> {
        if self.porttyp != PORT_TYPE_PCIE {
            return None;
        }
        PciePortInfo::from_bytes((self.detail.as_ref(), 0))
            .map(|(_, info)| info)
            .ok()
    }

    /// Two-wire port data, when this is a two-wire (SMBus/I2C) port.
    pub fn two_wire(&self) -> Option<TwoWirePortInfo> {
        if self.porttyp != PORT_TYPE_TWO_WIRE {
            return None;
        }
        TwoWirePortInfo::from_bytes((self.detail.as_ref(), 0))
            .map(|(_, info)| info)
            .ok()
    }
}

/// PCIe-specific port data.
// MI v2.0, 5.7.2
#[derive(Clone, Copy, Debug, Default, DekuRead, DekuWrite, Eq, PartialEq)]
#[deku(endian = "little")]
pub struct PciePortInfo {
    /// Maximum payload size.
    pub mps: u8,
    /// Supported link speeds.
    pub sls: u8,
    /// Current link speed.
    pub cls: u8,
    /// Maximum link width.
    pub mlw: u8,
    /// Negotiated link width.
    pub nlw: u8,
    /// PCIe port number.
    #[deku(pad_bytes_after = "18")]
    pub pn: u8,
}

/// Two-wire-specific port data.
// MI v2.0, 5.7.2
#[derive(Clone, Copy, Debug, Default, DekuRead, DekuWrite, Eq, PartialEq)]
#[deku(endian = "little")]
pub struct TwoWirePortInfo {
    /// Current VPD address.
    pub cvpdaddr: u8,
    /// Maximum VPD access frequency.
    pub mvpdfreq: u8,
    /// Current management endpoint address.
    pub cmeaddr: u8,
    /// Two-wire port capabilities.
    pub twprt: u8,
    /// NVMe basic management capabilities.
    #[deku(pad_bytes_after = "19")]
    pub nvmebm: u8,
}

/// Controller list data structure: a count followed by that many
/// controller identifiers.
// Base v2.1, Figure 137
#[derive(Clone, Debug, Default, DekuRead, DekuWrite, Eq, PartialEq)]
#[deku(endian = "little")]
pub struct ControllerList {
    #[deku(update = "self.identifiers.len() as u16")]
    pub num: u16,
    #[deku(count = "num")]
    pub identifiers: Vec<u16>,
}

/// Controller information data structure.
// MI v2.0, 5.7.4
#[derive(Clone, Copy, Debug, Default, DekuRead, DekuWrite, Eq, PartialEq)]
#[deku(endian = "little")]
pub struct ControllerInfo {
    /// Port the controller is associated with.
    #[deku(pad_bytes_after = "4")]
    pub portid: u8,
    /// PCIe routing id information.
    pub prii: u8,
    /// PCIe routing id.
    pub pri: u16,
    pub vid: u16,
    pub did: u16,
    pub ssvid: u16,
    #[deku(pad_bytes_after = "16")]
    pub ssid: u16,
}

impl ControllerInfo {
    pub const LEN: usize = 32;
}

flags! {
    // MI v2.0, 5.6, NSS
    pub enum SubsystemStatus: u8 {
        P1la = 1 << 2,
        P0la = 1 << 3,
        Rnr = 1 << 4,
        Df = 1 << 5,
        Sfm = 1 << 6,
        Atf = 1 << 7,
    }

    // MI v2.0, 5.6, CCS
    pub enum CompositeControllerStatus: u16 {
        Rdy = 1 << 0,
        Cfs = 1 << 1,
        Shst = 1 << 2,
        Nssro = 1 << 4,
        Ceco = 1 << 5,
        Nac = 1 << 6,
        Fa = 1 << 7,
        Csts = 1 << 8,
        Ctemp = 1 << 9,
        Pdlu = 1 << 10,
        Spare = 1 << 11,
        Cwarn = 1 << 12,
    }
}

/// NVM subsystem health status poll reply.
// MI v2.0, 5.6
#[derive(Clone, Copy, Debug, Default, DekuRead, DekuWrite, Eq, PartialEq)]
#[deku(endian = "little")]
pub struct SubsystemHealthStatus {
    pub nss: u8,
    pub sw: u8,
    pub ctemp: u8,
    pub pdlu: u8,
    #[deku(pad_bytes_after = "26")]
    pub ccs: u16,
}

impl SubsystemHealthStatus {
    pub const LEN: usize = 32;

    pub fn subsystem_status(&self) -> FlagSet<SubsystemStatus> {
        FlagSet::new_truncated(self.nss)
    }

    pub fn composite_controller_status(&self) -> FlagSet<CompositeControllerStatus> {
        FlagSet::new_truncated(self.ccs)
    }

    /// Composite temperature in degrees Celsius.
    pub fn composite_temperature(&self) -> i8 {
        self.ctemp as i8
    }
}

impl Endpoint {
    /// Submit one MI command. Returns the parsed response header and the
    /// received payload length; a non-zero device status comes back
    /// verbatim as [`Error::Status`].
    fn mi_submit(
        &mut self,
        req_hdr: &MiRequestHeader,
        resp_data: &mut [u8],
    ) -> Result<(MiResponseHeader, usize)> {
        let hdr_bytes = req_hdr.to_bytes()?;

        let mut resp_hdr_buf = [0u8; MI_RESP_HDR_LEN];
        let payload_len = {
            let mut req = Request::new(&hdr_bytes, &[]);
            let mut resp = Response::new(&mut resp_hdr_buf, resp_data);
            self.submit(&mut req, &mut resp)?;
            resp.payload_len()
        };

        let (_, hdr) = MiResponseHeader::from_bytes((resp_hdr_buf.as_ref(), 0))?;
        if hdr.status != 0 {
            return Err(Error::Status(hdr.status));
        }
        Ok((hdr, payload_len))
    }

    /// Read one management data structure selected by `cdw0` into `data`,
    /// returning the length the device provided.
    fn read_mi_data(&mut self, cdw0: u32, data: &mut [u8]) -> Result<usize> {
        let mut hdr = MiRequestHeader::new(OPCODE_READ_DATA);
        hdr.cdw0 = cdw0;

        let (_, len) = self.mi_submit(&hdr, data)?;
        Ok(len)
    }

    /// Fixed-size read: the device must return exactly the structure.
    fn read_mi_data_exact(&mut self, cdw0: u32, data: &mut [u8]) -> Result<()> {
        let expected = data.len();
        let len = self.read_mi_data(cdw0, data)?;
        if len != expected {
            warn!("MI data read length mismatch: got {len} bytes, expected {expected}");
            return Err(Error::Protocol("management data structure size mismatch"));
        }
        Ok(())
    }

    /// Read the NVM subsystem information data structure.
    pub fn read_mi_data_subsys(&mut self) -> Result<SubsystemInfo> {
        let mut buf = [0u8; SubsystemInfo::LEN];
        self.read_mi_data_exact(u32::from(DTYP_SUBSYS_INFO) << 24, &mut buf)?;

        let (_, info) = SubsystemInfo::from_bytes((buf.as_ref(), 0))?;
        Ok(info)
    }

    /// Read the port information data structure for `portid`.
    pub fn read_mi_data_port(&mut self, portid: u8) -> Result<PortInfo> {
        let cdw0 = u32::from(DTYP_PORT_INFO) << 24 | u32::from(portid) << 16;
        let mut buf = [0u8; PortInfo::LEN];
        self.read_mi_data_exact(cdw0, &mut buf)?;

        let (_, info) = PortInfo::from_bytes((buf.as_ref(), 0))?;
        Ok(info)
    }

    /// Read the controller list, starting from `start_ctrlid`.
    ///
    /// The list length is whatever the device provides; only the count
    /// field bounds the identifiers.
    pub fn read_mi_data_ctrl_list(&mut self, start_ctrlid: u8) -> Result<ControllerList> {
        let cdw0 = u32::from(DTYP_CTRL_LIST) << 24 | u32::from(start_ctrlid) << 16;
        let mut buf = [0u8; 4096];
        self.read_mi_data(cdw0, &mut buf)?;

        let num = usize::from(u16::from_le_bytes([buf[0], buf[1]]));
        if num > CTRL_LIST_MAX {
            warn!("controller list claims {num} entries");
            return Err(Error::Protocol("controller list count out of range"));
        }

        let (_, list) = ControllerList::from_bytes((buf.as_ref(), 0))?;
        Ok(list)
    }

    /// Read the controller information data structure for `ctrl_id`.
    pub fn read_mi_data_ctrl(&mut self, ctrl_id: u16) -> Result<ControllerInfo> {
        // The controller id occupies the low 16 bits of the selector
        // dword; byte order is handled once, for the whole dword, by the
        // header codec.
        let cdw0 = u32::from(DTYP_CTRL_INFO) << 24 | u32::from(ctrl_id);
        let mut buf = [0u8; ControllerInfo::LEN];
        self.read_mi_data_exact(cdw0, &mut buf)?;

        let (_, info) = ControllerInfo::from_bytes((buf.as_ref(), 0))?;
        Ok(info)
    }

    /// Poll the NVM subsystem health status. `clear` resets the composite
    /// controller status flags once they have been reported.
    pub fn subsystem_health_status_poll(&mut self, clear: bool) -> Result<SubsystemHealthStatus> {
        let mut hdr = MiRequestHeader::new(OPCODE_SUBSYS_HEALTH_STATUS_POLL);
        hdr.cdw1 = u32::from(clear) << 31;

        let mut buf = [0u8; SubsystemHealthStatus::LEN];
        let (_, len) = self.mi_submit(&hdr, &mut buf)?;
        if len != SubsystemHealthStatus::LEN {
            warn!(
                "subsystem health status length mismatch: got {len} bytes, expected {}",
                SubsystemHealthStatus::LEN
            );
            return Err(Error::Protocol("health status size mismatch"));
        }

        let (_, status) = SubsystemHealthStatus::from_bytes((buf.as_ref(), 0))?;
        Ok(status)
    }

    /// Get a configuration value. Returns the 24-bit management response
    /// field.
    pub fn config_get(&mut self, dw0: u32, dw1: u32) -> Result<u32> {
        let mut hdr = MiRequestHeader::new(OPCODE_CONFIGURATION_GET);
        hdr.cdw0 = dw0;
        hdr.cdw1 = dw1;

        let (resp_hdr, _) = self.mi_submit(&hdr, &mut [])?;
        Ok(resp_hdr.nmresp())
    }

    /// Set a configuration value.
    pub fn config_set(&mut self, dw0: u32, dw1: u32) -> Result<()> {
        let mut hdr = MiRequestHeader::new(OPCODE_CONFIGURATION_SET);
        hdr.cdw0 = dw0;
        hdr.cdw1 = dw1;

        self.mi_submit(&hdr, &mut [])?;
        Ok(())
    }
}
