// SPDX-License-Identifier: GPL-3.0-only
/*
 * Copyright (c) 2025 Code Construct
 */
mod common;

use common::{ScriptedSock, Sent, admin_response, new_endpoint, setup};
use deku::DekuContainerRead;
use nvme_mi_req::admin::{
    AdminRequestHeader, AdminResponseHeader, GetLogPage, Identify, SecurityProtocol,
};
use nvme_mi_req::{Error, Root};

fn parse_request(sent: &Sent) -> AdminRequestHeader {
    let msg = sent.message();
    let (_, hdr) = AdminRequestHeader::from_bytes((msg.as_slice(), 0)).expect("parse admin request");
    hdr
}

#[test]
fn identify_round_trip() {
    setup();
    let sock = ScriptedSock::new();
    let mut root = Root::new();
    let ep = new_endpoint(&mut root, &sock);

    let structure = [0x5au8; 64];
    sock.respond(admin_response(0, 0x00010203, &structure));

    let args = Identify {
        nsid: 0x11223344,
        cns: 0x01,
        cntid: 0x0005,
        csi: 0x02,
        cns_specific_id: 0x0102,
        uuidx: 0x03,
    };
    let mut data = [0u8; 64];
    let cdw0 = ep.controller(7).identify(&args, 0, &mut data).unwrap();

    assert_eq!(cdw0, 0x00010203);
    assert_eq!(data, structure);

    let state = sock.state();
    let hdr = parse_request(&state.sent[0]);
    assert_eq!(hdr.opcode, 0x06);
    assert_eq!(hdr.ctrl_id, 7);
    assert_eq!(hdr.cdw1, 0x11223344);
    assert_eq!(hdr.cdw10, 0x0005 << 16 | 0x01);
    assert_eq!(hdr.cdw11, 0x02 << 24 | 0x0102);
    assert_eq!(hdr.cdw14, 0x03);
    assert_eq!(hdr.dlen, 64);
    assert_eq!(hdr.flags, 0x1);
    assert_eq!(hdr.doff, 0);
}

#[test]
fn identify_with_offset_sets_doff() {
    setup();
    let sock = ScriptedSock::new();
    let mut root = Root::new();
    let ep = new_endpoint(&mut root, &sock);

    sock.respond(admin_response(0, 0, &[0u8; 16]));

    let args = Identify::default();
    let mut data = [0u8; 16];
    ep.controller(1).identify(&args, 32, &mut data).unwrap();

    let state = sock.state();
    let hdr = parse_request(&state.sent[0]);
    assert_eq!(hdr.flags, 0x3);
    assert_eq!(hdr.doff, 32);
}

#[test]
fn identify_rejects_bad_windows() {
    setup();
    let sock = ScriptedSock::new();
    let mut root = Root::new();
    let ep = new_endpoint(&mut root, &sock);

    let args = Identify::default();
    assert!(matches!(
        ep.controller(1).identify(&args, 0, &mut []),
        Err(Error::InvalidArgument(_))
    ));

    let mut data = [0u8; 16];
    assert!(matches!(
        ep.controller(1).identify(&args, 2, &mut data),
        Err(Error::InvalidArgument(_))
    ));

    assert!(sock.state().sent.is_empty());
}

#[test]
fn identify_is_all_or_nothing() {
    setup();
    let sock = ScriptedSock::new();
    let mut root = Root::new();
    let ep = new_endpoint(&mut root, &sock);

    // 60 of the requested 64 bytes come back
    sock.respond(admin_response(0, 0, &[0u8; 60]));

    let args = Identify::default();
    let mut data = [0u8; 64];
    assert!(matches!(
        ep.controller(1).identify(&args, 0, &mut data),
        Err(Error::Protocol(_))
    ));
}

#[test]
fn device_status_is_returned_verbatim() {
    setup();
    let sock = ScriptedSock::new();
    let mut root = Root::new();
    let ep = new_endpoint(&mut root, &sock);

    sock.respond(admin_response(0x04, 0, &[]));

    let args = Identify::default();
    let mut data = [0u8; 64];
    assert!(matches!(
        ep.controller(1).identify(&args, 0, &mut data),
        Err(Error::Status(0x04))
    ));
}

#[test]
fn get_log_page_segments_transfers() {
    setup();
    let sock = ScriptedSock::new();
    let mut root = Root::new();
    let ep = new_endpoint(&mut root, &sock);

    sock.respond(admin_response(0, 0, &[0xaau8; 4096]));
    sock.respond(admin_response(0, 0, &[0xbbu8; 4096]));

    let args = GetLogPage {
        lid: 0x02,
        lsp: 0x01,
        lsi: 0x0203,
        lpo: 0x1_0000_0004,
        rae: false,
        ..Default::default()
    };
    let mut log = [0u8; 8192];
    let n = ep.controller(3).get_log_page(&args, &mut log).unwrap();

    assert_eq!(n, 8192);
    assert!(log[..4096].iter().all(|&b| b == 0xaa));
    assert!(log[4096..].iter().all(|&b| b == 0xbb));

    let state = sock.state();
    assert_eq!(state.sent.len(), 2);

    let first = parse_request(&state.sent[0]);
    let last = parse_request(&state.sent[1]);

    assert_eq!(first.opcode, 0x02);
    // 4 KiB windows: 1024 dwords, zeroes based
    assert_eq!(first.cdw10 >> 16, 1023);
    assert_eq!(first.cdw11 & 0xffff, 0);
    assert_eq!(first.cdw11 >> 16, 0x0203);
    // the log page offset is fixed; the window offset walks
    assert_eq!(first.cdw12, 0x0000_0004);
    assert_eq!(first.cdw13, 0x0000_0001);
    assert_eq!(first.dlen, 4096);
    assert_eq!(first.flags, 0x1);
    assert_eq!(last.flags, 0x3);
    assert_eq!(last.doff, 4096);

    // every window but the last retains the asynchronous event
    assert_ne!(first.cdw10 & (1 << 15), 0);
    assert_eq!(last.cdw10 & (1 << 15), 0);
    // both carry the page identity
    assert_eq!(first.cdw10 & 0xff, 0x02);
    assert_eq!(first.cdw10 >> 8 & 0x7f, 0x01);
    assert_eq!(last.cdw10 & 0xff, 0x02);
}

#[test]
fn get_log_page_honours_requested_retention_on_final_window() {
    setup();
    let sock = ScriptedSock::new();
    let mut root = Root::new();
    let ep = new_endpoint(&mut root, &sock);

    sock.respond(admin_response(0, 0, &[0u8; 4096]));
    sock.respond(admin_response(0, 0, &[0u8; 4096]));

    let args = GetLogPage {
        lid: 0x02,
        rae: true,
        ..Default::default()
    };
    let mut log = [0u8; 8192];
    ep.controller(3).get_log_page(&args, &mut log).unwrap();

    let state = sock.state();
    let last = parse_request(&state.sent[1]);
    assert_ne!(last.cdw10 & (1 << 15), 0);
}

#[test]
fn short_log_window_ends_the_transfer() {
    setup();
    let sock = ScriptedSock::new();
    let mut root = Root::new();
    let ep = new_endpoint(&mut root, &sock);

    sock.respond(admin_response(0, 0, &[0x11u8; 4096]));
    sock.respond(admin_response(0, 0, &[0x22u8; 2048]));

    let args = GetLogPage {
        lid: 0x02,
        ..Default::default()
    };
    let mut log = [0u8; 8192];
    let n = ep.controller(3).get_log_page(&args, &mut log).unwrap();

    assert_eq!(n, 6144);
    assert_eq!(sock.state().sent.len(), 2);
    assert!(log[4096..6144].iter().all(|&b| b == 0x22));
}

#[test]
fn small_log_reads_in_one_window() {
    setup();
    let sock = ScriptedSock::new();
    let mut root = Root::new();
    let ep = new_endpoint(&mut root, &sock);

    sock.respond(admin_response(0, 0, &[0x33u8; 512]));

    let args = GetLogPage {
        lid: 0x01,
        ..Default::default()
    };
    let mut log = [0u8; 512];
    let n = ep.controller(3).get_log_page(&args, &mut log).unwrap();

    assert_eq!(n, 512);
    let state = sock.state();
    assert_eq!(state.sent.len(), 1);
    let hdr = parse_request(&state.sent[0]);
    assert_eq!(hdr.cdw10 >> 16, 127);
    // a single window is the final window
    assert_eq!(hdr.cdw10 & (1 << 15), 0);
}

#[test]
fn security_send_carries_the_payload() {
    setup();
    let sock = ScriptedSock::new();
    let mut root = Root::new();
    let ep = new_endpoint(&mut root, &sock);

    sock.respond(admin_response(0, 0x01, &[]));

    let prot = SecurityProtocol {
        secp: 0xea,
        spsp0: 0x01,
        spsp1: 0x02,
        nssf: 0x03,
    };
    let payload = [0x44u8; 16];
    let cdw0 = ep.controller(2).security_send(&prot, &payload).unwrap();
    assert_eq!(cdw0, 0x01);

    let state = sock.state();
    let hdr = parse_request(&state.sent[0]);
    assert_eq!(hdr.opcode, 0x81);
    assert_eq!(hdr.cdw10, 0xea010203);
    assert_eq!(hdr.cdw11, 16);
    assert_eq!(hdr.dlen, 16);

    // the payload follows the header on the wire
    let msg = state.sent[0].message();
    assert_eq!(&msg[68..], &payload);
}

#[test]
fn security_receive_returns_data() {
    setup();
    let sock = ScriptedSock::new();
    let mut root = Root::new();
    let ep = new_endpoint(&mut root, &sock);

    let payload = [0x55u8; 32];
    sock.respond(admin_response(0, 0, &payload));

    let prot = SecurityProtocol {
        secp: 0xea,
        ..Default::default()
    };
    let mut data = [0u8; 64];
    let (n, _) = ep.controller(2).security_receive(&prot, &mut data).unwrap();

    assert_eq!(n, 32);
    assert_eq!(&data[..32], &payload);

    let state = sock.state();
    let hdr = parse_request(&state.sent[0]);
    assert_eq!(hdr.opcode, 0x82);
    assert_eq!(hdr.cdw11, 64);
}

#[test]
fn xfer_rejects_bidirectional_data() {
    setup();
    let sock = ScriptedSock::new();
    let mut root = Root::new();
    let ep = new_endpoint(&mut root, &sock);

    let mut req_hdr = AdminRequestHeader::new(1, 0x06);
    let mut resp_hdr = AdminResponseHeader::default();
    let req_data = [0u8; 8];
    let mut resp_data = [0u8; 8];
    assert!(matches!(
        ep.controller(1)
            .xfer(&mut req_hdr, &req_data, &mut resp_hdr, &mut resp_data, 0),
        Err(Error::InvalidArgument(_))
    ));
    assert!(sock.state().sent.is_empty(), "no I/O took place");
}

#[test]
fn xfer_rejects_bad_offsets() {
    setup();
    let sock = ScriptedSock::new();
    let mut root = Root::new();
    let ep = new_endpoint(&mut root, &sock);

    let mut req_hdr = AdminRequestHeader::new(1, 0x06);
    let mut resp_hdr = AdminResponseHeader::default();

    let mut resp_data = [0u8; 8];
    assert!(matches!(
        ep.controller(1)
            .xfer(&mut req_hdr, &[], &mut resp_hdr, &mut resp_data, 2),
        Err(Error::InvalidArgument(_))
    ));

    // an offset without a response window has nothing to offset into
    assert!(matches!(
        ep.controller(1)
            .xfer(&mut req_hdr, &[], &mut resp_hdr, &mut [], 4),
        Err(Error::InvalidArgument(_))
    ));

    assert!(sock.state().sent.is_empty());
}

#[test]
fn xfer_fills_the_window_description() {
    setup();
    let sock = ScriptedSock::new();
    let mut root = Root::new();
    let ep = new_endpoint(&mut root, &sock);

    sock.respond(admin_response(0, 0, &[0u8; 32]));

    let mut req_hdr = AdminRequestHeader::new(4, 0x06);
    req_hdr.cdw10 = 0x01;
    let mut resp_hdr = AdminResponseHeader::default();
    let mut resp_data = [0u8; 32];
    let n = ep
        .controller(4)
        .xfer(&mut req_hdr, &[], &mut resp_hdr, &mut resp_data, 8)
        .unwrap();

    assert_eq!(n, 32);
    let state = sock.state();
    let hdr = parse_request(&state.sent[0]);
    assert_eq!(hdr.flags, 0x3);
    assert_eq!(hdr.dlen, 32);
    assert_eq!(hdr.doff, 8);
    assert_eq!(hdr.cdw10, 0x01);
    assert_eq!(hdr.ctrl_id, 4);
}
