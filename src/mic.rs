// SPDX-License-Identifier: GPL-3.0-only
/*
 * Copyright (c) 2025 Code Construct
 */
//! Message integrity check.
//!
//! Out-of-band NVMe-MI messages carry a trailing CRC-32C word computed over
//! the whole message, header and payload together. The word travels
//! little-endian on the wire.

use crc::{CRC_32_ISCSI, Crc};

const ISCSI: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

/// Compute the integrity check word for a message given as scattered spans.
///
/// Spans are folded in order; zero-length spans contribute nothing.
pub fn message_integrity(spans: &[&[u8]]) -> u32 {
    let mut digest = ISCSI.digest();
    for span in spans {
        digest.update(span);
    }
    digest.finalize()
}
