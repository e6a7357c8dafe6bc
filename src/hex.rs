// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Bounded hex dumps, so a hostile peer can't blow up error messages.

use pretty_hex::PrettyHex;

pub struct LimitedHex<'a>(&'a [u8], usize);

impl<'a> LimitedHex<'a> {
    pub fn new(inner: &'a [u8], max_bytes: usize) -> Self {
        Self(inner, max_bytes)
    }
}

impl<'a> std::fmt::Debug for LimitedHex<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let LimitedHex(data, max_bytes) = *self;
        writeln!(f, "Length: {0} (0x{0:x}) bytes", data.len())?;
        let shown = std::cmp::min(data.len(), max_bytes);
        writeln!(
            f,
            "{:#?}",
            data[..shown].hex_conf(pretty_hex::HexConfig {
                title: false,
                ..Default::default()
            })
        )?;
        if shown < data.len() {
            write!(f, "\n...{0} (0x{0:x}) bytes not shown...", data.len() - shown)?;
        }
        Ok(())
    }
}
