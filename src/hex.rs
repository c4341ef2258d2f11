// Copyright (C) 2022 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Quick wrapper around `pretty-hex` to limit output.

use pretty_hex::PrettyHex;

/// Formats at most `max_bytes` of `inner` as a hex dump, noting elision.
pub(crate) struct LimitedHex<'a> {
    inner: &'a [u8],
    max_bytes: usize,
}

impl<'a> LimitedHex<'a> {
    pub(crate) fn new(inner: &'a [u8], max_bytes: usize) -> Self {
        Self { inner, max_bytes }
    }
}

impl std::fmt::Debug for LimitedHex<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let print = self.inner.get(..self.max_bytes);
        let (print, omitted) = match print {
            Some(p) => (p, Some(self.inner.len() - self.max_bytes)),
            None => (self.inner, None),
        };
        writeln!(f, "Length: {0} (0x{0:x}) bytes", self.inner.len())?;
        writeln!(
            f,
            "{:#?}",
            print.hex_conf(pretty_hex::HexConfig {
                title: false,
                ..Default::default()
            })
        )?;
        if let Some(o) = omitted {
            write!(f, "\n...{0} (0x{0:x}) bytes not shown...", o)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::LimitedHex;

    #[test]
    fn elision() {
        let long = [0u8; 128];
        let out = format!("{:#?}", LimitedHex::new(&long[..], 16));
        assert!(out.contains("Length: 128"));
        assert!(out.contains("112 (0x70) bytes not shown"));
        let out = format!("{:#?}", LimitedHex::new(&long[..], 256));
        assert!(!out.contains("not shown"));
    }
}
