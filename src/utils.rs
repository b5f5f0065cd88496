// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::fmt::Write;

use rand::RngExt;

/// Generates a random Download command key (8 bytes) and returns:
/// - `[u8; 8]` for bookkeeping
/// - `String` containing its hexadecimal representation (no prefix)
pub fn generate_command_key() -> ([u8; 8], String) {
    let mut raw = [0u8; 8];
    rand::rng().fill(&mut raw);

    let mut hex = String::with_capacity(16);
    for byte in &raw {
        write!(&mut hex, "{byte:02x}").expect("Writing to String cannot fail");
    }

    (raw, hex)
}

/// Encodes an inform event code as an `Events.*` leaf segment: spaces become
/// underscores, anything else a path parser would choke on is folded to an
/// underscore too.
pub fn encode_event_code(code: &str) -> String {
    code.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}
