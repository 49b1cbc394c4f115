// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Heartbeat-token stripper: the cron heartbeat task
//! and any other silent-by-default prompt can have the agent reply with the
//! bare token `HEARTBEAT_OK` to mean "nothing to report". Before a reply is
//! delivered to a channel, occurrences of the token — bare or wrapped in
//! common markdown emphasis — are stripped; if nothing is left, the caller
//! sends nothing.

use std::sync::OnceLock;

use regex::Regex;

const TOKEN: &str = "HEARTBEAT_OK";

fn pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        // Alternation lists each wrapped form explicitly — the `regex` crate
        // has no backreferences, so a wrapper can't be expressed generically.
        Regex::new(r"\*\*HEARTBEAT_OK\*\*|~~HEARTBEAT_OK~~|`HEARTBEAT_OK`|HEARTBEAT_OK").unwrap()
    })
}

/// Remove every occurrence of the heartbeat token (bare, `**bold**`,
/// `` `code` ``, or `~~strikethrough~~`) and trim the result. Text with no
/// occurrence of the token is returned unchanged (modulo the trim).
pub fn strip_heartbeat_token(text: &str) -> String {
    pattern().replace_all(text, "").trim().to_string()
}

/// `true` if stripping `text` leaves nothing to deliver.
pub fn is_suppressed(text: &str) -> bool {
    strip_heartbeat_token(text).is_empty()
}
