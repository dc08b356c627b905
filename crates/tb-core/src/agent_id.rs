//! Agent identity derivation
//!
//! Identities travel in handshake transcripts and registry keys, so they
//! are normalized to lowercase `[a-z0-9_-]`, at most 64 characters, never
//! empty.

/// Fallback identity when nothing usable can be derived
pub const FALLBACK_AGENT_ID: &str = "agent";

/// Maximum identity length in characters
pub const MAX_AGENT_ID_LEN: usize = 64;

/// Environment variable consulted before hostname and username
pub const AGENT_ID_ENV: &str = "TERMBRIDGE_AGENT_ID";

/// Normalize a raw identity.
///
/// Trims, lowercases, maps every character outside `[a-z0-9_-]` to `-`,
/// strips leading/trailing `-`, caps at 64 characters (re-stripping a
/// trailing `-` the cap may expose). An empty result falls back to
/// `"agent"`.
pub fn sanitize(raw: &str) -> String {
    let mapped: String = raw
        .trim()
        .to_lowercase()
        .chars()
        .map(|c| {
            if c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-' {
                c
            } else {
                '-'
            }
        })
        .collect();

    let mut id = mapped.trim_matches('-').to_string();
    if id.len() > MAX_AGENT_ID_LEN {
        id.truncate(MAX_AGENT_ID_LEN);
        id = id.trim_end_matches('-').to_string();
    }

    if id.is_empty() {
        FALLBACK_AGENT_ID.to_string()
    } else {
        id
    }
}

/// Suffix an identity for duplicate resolution: attempt 1 keeps the
/// base, attempt n yields `{base}-{n}`.
pub fn with_suffix(base: &str, attempt: u32) -> String {
    let base = sanitize(base);
    if attempt <= 1 {
        base
    } else {
        format!("{}-{}", base, attempt)
    }
}

/// Derive the default identity: `$TERMBRIDGE_AGENT_ID` if set, else the
/// hostname, else the username, else `"agent"`. Always sanitized.
pub fn default_agent_id() -> String {
    if let Ok(explicit) = std::env::var(AGENT_ID_ENV) {
        if !explicit.trim().is_empty() {
            return sanitize(&explicit);
        }
    }

    let hostname = gethostname::gethostname().to_string_lossy().into_owned();
    if !hostname.trim().is_empty() {
        return sanitize(&hostname);
    }

    let username = whoami::username();
    if !username.trim().is_empty() {
        return sanitize(&username);
    }

    FALLBACK_AGENT_ID.to_string()
}
