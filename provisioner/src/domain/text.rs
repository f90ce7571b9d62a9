//! Text shaping for persisted messages and appliance identifiers.

use std::sync::LazyLock;

use regex::Regex;

/// Maximum stored length of a timeline detail.
pub const MAX_DETAIL: usize = 2000;
/// Maximum stored length of a job summary message.
pub const MAX_MESSAGE: usize = 1000;
/// Maximum stored length of a provider error.
pub const MAX_INFRA_ERROR: usize = 1500;

const TRUNCATED: &str = "...(truncated)";

static ANSI_ESCAPE: LazyLock<Regex> = LazyLock::new(|| {
    #[allow(clippy::expect_used)]
    Regex::new(r"\x1B\[[;\d]*[A-Za-z]").expect("valid regex")
});

static HEX_ESCAPE: LazyLock<Regex> = LazyLock::new(|| {
    #[allow(clippy::expect_used)]
    Regex::new(r"\\x[0-9A-Fa-f]{2}").expect("valid regex")
});

/// Remove ANSI color sequences and literal `\xNN` escapes.
#[must_use]
pub fn strip_control(input: &str) -> String {
    let without_ansi = ANSI_ESCAPE.replace_all(input, "");
    HEX_ESCAPE.replace_all(&without_ansi, "").into_owned()
}

/// Cut `input` to at most `max` characters, marking the cut.
#[must_use]
pub fn clamp(input: &str, max: usize) -> String {
    if input.chars().count() <= max {
        return input.to_string();
    }
    let mut out: String = input.chars().take(max).collect();
    out.push_str(TRUNCATED);
    out
}

/// Control-sequence stripping followed by clamping.
#[must_use]
pub fn sanitize(input: &str, max: usize) -> String {
    clamp(strip_control(input).trim(), max)
}

/// Appliance interface names accept only `[A-Za-z0-9_]`, max 16 chars.
#[must_use]
pub fn interface_name(requester: &str) -> String {
    let cleaned: String = requester
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .take(16)
        .collect();
    if cleaned.is_empty() {
        "vdi".to_string()
    } else {
        cleaned
    }
}

/// Gateway address of a desktop's /24: `a.b.c.1`.
#[must_use]
pub fn gateway_ip(local_ip: &str) -> Option<String> {
    let octets: Vec<&str> = local_ip.split('.').collect();
    if octets.len() != 4 || octets.iter().any(|o| o.parse::<u8>().is_err()) {
        return None;
    }
    Some(format!("{}.{}.{}.1", octets[0], octets[1], octets[2]))
}
