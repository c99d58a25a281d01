//! Input validation and sanitization
//!
//! Profile names become file names and service names become container names
//! passed to the container runtime, so both are restricted to a small
//! character set. Strings copied into the status JSON come from outside the
//! control plane (profile comments, health-check output) and are scrubbed.

use crate::error::{HubError, HubResult};
use std::net::IpAddr;

/// Maximum length for profile names
const MAX_PROFILE_NAME_LEN: usize = 64;

/// Maximum length for service and container names (DNS label limit)
const MAX_SERVICE_NAME_LEN: usize = 63;

/// Maximum length for error messages shown to users
const MAX_ERROR_MESSAGE_LEN: usize = 500;

/// Health-check excerpts embedded in status output
pub const MAX_HEALTH_DETAIL_LEN: usize = 120;

fn check_name(kind: &str, name: &str, max_len: usize) -> HubResult<()> {
    if name.is_empty() {
        return Err(HubError::InvalidParameter(format!("{} cannot be empty", kind)));
    }

    if name.len() > max_len {
        return Err(HubError::InvalidParameter(format!(
            "{} too long (max {} characters)",
            kind, max_len
        )));
    }

    // Only allow alphanumeric, dash, underscore
    // This prevents path separators, shell metacharacters and option injection
    for c in name.chars() {
        if !c.is_ascii_alphanumeric() && c != '-' && c != '_' {
            return Err(HubError::InvalidParameter(format!(
                "Invalid {} '{}': contains invalid character '{}'",
                kind.to_lowercase(),
                name,
                c.escape_default()
            )));
        }
    }

    if name.starts_with('-') {
        return Err(HubError::InvalidParameter(format!("{} cannot start with dash", kind)));
    }

    Ok(())
}

/// Validate a VPN profile name.
///
/// Profile names map one-to-one onto `<name>.conf` in the profiles directory.
/// `active` is reserved for the active-profile pointer.
pub fn validate_profile_name(name: &str) -> HubResult<()> {
    check_name("Profile name", name, MAX_PROFILE_NAME_LEN)?;
    if name == "active" {
        return Err(HubError::InvalidParameter(
            "Profile name 'active' is reserved".to_string(),
        ));
    }
    Ok(())
}

/// Validate a compose service or container name
pub fn validate_service_name(name: &str) -> HubResult<()> {
    check_name("Service name", name, MAX_SERVICE_NAME_LEN)
}

/// Validate a public domain name used for certificate issuance
pub fn validate_domain(domain: &str) -> HubResult<()> {
    if domain.is_empty() || domain.len() > 253 {
        return Err(HubError::InvalidParameter(format!("Invalid domain length: {}", domain.len())));
    }

    if domain.parse::<IpAddr>().is_ok() {
        return Err(HubError::InvalidParameter(format!(
            "Domain cannot be an IP address: {}",
            domain
        )));
    }

    for label in domain.split('.') {
        if label.is_empty() || label.len() > 63 {
            return Err(HubError::InvalidParameter(format!("Invalid domain label in {}", domain)));
        }
        if label.starts_with('-') || label.ends_with('-') {
            return Err(HubError::InvalidParameter(format!("Invalid domain label in {}", domain)));
        }
        if !label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
            return Err(HubError::InvalidParameter(format!(
                "Invalid domain character in {}",
                domain
            )));
        }
    }

    Ok(())
}

/// Scrub a string before it is embedded in status JSON.
///
/// Drops C0/C1 control characters, DEL, double quotes and backslashes.
pub fn sanitize_json_string(value: &str) -> String {
    value
        .chars()
        .filter(|c| {
            let code = *c as u32;
            !(code <= 0x1f || (0x7f..=0x9f).contains(&code) || *c == '"' || *c == '\\')
        })
        .collect()
}

/// Sanitize and cut a string to at most `max_chars` characters
pub fn sanitize_truncated(value: &str, max_chars: usize) -> String {
    let clean = sanitize_json_string(value.trim());
    if clean.chars().count() <= max_chars {
        return clean;
    }
    let mut out: String = clean.chars().take(max_chars.saturating_sub(3)).collect();
    out.push_str("...");
    out
}

/// Sanitize error messages to prevent information disclosure
pub fn sanitize_error_message(stderr: &str) -> String {
    let mut sanitized = stderr.trim().to_string();

    if sanitized.len() > MAX_ERROR_MESSAGE_LEN {
        let mut cut = MAX_ERROR_MESSAGE_LEN;
        while !sanitized.is_char_boundary(cut) {
            cut -= 1;
        }
        sanitized.truncate(cut);
        sanitized.push_str("... (truncated)");
    }

    sanitized
}
