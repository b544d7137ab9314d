//! DCC security utilities.
//!
//! Provides defenses against common DCC attack vectors:
//! - **Path traversal**: offered filenames are sanitized and the resolved
//!   path is verified to stay within the download directory.
//! - **Hostile offers**: classic offers from private, loopback and
//!   link-local addresses can be refused, as can oversized files.
//! - **Filename collision**: [`safe_download_path`] appends numeric suffixes
//!   when a completed file of the same name already exists.

use std::net::IpAddr;
use std::path::{Path, PathBuf};

use super::error::DccError;
use super::parser::SendRequest;
use super::transfer::short_name;
use crate::config::DccConfig;

const MAX_FILENAME_BYTES: usize = 255;

/// Check if an IP address is private/loopback
pub fn is_private_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_broadcast()
                || v4.is_unspecified()
        }
        IpAddr::V6(v6) => v6.is_loopback() || v6.is_unspecified(),
    }
}

/// Reduce an offered filename to a safe single path component.
///
/// Directory parts (either separator), control characters, `:` and leading
/// dots are removed. Returns `None` when nothing usable is left.
pub fn sanitize_filename(filename: &str) -> Option<String> {
    let name = short_name(filename);
    let cleaned: String = name
        .chars()
        .filter(|c| !c.is_control() && !matches!(c, '/' | '\\' | ':'))
        .collect();
    let cleaned = cleaned.trim_start_matches('.').trim_end();
    if cleaned.is_empty() {
        return None;
    }

    let mut end = cleaned.len().min(MAX_FILENAME_BYTES);
    while !cleaned.is_char_boundary(end) {
        end -= 1;
    }
    Some(cleaned[..end].to_string())
}

/// Where an offered file lands inside `download_dir`, without collision
/// handling. An existing file at this path is a resume candidate.
pub fn download_target(download_dir: &Path, filename: &str) -> Option<PathBuf> {
    let sanitized = sanitize_filename(filename)?;
    let canonical_dir = download_dir
        .canonicalize()
        .unwrap_or_else(|_| download_dir.to_path_buf());
    if !canonical_dir.join(&sanitized).starts_with(&canonical_dir) {
        return None;
    }
    Some(download_dir.join(sanitized))
}

/// Like [`download_target`], but never an existing file: `name_1.ext`,
/// `name_2.ext` ... are tried instead.
pub fn safe_download_path(download_dir: &Path, filename: &str) -> Option<PathBuf> {
    let path = download_target(download_dir, filename)?;
    if !path.exists() {
        return Some(path);
    }

    let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or("file");
    let ext = path.extension().and_then(|s| s.to_str()).unwrap_or("");
    (1..1000)
        .map(|i| {
            if ext.is_empty() {
                format!("{}_{}", stem, i)
            } else {
                format!("{}_{}.{}", stem, i, ext)
            }
        })
        .map(|name| download_dir.join(name))
        .find(|candidate| !candidate.exists())
}

/// Apply the size and address policy to an inbound SEND offer.
pub fn vet_offer(offer: &SendRequest, config: &DccConfig) -> Result<(), DccError> {
    if let Some(size) = offer.size {
        if config.max_file_size > 0 && size > config.max_file_size {
            return Err(DccError::Rejected(format!(
                "{} is {} bytes, over the {} byte limit",
                offer.filename, size, config.max_file_size
            )));
        }
    }

    // Reverse offers carry our peer's address only for show; we never dial it.
    if config.reject_private_ips && !offer.is_reverse() {
        let ip = IpAddr::V4(offer.ip());
        if is_private_ip(&ip) {
            return Err(DccError::Rejected(format!(
                "offer from private address {}",
                ip
            )));
        }
    }
    Ok(())
}
