//! Inbound message classification and catalog URL parsing. Pure; no I/O.

use relay_job::{ItemId, RegionCode};

/// Longer ids are rejected outright; the id doubles as a storage key.
pub const MAX_ITEM_ID_LEN: usize = 14;

const CATALOG_DOMAINS: [&str; 2] = ["apps.apple.com", "itunes.apple.com"];

const REQUEST_PREFIX: &str = "/request";
const REBOOT_PREFIX: &str = "/reboot";
const DELETE_PREFIX: &str = "/delete";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemRequest {
    pub item_id: ItemId,
    pub region: RegionCode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum RejectReason {
    #[error("no url after command")]
    MissingUrl,
    #[error("no catalog domain in message")]
    UnrecognizedDomain,
    #[error("no numeric item id in url")]
    MissingItemId,
    #[error("item id longer than {MAX_ITEM_ID_LEN} characters")]
    ItemIdTooLong,
}

pub type ParsedRequest = Result<ItemRequest, RejectReason>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Request(ParsedRequest),
    Reboot,
    Delete(ParsedRequest),
    Unrecognized,
}

pub fn parse_command(text: &str) -> Command {
    let text = text.trim();

    // Prefix commands win over the bare-URL form, so `/delete <url>` is never
    // also treated as a request.
    if text.starts_with(REBOOT_PREFIX) {
        return Command::Reboot;
    }
    if text.starts_with(DELETE_PREFIX) {
        return Command::Delete(parse_catalog_text(text));
    }
    if text.starts_with(REQUEST_PREFIX) || mentions_catalog_domain(text) {
        return Command::Request(parse_item_request(text));
    }
    Command::Unrecognized
}

pub fn mentions_catalog_domain(text: &str) -> bool {
    CATALOG_DOMAINS.iter().any(|d| text.contains(d))
}

/// `/request <url>` reads the token after the prefix; anything else is read
/// from the whole text. Either way a catalog domain must be present.
pub fn parse_item_request(text: &str) -> ParsedRequest {
    let text = text.trim();
    if text.starts_with(REQUEST_PREFIX) {
        let url = text
            .split_whitespace()
            .nth(1)
            .ok_or(RejectReason::MissingUrl)?;
        return parse_catalog_text(url);
    }
    parse_catalog_text(text)
}

fn parse_catalog_text(text: &str) -> ParsedRequest {
    if !mentions_catalog_domain(text) {
        return Err(RejectReason::UnrecognizedDomain);
    }
    extract_item(text)
}

fn extract_item(s: &str) -> ParsedRequest {
    let item_id = find_item_id(s).ok_or(RejectReason::MissingItemId)?;
    if item_id.len() > MAX_ITEM_ID_LEN {
        return Err(RejectReason::ItemIdTooLong);
    }
    let region = find_region(s)
        .map(|r| RegionCode(r.to_string()))
        .unwrap_or_default();

    Ok(ItemRequest {
        item_id: ItemId(item_id.to_string()),
        region,
    })
}

/// First `/id<digits>` occurrence.
fn find_item_id(s: &str) -> Option<&str> {
    for (idx, pat) in s.match_indices("/id") {
        let rest = &s[idx + pat.len()..];
        let end = rest
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(rest.len());
        if end > 0 {
            return Some(&rest[..end]);
        }
    }
    None
}

fn is_word_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_'
}

/// Two word characters directly after `apple.com/`, followed by `/`.
fn find_region(s: &str) -> Option<&str> {
    for (idx, pat) in s.match_indices("apple.com/") {
        let rest = &s[idx + pat.len()..];
        let b = rest.as_bytes();
        if b.len() >= 3 && is_word_byte(b[0]) && is_word_byte(b[1]) && b[2] == b'/' {
            return Some(&rest[..2]);
        }
    }
    None
}
