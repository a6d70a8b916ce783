// ===============================
// src/linkid.rs
// ===============================
//
// Order link ids carry the deal id and the order's role:
//   {deal}-entry, {deal}-tp, {deal}-tp-{unix}-{n}, {deal}-so-{i}
//

use rand::Rng;

use crate::domain::OrderKind;

pub fn new_deal_id() -> String {
    let bytes: [u8; 6] = rand::thread_rng().gen();
    hex::encode(bytes)
}

pub fn entry(deal_id: &str) -> String { format!("{deal_id}-entry") }

pub fn safety(deal_id: &str, index: usize) -> String { format!("{deal_id}-so-{index}") }

/// Take-profit link with a unique suffix, so a rebuilt TP never collides
/// with the cancelled one.
pub fn take_profit(deal_id: &str, unix: i64, seq: u64) -> String {
    format!("{deal_id}-tp-{unix}-{}", seq % 1000)
}

pub fn deal_id_of(link_id: &str) -> Option<&str> {
    let id = if let Some(d) = link_id.strip_suffix("-entry") {
        d
    } else if let Some(d) = link_id.strip_suffix("-tp") {
        d
    } else if let Some(i) = link_id.rfind("-tp-") {
        &link_id[..i]
    } else if let Some(i) = link_id.rfind("-so-") {
        &link_id[..i]
    } else {
        return None;
    };
    if id.is_empty() { None } else { Some(id) }
}

pub fn is_tp(link_id: &str) -> bool { link_id.ends_with("-tp") || link_id.contains("-tp-") }

pub fn is_safety(link_id: &str) -> bool { link_id.contains("-so-") }

pub fn is_entry(link_id: &str) -> bool { link_id.ends_with("-entry") }

pub fn kind_of(link_id: &str) -> OrderKind {
    if is_tp(link_id) {
        OrderKind::TakeProfit
    } else if is_safety(link_id) {
        OrderKind::Safety
    } else if is_entry(link_id) {
        OrderKind::Entry
    } else {
        OrderKind::Other
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_every_role() {
        assert_eq!(deal_id_of("abc123-entry"), Some("abc123"));
        assert_eq!(deal_id_of("abc123-tp"), Some("abc123"));
        assert_eq!(deal_id_of("abc123-tp-1700000000-42"), Some("abc123"));
        assert_eq!(deal_id_of("abc123-so-3"), Some("abc123"));
        assert_eq!(deal_id_of("manual-order"), None);
        assert_eq!(deal_id_of("-entry"), None);
    }

    #[test]
    fn roles() {
        assert!(is_tp("abc-tp"));
        assert!(is_tp(&take_profit("abc", 1, 1001)));
        assert!(take_profit("abc", 5, 1001).ends_with("-5-1"));
        assert!(!is_tp("abc-so-1"));
        assert_eq!(kind_of("abc-so-2"), OrderKind::Safety);
        assert_eq!(kind_of("abc-entry"), OrderKind::Entry);
    }

    #[test]
    fn deal_id_is_12_hex() {
        let id = new_deal_id();
        assert_eq!(id.len(), 12);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        assert_ne!(id, new_deal_id());
    }
}
