//! Syntax validators for the fields of an update request element

use std::net::{Ipv4Addr, Ipv6Addr};

/// Total name length accepted in an update, leaving headroom for the
/// account's domain suffix within the 255-octet DNS limit.
pub const MAX_SUBDOMAIN_LEN: usize = 255 - 128;
pub const MAX_LABEL_LEN: usize = 63;

/// Record types publishers may register.
const SUPPORTED_TYPES: [&str; 6] = ["A", "CNAME", "MX", "A+", "TXT", "HTTP"];

/// Check a subdomain name: total length, label lengths, and label characters.
/// Labels must start and end with an alphanumeric character; hyphens are
/// allowed in the interior. The empty string is valid and addresses the
/// account's apex. An empty label (as in `a..b`) is rejected.
pub fn is_valid_subdomain(subdomain: &str) -> bool {
    if subdomain.len() > MAX_SUBDOMAIN_LEN {
        return false;
    }
    if subdomain.is_empty() {
        return true;
    }

    for label in subdomain.split('.') {
        if label.is_empty() || label.len() > MAX_LABEL_LEN {
            return false;
        }
        let bytes = label.as_bytes();
        if !bytes[0].is_ascii_alphanumeric() || !bytes[bytes.len() - 1].is_ascii_alphanumeric() {
            return false;
        }
        if !bytes[1..bytes.len() - 1]
            .iter()
            .all(|b| b.is_ascii_alphanumeric() || *b == b'-')
        {
            return false;
        }
    }

    true
}

pub fn is_valid_rrtype(rrtype: &str) -> bool {
    SUPPORTED_TYPES.contains(&rrtype)
}

/// Check record data against its type.
pub fn is_valid_rrdata(rrdata: &str, rrtype: &str) -> bool {
    match rrtype {
        "A" | "A+" => {
            // Only dotted-quad notation, no hostnames
            if !rrdata.bytes().all(|b| b.is_ascii_digit() || b == b'.') {
                return false;
            }
            rrdata.parse::<Ipv4Addr>().is_ok()
        }
        "AAAA" => rrdata.contains(':') && rrdata.parse::<Ipv6Addr>().is_ok(),
        "CNAME" | "NS" => is_valid_subdomain(rrdata),
        "MX" => {
            let parts: Vec<&str> = rrdata.split_whitespace().collect();
            if parts.len() != 2 {
                return false;
            }
            parts[0].parse::<i32>().is_ok() && is_valid_subdomain(parts[1])
        }
        // TXT and HTTP data is free-form; a blank type places no constraint
        "TXT" | "HTTP" | "" => true,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_subdomain_accepts_normal_names() {
        assert!(is_valid_subdomain("foo-bar.com"));
        assert!(is_valid_subdomain("www"));
        assert!(is_valid_subdomain("a.b.c"));
        assert!(is_valid_subdomain(""));
    }

    #[test]
    fn test_subdomain_rejects_bad_labels() {
        assert!(!is_valid_subdomain("a..b"));
        assert!(!is_valid_subdomain("-foo.com"));
        assert!(!is_valid_subdomain("foo-.com"));
        assert!(!is_valid_subdomain("foo_bar.com"));

        let long_label: String = std::iter::repeat('x').take(70).collect();
        assert!(!is_valid_subdomain(&long_label));

        let long_name = vec!["abcdefgh"; 20].join(".");
        assert!(long_name.len() > MAX_SUBDOMAIN_LEN);
        assert!(!is_valid_subdomain(&long_name));
    }

    #[test]
    fn test_rrtype_set() {
        for t in &["A", "CNAME", "MX", "A+", "TXT", "HTTP"] {
            assert!(is_valid_rrtype(t));
        }
        assert!(!is_valid_rrtype("SOA"));
        assert!(!is_valid_rrtype("a"));
    }

    #[test]
    fn test_rrdata_a_record() {
        assert!(is_valid_rrdata("1.2.3.4", "A"));
        assert!(is_valid_rrdata("10.0.0.1", "A+"));
        assert!(!is_valid_rrdata("1.2.3.256", "A"));
        assert!(!is_valid_rrdata("example.com", "A"));
        assert!(!is_valid_rrdata("1.2.3", "A"));
    }

    #[test]
    fn test_rrdata_mx_record() {
        assert!(is_valid_rrdata("10 mail.example.com", "MX"));
        assert!(!is_valid_rrdata("mail.example.com", "MX"));
        assert!(!is_valid_rrdata("ten mail.example.com", "MX"));
    }

    proptest! {
        #[test]
        fn test_wellformed_labels_accepted(
            name in "[a-z0-9]([a-z0-9-]{0,20}[a-z0-9])?(\\.[a-z0-9]([a-z0-9-]{0,20}[a-z0-9])?){0,3}"
        ) {
            prop_assert!(is_valid_subdomain(&name));
        }
    }
}
