use std::collections::BTreeSet;

/// Reserved and special-use names (RFC 2606, `.local`) that are never proxied nor certified.
pub const RESERVED_NAMES: [&str; 5] = ["localhost", "test", "invalid", "example", "local"];

/// Top-level domains of the ICANN root zone, one per line, IDNs in A-label form.
const ICANN_TLDS: &str = include_str!("icann_tlds.txt");

/// ICANN-delegated TLDs. These resolve through the regular DNS, so the CA is
/// excluded from them and the PAC script sends them direct.
pub fn icann_tlds() -> impl Iterator<Item = &'static str> {
    ICANN_TLDS
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
}

/// The fixed policy used when `[naming]` is absent: every ICANN TLD excluded.
#[derive(Debug, Clone, Copy, Default)]
pub struct IcannExclusions;

impl NamingPolicy for IcannExclusions {
    fn permitted_suffixes(&self) -> Vec<String> {
        Vec::new()
    }

    fn excluded_names(&self) -> Vec<String> {
        icann_tlds().map(str::to_owned).collect()
    }
}

/// Whether `policy` constrains issuance beyond the always-reserved names.
pub fn has_constraints(policy: &dyn NamingPolicy) -> bool {
    !permitted_suffixes(policy).is_empty()
        || skipped_names(policy)
            .iter()
            .any(|name| !RESERVED_NAMES.contains(&name.as_str()))
}

/// Supplies the name constraints the CA is issued under and the PAC script skips.
pub trait NamingPolicy {
    /// Suffixes the CA may issue leaf certificates under. Empty means no allow-list.
    fn permitted_suffixes(&self) -> Vec<String>;

    /// Top-level names that must never be routed through the proxy.
    fn excluded_names(&self) -> Vec<String>;
}

/// Excluded names plus [`RESERVED_NAMES`], normalized and deduplicated.
pub fn skipped_names(policy: &dyn NamingPolicy) -> Vec<String> {
    policy
        .excluded_names()
        .into_iter()
        .chain(RESERVED_NAMES.iter().map(|name| (*name).to_owned()))
        .filter_map(|name| normalize_name(&name))
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

pub fn permitted_suffixes(policy: &dyn NamingPolicy) -> Vec<String> {
    policy
        .permitted_suffixes()
        .iter()
        .filter_map(|name| normalize_name(name))
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

fn normalize_name(name: &str) -> Option<String> {
    let name = name.trim().trim_matches('.');
    if name.is_empty() {
        return None;
    }
    Some(name.to_ascii_lowercase())
}

#[cfg(test)]
mod tests {
    use super::{
        IcannExclusions, NamingPolicy, RESERVED_NAMES, has_constraints, icann_tlds,
        permitted_suffixes, skipped_names,
    };

    struct FixedPolicy {
        permitted: Vec<&'static str>,
        excluded: Vec<&'static str>,
    }

    impl NamingPolicy for FixedPolicy {
        fn permitted_suffixes(&self) -> Vec<String> {
            self.permitted.iter().map(|name| (*name).to_owned()).collect()
        }

        fn excluded_names(&self) -> Vec<String> {
            self.excluded.iter().map(|name| (*name).to_owned()).collect()
        }
    }

    #[test]
    fn skipped_names_always_include_reserved_names() {
        let policy = FixedPolicy {
            permitted: Vec::new(),
            excluded: Vec::new(),
        };
        let skipped = skipped_names(&policy);
        for reserved in RESERVED_NAMES {
            assert!(skipped.iter().any(|name| name == reserved), "missing {reserved}");
        }
        assert_eq!(skipped.len(), RESERVED_NAMES.len());
    }

    #[test]
    fn skipped_names_are_normalized_and_deduplicated() {
        let policy = FixedPolicy {
            permitted: Vec::new(),
            excluded: vec!["COM", ".net.", "local", "  ", "com"],
        };
        assert_eq!(
            skipped_names(&policy),
            vec!["com", "example", "invalid", "local", "localhost", "net", "test"]
        );
    }

    #[test]
    fn permitted_suffixes_drop_blank_entries() {
        let policy = FixedPolicy {
            permitted: vec!["Forever", "", "hns."],
            excluded: Vec::new(),
        };
        assert_eq!(permitted_suffixes(&policy), vec!["forever", "hns"]);
    }

    #[test]
    fn icann_list_covers_legacy_country_and_idn_tlds() {
        let tlds: Vec<_> = icann_tlds().collect();
        for tld in ["com", "org", "net", "uk", "de", "app", "xn--p1ai"] {
            assert!(tlds.contains(&tld), "missing {tld}");
        }
        assert!(
            tlds.iter().all(|tld| *tld == tld.to_ascii_lowercase() && tld.is_ascii()),
            "entries should be lower-case A-labels"
        );
        assert!(!tlds.contains(&"forever"), "handshake names must not be excluded");
    }

    #[test]
    fn icann_exclusions_feed_skip_list() {
        let skipped = skipped_names(&IcannExclusions);
        assert!(skipped.iter().any(|name| name == "com"));
        assert!(skipped.iter().any(|name| name == "localhost"));
        assert!(has_constraints(&IcannExclusions));
    }

    #[test]
    fn reserved_names_alone_are_not_constraints() {
        let empty = FixedPolicy {
            permitted: Vec::new(),
            excluded: vec!["LOCAL"],
        };
        assert!(!has_constraints(&empty));

        let allow_list = FixedPolicy {
            permitted: vec!["forever"],
            excluded: Vec::new(),
        };
        assert!(has_constraints(&allow_list));
    }
}
