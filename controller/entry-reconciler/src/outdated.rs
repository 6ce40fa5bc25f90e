// Copyright (c) Microsoft. All rights reserved.

//! Field comparison driving the UPDATE decision. Only updatable fields are
//! examined; fields the server drops (the unsupported set) are excluded
//! because they can never be reconciled.

use std::collections::BTreeSet;

use core_objects::{EntryField, RegistrationEntry};

#[must_use]
pub fn outdated_fields(
    current: &RegistrationEntry,
    declared: &RegistrationEntry,
    unsupported: &BTreeSet<EntryField>,
) -> Vec<EntryField> {
    let mut outdated = Vec::new();

    let mut check = |field: EntryField, differs: bool| {
        if differs && !unsupported.contains(&field) {
            outdated.push(field);
        }
    };

    check(
        EntryField::X509SvidTtl,
        current.x509_svid_ttl != declared.x509_svid_ttl,
    );
    check(
        EntryField::JwtSvidTtl,
        current.jwt_svid_ttl != declared.jwt_svid_ttl,
    );
    check(
        EntryField::FederatesWith,
        current.federates_with != declared.federates_with,
    );
    check(EntryField::Admin, current.admin != declared.admin);
    check(
        EntryField::Downstream,
        current.downstream != declared.downstream,
    );
    // Order matters for DNS names; the list is compared as submitted.
    check(EntryField::DnsNames, current.dns_names != declared.dns_names);
    check(EntryField::Hint, current.hint != declared.hint);
    check(
        EntryField::StoreSvid,
        current.store_svid != declared.store_svid,
    );

    outdated
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry() -> RegistrationEntry {
        RegistrationEntry {
            id: "blue.1".to_string(),
            spiffe_id: "spiffe://td.test/workload".parse().unwrap(),
            parent_id: "spiffe://td.test/agent".parse().unwrap(),
            jwt_svid_ttl: 300,
            dns_names: vec!["a.example".to_string(), "b.example".to_string()],
            ..Default::default()
        }
    }

    #[test]
    fn identical_entries_have_no_outdated_fields() {
        assert!(outdated_fields(&entry(), &entry(), &BTreeSet::new()).is_empty());
    }

    #[test]
    fn differences_are_reported_per_field() {
        let mut declared = entry();
        declared.jwt_svid_ttl = 600;
        declared.admin = true;

        let outdated = outdated_fields(&entry(), &declared, &BTreeSet::new());
        assert_eq!(outdated, vec![EntryField::JwtSvidTtl, EntryField::Admin]);
    }

    #[test]
    fn dns_name_order_is_significant() {
        let mut declared = entry();
        declared.dns_names.reverse();

        let outdated = outdated_fields(&entry(), &declared, &BTreeSet::new());
        assert_eq!(outdated, vec![EntryField::DnsNames]);
    }

    #[test]
    fn unsupported_fields_are_excluded() {
        let mut declared = entry();
        declared.jwt_svid_ttl = 600;

        let unsupported: BTreeSet<_> = [EntryField::JwtSvidTtl].into_iter().collect();
        assert!(outdated_fields(&entry(), &declared, &unsupported).is_empty());
    }
}
