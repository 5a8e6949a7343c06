//! Certificate subject handling for external (x.509) principals.
//!
//! Certificates are verified by the transport layer; this module only
//! compares subject names.

use std::fmt;

use warden_common::{Result, WardenError};

/// Attributes that identify the organization a member certificate belongs to.
const MEMBERSHIP_ATTRIBUTES: [&str; 3] = ["O", "OU", "DC"];

/// A parsed RFC 4514 style distinguished name, e.g.
/// `CN=client,OU=KernelUser,O=MongoDB,L=New York City,ST=New York,C=US`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DistinguishedName {
    rdns: Vec<(String, String)>,
}

impl DistinguishedName {
    pub fn parse(subject: &str) -> Result<Self> {
        let mut rdns = Vec::new();
        for part in split_unescaped(subject) {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            let (attr, value) = part.split_once('=').ok_or_else(|| {
                WardenError::Parse(format!("Invalid RDN '{part}' in subject '{subject}'"))
            })?;
            let attr = attr.trim();
            if attr.is_empty() {
                return Err(WardenError::Parse(format!(
                    "Empty attribute in subject '{subject}'"
                )));
            }
            rdns.push((attr.to_ascii_uppercase(), unescape(value.trim())));
        }

        if rdns.is_empty() {
            return Err(WardenError::Parse("Empty subject".into()));
        }
        Ok(Self { rdns })
    }

    /// Values of `attr`, in subject order.
    pub fn values(&self, attr: &str) -> Vec<&str> {
        self.rdns
            .iter()
            .filter(|(a, _)| a.eq_ignore_ascii_case(attr))
            .map(|(_, v)| v.as_str())
            .collect()
    }

    /// Whether two subject strings name the same entity.
    pub fn same_subject(a: &str, b: &str) -> bool {
        match (Self::parse(a), Self::parse(b)) {
            (Ok(a), Ok(b)) => a == b,
            _ => false,
        }
    }
}

impl fmt::Display for DistinguishedName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .rdns
            .iter()
            .map(|(a, v)| format!("{a}={}", v.replace(',', "\\,")))
            .collect();
        f.write_str(&parts.join(","))
    }
}

fn split_unescaped(s: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut start = 0;
    let mut escaped = false;
    for (i, c) in s.char_indices() {
        match c {
            '\\' if !escaped => escaped = true,
            ',' if !escaped => {
                parts.push(&s[start..i]);
                start = i + 1;
            }
            _ => escaped = false,
        }
    }
    parts.push(&s[start..]);
    parts
}

fn unescape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            if let Some(next) = chars.next() {
                out.push(next);
            }
        } else {
            out.push(c);
        }
    }
    out
}

/// Rules deciding which subjects belong to cluster members.
///
/// A subject is a member when its O, OU and DC values equal those of this
/// node's own certificate subject.
#[derive(Debug, Clone, Default)]
pub struct ClusterMembership {
    member_subject: Option<DistinguishedName>,
}

impl ClusterMembership {
    pub fn new(cluster_subject: Option<&str>) -> Result<Self> {
        let member_subject = cluster_subject
            .map(DistinguishedName::parse)
            .transpose()
            .map_err(|e| WardenError::Config(format!("cluster_subject: {}", e.message())))?;
        Ok(Self { member_subject })
    }

    pub fn is_member(&self, subject: &str) -> bool {
        let Some(member) = &self.member_subject else {
            return false;
        };
        let Ok(candidate) = DistinguishedName::parse(subject) else {
            return false;
        };

        let identifying = MEMBERSHIP_ATTRIBUTES
            .iter()
            .any(|attr| !member.values(attr).is_empty());
        identifying
            && MEMBERSHIP_ATTRIBUTES
                .iter()
                .all(|attr| member.values(attr) == candidate.values(attr))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SERVER_USER: &str = "C=US,ST=New York,L=New York City,O=MongoDB,OU=Kernel,CN=server";
    const INTERNAL_USER: &str = "C=US,ST=New York,L=New York City,O=MongoDB,OU=Kernel,CN=internal";
    const CLIENT_USER: &str = "C=US,ST=New York,L=New York City,O=MongoDB,OU=KernelUser,CN=client";

    #[test]
    fn test_parse_subject() {
        let dn = DistinguishedName::parse(CLIENT_USER).unwrap();
        assert_eq!(dn.values("CN"), vec!["client"]);
        assert_eq!(dn.values("ou"), vec!["KernelUser"]);
        assert_eq!(dn.values("L"), vec!["New York City"]);
        assert_eq!(dn.to_string(), CLIENT_USER);
    }

    #[test]
    fn test_parse_escaped_comma() {
        let dn = DistinguishedName::parse(r"CN=Doe\, John,O=Example").unwrap();
        assert_eq!(dn.values("CN"), vec!["Doe, John"]);
        assert_eq!(dn.values("O"), vec!["Example"]);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(DistinguishedName::parse("").is_err());
        assert!(DistinguishedName::parse("not a dn").is_err());
        assert!(DistinguishedName::parse("=value").is_err());
    }

    #[test]
    fn test_same_subject_ignores_spacing_and_case_of_attributes() {
        assert!(DistinguishedName::same_subject(
            "CN=client, OU=KernelUser",
            "cn=client,ou=KernelUser"
        ));
        assert!(!DistinguishedName::same_subject(
            "CN=client,OU=KernelUser",
            "CN=client,OU=Kernel"
        ));
    }

    #[test]
    fn test_cluster_membership() {
        let membership = ClusterMembership::new(Some(SERVER_USER)).unwrap();
        assert!(membership.is_member(SERVER_USER));
        assert!(membership.is_member(INTERNAL_USER));
        assert!(!membership.is_member(CLIENT_USER));
        assert!(!membership.is_member("CN=client"));
        assert!(!membership.is_member("garbage"));
    }

    #[test]
    fn test_no_cluster_subject_means_no_members() {
        let membership = ClusterMembership::new(None).unwrap();
        assert!(!membership.is_member(SERVER_USER));
        assert!(ClusterMembership::new(Some("broken")).is_err());
    }
}
