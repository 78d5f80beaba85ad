//! Normalization and hierarchy helpers for distinguished names.
//!
//! DNs are handled as plain `attr=value` components joined by `,`, most
//! specific first. Escaped separators inside values are not supported.

/// Normalize a directory name used as a lookup key: trimmed, lower case.
pub fn normalize(value: &str) -> String {
    value.trim().to_lowercase()
}

/// Normalize a DN: lower case, no whitespace around `,` or `=`.
pub fn normalize_dn(dn: &str) -> String {
    dn.split(',')
        .map(|component| match component.split_once('=') {
            Some((attr, value)) => format!("{}={}", attr.trim(), value.trim()),
            None => component.trim().to_string(),
        })
        .collect::<Vec<_>>()
        .join(",")
        .to_lowercase()
}

fn tokens(dn: &str) -> impl Iterator<Item = &str> {
    dn.split(['=', ',']).map(str::trim).filter(|t| !t.is_empty())
}

/// Normalized value of the leading component: `uid=JDoe,ou=x` gives `jdoe`.
///
/// A DN without any `=` yields the normalized input.
pub fn to_rdn(dn: &str) -> String {
    tokens(dn)
        .nth(1)
        .map(normalize)
        .unwrap_or_else(|| normalize(dn))
}

/// Normalized value of the second component: `uid=jdoe,ou=Gfi,ou=x` gives `gfi`.
pub fn to_parent_rdn(dn: &str) -> Option<String> {
    tokens(dn).nth(3).map(normalize)
}

/// DN of the parent entry, if any.
pub fn parent_dn(dn: &str) -> Option<&str> {
    dn.split_once(',').map(|(_, parent)| parent.trim_start())
}

/// Number of components.
pub fn depth(dn: &str) -> usize {
    dn.split(',').filter(|c| !c.trim().is_empty()).count()
}

/// True when `child` is `parent` itself or lives in its subtree.
///
/// Comparison is case-insensitive and anchored on a component boundary:
/// `ou=x,dc=root` contains `cn=y,ou=x,dc=root` but not `ou=xx,dc=root`.
pub fn equals_or_parent_of(parent: &str, child: &str) -> bool {
    let parent = normalize_dn(parent);
    let child = normalize_dn(child);
    child == parent || child.ends_with(&format!(",{parent}"))
}

/// True when every component reads `attr=value` with both sides present.
pub fn is_valid(dn: &str) -> bool {
    !dn.trim().is_empty()
        && dn.split(',').all(|component| match component.split_once('=') {
            Some((attr, value)) => !attr.trim().is_empty() && !value.trim().is_empty(),
            None => false,
        })
}
