use std::collections::BTreeMap;
use std::fmt;

use crate::error::LdapError;

/// Multi-valued attributes of a directory entry.
///
/// Attribute names are case-insensitive. Value comparisons are
/// case-insensitive too, which matches the equality rules of the
/// attributes this crate deals with (names, DNs, flags).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Attributes {
    values: BTreeMap<String, Vec<String>>,
}

impl Attributes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder form of [`Attributes::add`].
    pub fn with(mut self, name: &str, value: impl Into<String>) -> Self {
        self.add(name, value);
        self
    }

    pub fn with_all<I, V>(mut self, name: &str, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<String>,
    {
        for value in values {
            self.add(name, value);
        }
        self
    }

    /// Adds the value only when present.
    pub fn with_opt(self, name: &str, value: Option<impl Into<String>>) -> Self {
        match value {
            Some(value) => self.with(name, value),
            None => self,
        }
    }

    /// First value of the attribute.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.get_all(name).first().map(String::as_str)
    }

    pub fn get_all(&self, name: &str) -> &[String] {
        self.values
            .get(&name.to_lowercase())
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn contains(&self, name: &str, value: &str) -> bool {
        self.get_all(name).iter().any(|v| v.eq_ignore_ascii_case(value))
    }

    /// Append a value. Returns false when the value is already held.
    pub fn add(&mut self, name: &str, value: impl Into<String>) -> bool {
        let value = value.into();
        if self.contains(name, &value) {
            return false;
        }
        self.values.entry(name.to_lowercase()).or_default().push(value);
        true
    }

    /// Remove a value. Returns false when the value was not held.
    pub fn remove_value(&mut self, name: &str, value: &str) -> bool {
        let key = name.to_lowercase();
        let Some(values) = self.values.get_mut(&key) else {
            return false;
        };
        let before = values.len();
        values.retain(|v| !v.eq_ignore_ascii_case(value));
        let removed = values.len() != before;
        if values.is_empty() {
            self.values.remove(&key);
        }
        removed
    }

    /// Replace every value; an empty list removes the attribute.
    pub fn replace(&mut self, name: &str, values: Vec<String>) {
        let key = name.to_lowercase();
        if values.is_empty() {
            self.values.remove(&key);
        } else {
            self.values.insert(key, values);
        }
    }

    pub fn has_object_class(&self, class: &str) -> bool {
        self.contains("objectClass", class)
    }

    /// Lower-cased attribute names.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }
}

/// An entry returned by a search.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub dn: String,
    pub attributes: Attributes,
}

impl Entry {
    pub fn get(&self, name: &str) -> Option<&str> {
        self.attributes.get(name)
    }

    pub fn get_all(&self, name: &str) -> &[String] {
        self.attributes.get_all(name)
    }
}

/// Search filter: attribute equality and conjunctions of it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Filter {
    Equals(String, String),
    And(Vec<Filter>),
}

impl Filter {
    pub fn eq(attribute: &str, value: impl Into<String>) -> Self {
        Filter::Equals(attribute.to_string(), value.into())
    }

    /// Conjunction, flattening nested `And`s.
    pub fn and(self, other: Filter) -> Self {
        match self {
            Filter::And(mut filters) => {
                filters.push(other);
                Filter::And(filters)
            }
            single => Filter::And(vec![single, other]),
        }
    }

    pub fn matches(&self, attributes: &Attributes) -> bool {
        match self {
            Filter::Equals(attribute, value) => attributes.contains(attribute, value),
            Filter::And(filters) => filters.iter().all(|f| f.matches(attributes)),
        }
    }
}

fn escape_value(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '*' => escaped.push_str("\\2a"),
            '(' => escaped.push_str("\\28"),
            ')' => escaped.push_str("\\29"),
            '\\' => escaped.push_str("\\5c"),
            '\0' => escaped.push_str("\\00"),
            c => escaped.push(c),
        }
    }
    escaped
}

/// RFC 4515 string form.
impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Filter::Equals(attribute, value) => write!(f, "({}={})", attribute, escape_value(value)),
            Filter::And(filters) => {
                write!(f, "(&")?;
                for filter in filters {
                    write!(f, "{filter}")?;
                }
                write!(f, ")")
            }
        }
    }
}

/// One change of a modify request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Modification {
    Add(String, String),
    Remove(String, String),
    /// Replace all values; an empty list deletes the attribute.
    Replace(String, Vec<String>),
}

impl Modification {
    pub fn add(attribute: &str, value: impl Into<String>) -> Self {
        Modification::Add(attribute.to_string(), value.into())
    }

    pub fn remove(attribute: &str, value: impl Into<String>) -> Self {
        Modification::Remove(attribute.to_string(), value.into())
    }

    /// Single-valued replace; `None` deletes the attribute.
    pub fn set(attribute: &str, value: Option<String>) -> Self {
        Modification::Replace(attribute.to_string(), value.into_iter().collect())
    }

    pub fn replace(attribute: &str, values: Vec<String>) -> Self {
        Modification::Replace(attribute.to_string(), values)
    }
}

/// Blocking client for the directory service.
pub trait DirectoryClient: Send + Sync {
    /// Create an entry.
    fn bind(&self, dn: &str, attributes: &Attributes) -> Result<(), LdapError>;

    /// Subtree search under `base`.
    fn search(&self, base: &str, filter: &Filter) -> Result<Vec<Entry>, LdapError>;

    /// Apply all modifications atomically.
    fn modify(&self, dn: &str, modifications: &[Modification]) -> Result<(), LdapError>;

    /// Move an entry, with its subtree, to a new DN.
    fn rename(&self, old_dn: &str, new_dn: &str) -> Result<(), LdapError>;

    /// Delete an entry, and its subtree when `recursive`.
    fn unbind(&self, dn: &str, recursive: bool) -> Result<(), LdapError>;

    /// Check `password` against the first entry matching `filter`.
    fn authenticate(&self, base: &str, filter: &Filter, password: &str) -> Result<bool, LdapError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attributes_case_insensitive() {
        let mut attrs = Attributes::new()
            .with("objectClass", "groupOfUniqueNames")
            .with("uniqueMember", "uid=none");
        assert!(attrs.has_object_class("GROUPOFUNIQUENAMES"));
        assert!(!attrs.add("UNIQUEMEMBER", "UID=None"));
        assert!(attrs.add("uniqueMember", "uid=jdoe,ou=gfi"));
        assert_eq!(attrs.get_all("uniquemember").len(), 2);

        assert!(attrs.remove_value("uniqueMember", "UID=NONE"));
        assert!(!attrs.remove_value("uniqueMember", "uid=none"));
        assert!(attrs.remove_value("uniqueMember", "uid=jdoe,ou=gfi"));
        assert!(attrs.get("uniqueMember").is_none());
        assert_eq!(attrs.names().collect::<Vec<_>>(), vec!["objectclass"]);
    }

    #[test]
    fn test_attributes_replace() {
        let mut attrs = Attributes::new().with_opt("mail", Some("a@b.c")).with_opt("sn", None::<String>);
        assert_eq!(attrs.get("mail"), Some("a@b.c"));
        assert!(attrs.get("sn").is_none());
        attrs.replace("mail", vec!["x@y.z".into(), "w@y.z".into()]);
        assert_eq!(attrs.get_all("mail"), ["x@y.z".to_string(), "w@y.z".to_string()]);
        attrs.replace("mail", vec![]);
        assert!(attrs.get("mail").is_none());
    }

    #[test]
    fn test_filter() {
        let filter = Filter::eq("objectClass", "inetOrgPerson")
            .and(Filter::eq("uid", "j*doe"))
            .and(Filter::eq("mail", "x"));
        assert_eq!(
            filter.to_string(),
            "(&(objectClass=inetOrgPerson)(uid=j\\2adoe)(mail=x))"
        );

        let attrs = Attributes::new()
            .with("objectClass", "inetOrgPerson")
            .with("uid", "jdoe");
        assert!(Filter::eq("objectclass", "INETORGPERSON").matches(&attrs));
        assert!(Filter::eq("uid", "jdoe").and(Filter::eq("objectClass", "inetOrgPerson")).matches(&attrs));
        assert!(!Filter::eq("uid", "jdoe").and(Filter::eq("mail", "x")).matches(&attrs));
    }

    #[test]
    fn test_modification_set() {
        assert_eq!(
            Modification::set("employeeType", None),
            Modification::Replace("employeeType".into(), vec![])
        );
        assert_eq!(
            Modification::set("employeeType", Some("LOCKED|".into())),
            Modification::Replace("employeeType".into(), vec!["LOCKED|".into()])
        );
    }
}
