use std::collections::BTreeMap;
use std::sync::RwLock;

use tracing::debug;

use crate::dn;
use crate::error::LdapError;
use crate::traits::{Attributes, DirectoryClient, Entry, Filter, Modification};

/// Attribute checked by [`DirectoryClient::authenticate`].
pub const PASSWORD_ATTRIBUTE: &str = "userPassword";

/// MemoryDirectory is a DirectoryClient kept entirely in process memory.
///
/// Entries are keyed by normalized DN. Object class rules are limited to
/// "class X requires attribute Y", enough to reproduce the schema
/// violations raised by a real server when a group loses its last member.
pub struct MemoryDirectory {
    entries: RwLock<BTreeMap<String, Entry>>,
    required: Vec<(String, String)>,
}

impl Default for MemoryDirectory {
    fn default() -> Self {
        Self::new().with_required("groupOfUniqueNames", "uniqueMember")
    }
}

impl MemoryDirectory {
    /// Empty directory without object class rules.
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(BTreeMap::new()),
            required: Vec::new(),
        }
    }

    /// Entries of `object_class` must always hold `attribute`.
    pub fn with_required(mut self, object_class: &str, attribute: &str) -> Self {
        self.required
            .push((object_class.to_lowercase(), attribute.to_lowercase()));
        self
    }

    /// Look up a single entry.
    pub fn entry(&self, dn: &str) -> Option<Entry> {
        let entries = self.entries.read().ok()?;
        entries.get(&dn::normalize_dn(dn)).cloned()
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check_schema(&self, dn: &str, attributes: &Attributes) -> Result<(), LdapError> {
        for (class, attribute) in &self.required {
            if attributes.has_object_class(class) && attributes.get(attribute).is_none() {
                return Err(LdapError::SchemaViolation {
                    dn: dn.to_string(),
                    reason: format!("object class '{class}' requires attribute '{attribute}'"),
                });
            }
        }
        Ok(())
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, BTreeMap<String, Entry>>, LdapError> {
        self.entries.read().map_err(|e| LdapError::Other(e.to_string()))
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, BTreeMap<String, Entry>>, LdapError> {
        self.entries.write().map_err(|e| LdapError::Other(e.to_string()))
    }
}

/// Keys of `key` and every entry below it.
fn subtree(entries: &BTreeMap<String, Entry>, key: &str) -> Vec<String> {
    entries
        .keys()
        .filter(|k| dn::equals_or_parent_of(key, k))
        .cloned()
        .collect()
}

impl DirectoryClient for MemoryDirectory {
    fn bind(&self, dn: &str, attributes: &Attributes) -> Result<(), LdapError> {
        if !dn::is_valid(dn) {
            return Err(LdapError::Other(format!("invalid DN '{dn}'")));
        }
        self.check_schema(dn, attributes)?;
        let key = dn::normalize_dn(dn);
        let mut entries = self.write()?;
        if entries.contains_key(&key) {
            return Err(LdapError::AlreadyBound(dn.to_string()));
        }
        debug!(dn, "bind");
        entries.insert(
            key,
            Entry {
                dn: dn.to_string(),
                attributes: attributes.clone(),
            },
        );
        Ok(())
    }

    fn search(&self, base: &str, filter: &Filter) -> Result<Vec<Entry>, LdapError> {
        let entries = self.read()?;
        let found: Vec<Entry> = entries
            .iter()
            .filter(|(key, entry)| dn::equals_or_parent_of(base, key) && filter.matches(&entry.attributes))
            .map(|(_, entry)| entry.clone())
            .collect();
        debug!(base, filter = %filter, count = found.len(), "search");
        Ok(found)
    }

    fn modify(&self, dn: &str, modifications: &[Modification]) -> Result<(), LdapError> {
        let key = dn::normalize_dn(dn);
        let mut entries = self.write()?;
        let current = entries
            .get(&key)
            .ok_or_else(|| LdapError::NoSuchObject(dn.to_string()))?;

        // Work on a copy so a failing change leaves the entry untouched.
        let mut attributes = current.attributes.clone();
        for modification in modifications {
            match modification {
                Modification::Add(attribute, value) => {
                    if !attributes.add(attribute, value.clone()) {
                        return Err(LdapError::AlreadyPresent {
                            dn: dn.to_string(),
                            attribute: attribute.clone(),
                            value: value.clone(),
                        });
                    }
                }
                Modification::Remove(attribute, value) => {
                    if !attributes.remove_value(attribute, value) {
                        return Err(LdapError::NoSuchAttribute {
                            dn: dn.to_string(),
                            attribute: attribute.clone(),
                            value: value.clone(),
                        });
                    }
                }
                Modification::Replace(attribute, values) => {
                    attributes.replace(attribute, values.clone());
                }
            }
        }
        self.check_schema(dn, &attributes)?;

        debug!(dn, changes = modifications.len(), "modify");
        if let Some(entry) = entries.get_mut(&key) {
            entry.attributes = attributes;
        }
        Ok(())
    }

    fn rename(&self, old_dn: &str, new_dn: &str) -> Result<(), LdapError> {
        if !dn::is_valid(new_dn) {
            return Err(LdapError::Other(format!("invalid DN '{new_dn}'")));
        }
        let old_key = dn::normalize_dn(old_dn);
        let new_key = dn::normalize_dn(new_dn);
        let mut entries = self.write()?;
        if !entries.contains_key(&old_key) {
            return Err(LdapError::NoSuchObject(old_dn.to_string()));
        }
        if entries.contains_key(&new_key) {
            return Err(LdapError::AlreadyBound(new_dn.to_string()));
        }

        let old_depth = dn::depth(&old_key);
        for key in subtree(&entries, &old_key) {
            let Some(mut entry) = entries.remove(&key) else {
                continue;
            };
            let components: Vec<&str> = entry.dn.split(',').collect();
            let own = components.len().saturating_sub(old_depth);
            let renamed = if own == 0 {
                new_dn.to_string()
            } else {
                format!("{},{}", components[..own].join(","), new_dn)
            };
            if own == 0 {
                // The naming attribute follows the new RDN.
                if let (Some((old_attr, old_value)), Some((new_attr, new_value))) = (
                    old_dn.split(',').next().and_then(|c| c.split_once('=')),
                    new_dn.split(',').next().and_then(|c| c.split_once('=')),
                ) {
                    if !old_value.trim().eq_ignore_ascii_case(new_value.trim()) {
                        entry.attributes.remove_value(old_attr.trim(), old_value.trim());
                        entry.attributes.add(new_attr.trim(), new_value.trim());
                    }
                }
            }
            entry.dn = renamed;
            entries.insert(dn::normalize_dn(&entry.dn), entry);
        }
        debug!(old_dn, new_dn, "rename");
        Ok(())
    }

    fn unbind(&self, dn: &str, recursive: bool) -> Result<(), LdapError> {
        let key = dn::normalize_dn(dn);
        let mut entries = self.write()?;
        if !entries.contains_key(&key) {
            return Err(LdapError::NoSuchObject(dn.to_string()));
        }
        let keys = subtree(&entries, &key);
        if keys.len() > 1 && !recursive {
            return Err(LdapError::NotAllowedOnNonLeaf(dn.to_string()));
        }
        for key in &keys {
            entries.remove(key);
        }
        debug!(dn, removed = keys.len(), "unbind");
        Ok(())
    }

    fn authenticate(&self, base: &str, filter: &Filter, password: &str) -> Result<bool, LdapError> {
        let found = self.search(base, filter)?;
        let Some(entry) = found.first() else {
            return Ok(false);
        };
        Ok(entry
            .get_all(PASSWORD_ATTRIBUTE)
            .iter()
            .any(|stored| stored == password))
    }
}
