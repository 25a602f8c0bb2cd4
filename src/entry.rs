use crate::value::BerValue;
use std::collections::BTreeMap;

/// One entry returned by a search.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Entry {
    dn: String,
    attributes: BTreeMap<String, Vec<BerValue>>,
}

impl Entry {
    pub fn new(dn: impl Into<String>) -> Self {
        Self {
            dn: dn.into(),
            attributes: BTreeMap::new(),
        }
    }

    pub fn dn(&self) -> &str {
        &self.dn
    }

    pub fn attributes(&self) -> &BTreeMap<String, Vec<BerValue>> {
        &self.attributes
    }

    pub fn attribute_names(&self) -> impl Iterator<Item = &str> {
        self.attributes.keys().map(String::as_str)
    }

    /// Values of `name`, matched case-insensitively as attribute descriptions are.
    pub fn values(&self, name: &str) -> &[BerValue] {
        self.attributes
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_slice())
            .unwrap_or(&[])
    }

    /// Values of `name` that are valid UTF-8.
    pub fn strings(&self, name: &str) -> Vec<&str> {
        self.values(name).iter().filter_map(BerValue::as_str).collect()
    }

    pub fn first_string(&self, name: &str) -> Option<&str> {
        self.values(name).iter().find_map(BerValue::as_str)
    }

    pub(crate) fn push_values<I>(&mut self, name: String, values: I)
    where
        I: IntoIterator<Item = BerValue>,
    {
        self.attributes.entry(name).or_default().extend(values);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_lookup_case_insensitive() {
        let mut entry = Entry::new("uid=jdoe,ou=people,dc=example,dc=com");
        entry.push_values("mail".to_string(), [BerValue::from("jdoe@example.com")]);
        entry.push_values("jpegPhoto".to_string(), [BerValue::new(vec![0xff, 0xd8, 0xff])]);

        assert_eq!(entry.strings("MAIL"), vec!["jdoe@example.com"]);
        assert_eq!(entry.first_string("jpegphoto"), None);
        assert_eq!(entry.values("jpegPhoto").len(), 1);
        assert!(entry.values("cn").is_empty());
        assert_eq!(entry.attribute_names().collect::<Vec<_>>(), vec!["jpegPhoto", "mail"]);
    }

    #[test]
    fn test_push_values_appends() {
        let mut entry = Entry::new("cn=x");
        entry.push_values("cn".to_string(), [BerValue::from("a")]);
        entry.push_values("cn".to_string(), [BerValue::from("b")]);
        assert_eq!(entry.strings("cn"), vec!["a", "b"]);
    }
}
