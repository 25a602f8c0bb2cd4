//! Modify request building blocks.

use crate::value::BerValue;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModOp {
    Add,
    Delete,
    Replace,
}

/// A value handed to a modification. Lists expand to several values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModValue {
    Bytes(Vec<u8>),
    Text(String),
    List(Vec<Vec<u8>>),
}

impl ModValue {
    fn append_to(&self, out: &mut Vec<Vec<u8>>) {
        match self {
            ModValue::Bytes(b) => out.push(b.clone()),
            ModValue::Text(s) => out.push(s.as_bytes().to_vec()),
            ModValue::List(items) => out.extend(items.iter().cloned()),
        }
    }
}

impl From<Vec<u8>> for ModValue {
    fn from(b: Vec<u8>) -> Self {
        ModValue::Bytes(b)
    }
}

impl From<&[u8]> for ModValue {
    fn from(b: &[u8]) -> Self {
        ModValue::Bytes(b.to_vec())
    }
}

impl From<String> for ModValue {
    fn from(s: String) -> Self {
        ModValue::Text(s)
    }
}

impl From<&str> for ModValue {
    fn from(s: &str) -> Self {
        ModValue::Text(s.to_string())
    }
}

impl From<Vec<Vec<u8>>> for ModValue {
    fn from(items: Vec<Vec<u8>>) -> Self {
        ModValue::List(items)
    }
}

impl From<BerValue> for ModValue {
    fn from(v: BerValue) -> Self {
        ModValue::Bytes(v.into_bytes())
    }
}

/// One change to one attribute of an entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Modification {
    op: ModOp,
    attribute: String,
    values: Vec<ModValue>,
}

impl Modification {
    /// A modification without values: deletes or replaces the whole attribute.
    pub fn new(op: ModOp, attribute: impl Into<String>) -> Self {
        Self {
            op,
            attribute: attribute.into(),
            values: Vec::new(),
        }
    }

    pub fn with_values<I, V>(op: ModOp, attribute: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<ModValue>,
    {
        Self {
            op,
            attribute: attribute.into(),
            values: values.into_iter().map(Into::into).collect(),
        }
    }

    pub fn add<I, V>(attribute: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<ModValue>,
    {
        Self::with_values(ModOp::Add, attribute, values)
    }

    pub fn delete<I, V>(attribute: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<ModValue>,
    {
        Self::with_values(ModOp::Delete, attribute, values)
    }

    pub fn replace<I, V>(attribute: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<ModValue>,
    {
        Self::with_values(ModOp::Replace, attribute, values)
    }

    pub fn op(&self) -> ModOp {
        self.op
    }

    pub fn attribute(&self) -> &str {
        &self.attribute
    }

    pub fn values(&self) -> &[ModValue] {
        &self.values
    }

    /// Appends a value while the request is still being assembled.
    pub fn push_value(&mut self, value: impl Into<ModValue>) {
        self.values.push(value.into());
    }

    /// Flattened wire values, in order.
    pub fn encoded_values(&self) -> Vec<Vec<u8>> {
        let mut out = Vec::with_capacity(self.values.len());
        for value in &self.values {
            value.append_to(&mut out);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encoded_values_flatten_in_order() {
        let mut m = Modification::add("mail", ["a@example.com"]);
        m.push_value(vec![0x01u8, 0x02]);
        m.push_value(ModValue::List(vec![b"x".to_vec(), b"y".to_vec()]));
        assert_eq!(m.op(), ModOp::Add);
        assert_eq!(m.attribute(), "mail");
        assert_eq!(
            m.encoded_values(),
            vec![b"a@example.com".to_vec(), vec![1, 2], b"x".to_vec(), b"y".to_vec()]
        );
    }

    #[test]
    fn test_valueless_modification() {
        let m = Modification::new(ModOp::Delete, "description");
        assert!(m.values().is_empty());
        assert!(m.encoded_values().is_empty());
    }

    #[test]
    fn test_from_ber_value() {
        let m = Modification::replace("cn", [BerValue::from("Jane")]);
        assert_eq!(m.values(), &[ModValue::Bytes(b"Jane".to_vec())]);
    }
}
