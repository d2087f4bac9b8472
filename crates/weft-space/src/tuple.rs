//! Tuples, templates, and the sub-key derivation scheme.
//!
//! A tuple is addressable two ways: by exact content (its *main key*,
//! the hash of its serialised form) and by wildcard templates. For the
//! latter, every element contributes three *sub-keys* derived from
//! `(tuple length, position, facet)` where the facet is the element's
//! type, its value, or a wildcard marker. A template derives exactly one
//! sub-key per position, picking the facet its slot constrains on, so a
//! template sub-key matches the corresponding tuple sub-key byte for
//! byte.
//!
//! All hashable material is prefixed with a namespace tag (`"tuple:"` or
//! `"listener:"`) before hashing, giving tuple records and listener
//! records disjoint key spaces in the same DHT.

use serde::{Deserialize, Serialize};

use weft_transport::codec;
use weft_types::Key;

use crate::{Result, SpaceError};

/// Number of sub-key variants derived per tuple position (type, value,
/// wildcard). Listener searches OR together one group of this size per
/// position.
pub const SUBKEY_VARIANTS_PER_POSITION: usize = 3;

/// The two hash namespaces sharing the DHT.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Namespace {
    /// Stored tuples and their inverted indexes.
    Tuple,
    /// Blocked-consumer listener records and their inverted indexes.
    Listener,
}

impl Namespace {
    fn prefix(self) -> &'static [u8] {
        match self {
            Namespace::Tuple => b"tuple:",
            Namespace::Listener => b"listener:",
        }
    }
}

/// One element of a tuple.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum TupleValue {
    /// A signed integer.
    Int(i64),
    /// A floating-point number.
    Float(f64),
    /// A UTF-8 string.
    Str(String),
    /// An opaque byte string.
    Bytes(Vec<u8>),
    /// A boolean.
    Bool(bool),
}

impl TupleValue {
    /// The type tag of this value.
    pub fn type_tag(&self) -> TypeTag {
        match self {
            TupleValue::Int(_) => TypeTag::Int,
            TupleValue::Float(_) => TypeTag::Float,
            TupleValue::Str(_) => TypeTag::Str,
            TupleValue::Bytes(_) => TypeTag::Bytes,
            TupleValue::Bool(_) => TypeTag::Bool,
        }
    }
}

/// The type of a tuple element, for type-constrained template slots.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TypeTag {
    Int,
    Float,
    Str,
    Bytes,
    Bool,
}

/// An ordered sequence of elements, the unit of the tuple space.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Tuple(pub Vec<TupleValue>);

impl Tuple {
    /// Create a tuple from its elements.
    pub fn new(elements: Vec<TupleValue>) -> Self {
        Self(elements)
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the tuple has no elements.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Vec<TupleValue>> for Tuple {
    fn from(elements: Vec<TupleValue>) -> Self {
        Self(elements)
    }
}

/// One slot of a template.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum TemplateSlot {
    /// Match only this exact value.
    Equals(TupleValue),
    /// Match any value of this type.
    OfType(TypeTag),
    /// Match any value.
    Any,
}

/// A matching pattern over tuples of a fixed length.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Template(pub Vec<TemplateSlot>);

impl Template {
    /// Create a template from its slots.
    pub fn new(slots: Vec<TemplateSlot>) -> Self {
        Self(slots)
    }

    /// Number of slots.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the template has no slots.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Whether every slot pins an exact value.
    pub fn is_deterministic(&self) -> bool {
        self.0
            .iter()
            .all(|slot| matches!(slot, TemplateSlot::Equals(_)))
    }

    /// The tuple a fully deterministic template describes.
    ///
    /// A deterministic template serialises *as its tuple*, so its keys
    /// rendezvous byte for byte with the keys a producer derives from the
    /// tuple itself.
    pub fn as_tuple(&self) -> Option<Tuple> {
        let mut elements = Vec::with_capacity(self.0.len());
        for slot in &self.0 {
            match slot {
                TemplateSlot::Equals(value) => elements.push(value.clone()),
                _ => return None,
            }
        }
        Some(Tuple(elements))
    }
}

/// One facet of one element: what a sub-key constrains on.
#[derive(Serialize)]
enum Facet<'a> {
    Type(TypeTag),
    Value(&'a TupleValue),
    Wildcard,
}

/// Serialise a tuple to its canonical byte form.
pub fn encode_tuple(tuple: &Tuple) -> Result<Vec<u8>> {
    codec::to_vec(tuple).map_err(|e| SpaceError::Codec(e.to_string()))
}

/// Decode a tuple from its canonical byte form.
pub fn decode_tuple(bytes: &[u8]) -> Result<Tuple> {
    codec::from_slice(bytes).map_err(|e| SpaceError::Codec(e.to_string()))
}

/// The main key of a tuple in a namespace:
/// `H(prefix ∥ serialise(tuple))`.
pub fn main_key(ns: Namespace, tuple: &Tuple) -> Result<Key> {
    let mut input = ns.prefix().to_vec();
    input.extend_from_slice(&encode_tuple(tuple)?);
    Ok(Key::for_content(&input))
}

/// The main key of a *template* in the listener namespace. Deterministic
/// templates hash as their tuple; wildcard templates hash their own
/// serialised form (the bytes only need to be unique per template).
pub fn listener_template_key(template: &Template) -> Result<Key> {
    if let Some(tuple) = template.as_tuple() {
        return main_key(Namespace::Listener, &tuple);
    }
    let mut input = Namespace::Listener.prefix().to_vec();
    let body = codec::to_vec(template).map_err(|e| SpaceError::Codec(e.to_string()))?;
    input.extend_from_slice(&body);
    Ok(Key::for_content(&input))
}

fn subkey(ns: Namespace, length: usize, position: usize, facet: &Facet<'_>) -> Result<Key> {
    let subtuple = (length as u64, position as u64, facet);
    let body = codec::to_vec(&subtuple).map_err(|e| SpaceError::Codec(e.to_string()))?;
    let mut input = ns.prefix().to_vec();
    input.extend_from_slice(&body);
    Ok(Key::for_content(&input))
}

/// The full set of sub-keys a tuple publishes: type, value and wildcard
/// facets for every position, in that order.
pub fn tuple_subkeys(ns: Namespace, tuple: &Tuple) -> Result<Vec<Key>> {
    let length = tuple.len();
    let mut keys = Vec::with_capacity(length * SUBKEY_VARIANTS_PER_POSITION);
    for (position, element) in tuple.0.iter().enumerate() {
        keys.push(subkey(ns, length, position, &Facet::Type(element.type_tag()))?);
        keys.push(subkey(ns, length, position, &Facet::Value(element))?);
        keys.push(subkey(ns, length, position, &Facet::Wildcard)?);
    }
    Ok(keys)
}

/// The sub-keys a template searches or registers with: one per position,
/// using the facet its slot constrains on. `None` for a fully
/// deterministic template, which is addressed by its main key instead.
pub fn template_subkeys(ns: Namespace, template: &Template) -> Result<Option<Vec<Key>>> {
    if template.is_deterministic() {
        return Ok(None);
    }
    let length = template.len();
    let mut keys = Vec::with_capacity(length);
    for (position, slot) in template.0.iter().enumerate() {
        let facet = match slot {
            TemplateSlot::Equals(value) => Facet::Value(value),
            TemplateSlot::OfType(tag) => Facet::Type(*tag),
            TemplateSlot::Any => Facet::Wildcard,
        };
        keys.push(subkey(ns, length, position, &facet)?);
    }
    Ok(Some(keys))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_tuple() -> Tuple {
        Tuple::new(vec![
            TupleValue::Str("x".to_string()),
            TupleValue::Int(42),
        ])
    }

    #[test]
    fn test_tuple_roundtrip() {
        let tuple = Tuple::new(vec![
            TupleValue::Str("a".to_string()),
            TupleValue::Int(1),
            TupleValue::Float(3.14),
            TupleValue::Bytes(vec![1, 2, 3]),
            TupleValue::Bool(true),
        ]);
        let bytes = encode_tuple(&tuple).expect("encode");
        assert_eq!(decode_tuple(&bytes).expect("decode"), tuple);
    }

    #[test]
    fn test_namespaces_are_disjoint() {
        let tuple = sample_tuple();
        let t = main_key(Namespace::Tuple, &tuple).expect("key");
        let l = main_key(Namespace::Listener, &tuple).expect("key");
        assert_ne!(t, l);
    }

    #[test]
    fn test_deterministic_template_hashes_as_its_tuple() {
        let tuple = sample_tuple();
        let template = Template::new(vec![
            TemplateSlot::Equals(TupleValue::Str("x".to_string())),
            TemplateSlot::Equals(TupleValue::Int(42)),
        ]);
        assert!(template.is_deterministic());
        assert_eq!(template.as_tuple(), Some(tuple.clone()));
        assert_eq!(
            listener_template_key(&template).expect("key"),
            main_key(Namespace::Listener, &tuple).expect("key")
        );
    }

    #[test]
    fn test_template_subkeys_match_tuple_facets() {
        let tuple = sample_tuple();
        let tuple_keys = tuple_subkeys(Namespace::Tuple, &tuple).expect("subkeys");
        assert_eq!(tuple_keys.len(), 2 * SUBKEY_VARIANTS_PER_POSITION);

        // Equals matches the value facet, Any the wildcard facet.
        let template = Template::new(vec![
            TemplateSlot::Equals(TupleValue::Str("x".to_string())),
            TemplateSlot::Any,
        ]);
        let template_keys = template_subkeys(Namespace::Tuple, &template)
            .expect("subkeys")
            .expect("wildcard template");
        assert_eq!(template_keys.len(), 2);
        assert_eq!(template_keys[0], tuple_keys[1]);
        assert_eq!(template_keys[1], tuple_keys[SUBKEY_VARIANTS_PER_POSITION + 2]);

        // OfType matches the type facet.
        let typed = Template::new(vec![
            TemplateSlot::OfType(TypeTag::Str),
            TemplateSlot::OfType(TypeTag::Int),
        ]);
        let typed_keys = template_subkeys(Namespace::Tuple, &typed)
            .expect("subkeys")
            .expect("wildcard template");
        assert_eq!(typed_keys[0], tuple_keys[0]);
        assert_eq!(typed_keys[1], tuple_keys[SUBKEY_VARIANTS_PER_POSITION]);
    }

    #[test]
    fn test_deterministic_template_has_no_subkeys() {
        let template = Template::new(vec![TemplateSlot::Equals(TupleValue::Int(1))]);
        assert!(template_subkeys(Namespace::Tuple, &template)
            .expect("subkeys")
            .is_none());
    }

    #[test]
    fn test_subkeys_depend_on_length_and_position() {
        let one = Tuple::new(vec![TupleValue::Int(7)]);
        let two = Tuple::new(vec![TupleValue::Int(7), TupleValue::Int(7)]);
        let one_keys = tuple_subkeys(Namespace::Tuple, &one).expect("subkeys");
        let two_keys = tuple_subkeys(Namespace::Tuple, &two).expect("subkeys");
        // Same element, different tuple length: no sub-key collides.
        assert!(one_keys.iter().all(|k| !two_keys.contains(k)));
        // Same element at different positions differs too.
        assert_ne!(two_keys[1], two_keys[SUBKEY_VARIANTS_PER_POSITION + 1]);
    }

    #[test]
    fn test_mismatched_template_value_yields_different_subkey() {
        let tuple = sample_tuple();
        let tuple_keys = tuple_subkeys(Namespace::Tuple, &tuple).expect("subkeys");
        let template = Template::new(vec![
            TemplateSlot::Equals(TupleValue::Str("x".to_string())),
            TemplateSlot::Equals(TupleValue::Int(43)),
        ]);
        // A deterministic template has no subkeys, so force them by adding
        // a wildcard alongside the mismatched value.
        let template = Template::new(vec![
            template.0[1].clone(),
            TemplateSlot::Any,
        ]);
        let keys = template_subkeys(Namespace::Tuple, &template)
            .expect("subkeys")
            .expect("wildcard template");
        // Equals(43) at position 0 matches nothing the sample tuple
        // published at position 0.
        assert!(!tuple_keys.contains(&keys[0]));
    }
}
