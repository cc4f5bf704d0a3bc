//! Self-describing D-Bus values.
//!
//! A [`Holder`] can represent any value that travels over the bus: the basic types (booleans,
//! integers of every D-Bus width, doubles, strings, object paths and signatures), arrays and
//! dictionaries. It knows its own D-Bus type signature, which is how containers of heterogeneous
//! contents end up typed as variants on the wire.
//!
//! # Construction
//!
//! Scalars are created with [`Holder::create`] (or any [`From`] conversion), containers start out
//! empty via [`Holder::array`] and [`Holder::dict`] and are filled with [`Holder::array_append`] and
//! [`Holder::dict_append`]:
//!
//! ```
//! use busmirror::Holder;
//!
//! let mut props = Holder::dict();
//! props.dict_append("Alias", "thermometer");
//! props.dict_append("RSSI", -60i16);
//! assert_eq!(props.signature(), "a{sv}");
//! assert_eq!(props.dict_get(&"RSSI".to_string()).unwrap().get::<i16>().unwrap(), -60);
//! ```
//!
//! # Integer widths
//!
//! Integers are stored in a single 64-bit slot. Reading one back as any integer type masks the
//! slot to the requested width, which mirrors what a receiver of the wire value would see. Reading
//! an integer as a non-integer type (or the other way around) fails with a wrong-variant-type
//! [`Error`].

use core::fmt;
use std::{
    collections::{BTreeMap, HashMap},
    hash::Hash,
};

use crate::{path::Path, Error, Result};

/// The type tag of a [`Holder`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum HolderType {
    #[default]
    None,
    Byte,
    Boolean,
    Int16,
    Uint16,
    Int32,
    Uint32,
    Int64,
    Uint64,
    Double,
    String,
    ObjectPath,
    Signature,
    Array,
    Dict,
}

impl HolderType {
    /// Returns the single-character D-Bus type code of a basic type.
    ///
    /// Containers and [`HolderType::None`] have no code of their own.
    pub fn code(self) -> Option<char> {
        Some(match self {
            Self::Byte => 'y',
            Self::Boolean => 'b',
            Self::Int16 => 'n',
            Self::Uint16 => 'q',
            Self::Int32 => 'i',
            Self::Uint32 => 'u',
            Self::Int64 => 'x',
            Self::Uint64 => 't',
            Self::Double => 'd',
            Self::String => 's',
            Self::ObjectPath => 'o',
            Self::Signature => 'g',
            Self::None | Self::Array | Self::Dict => return None,
        })
    }

    pub fn is_integer(self) -> bool {
        matches!(
            self,
            Self::Byte
                | Self::Int16
                | Self::Uint16
                | Self::Int32
                | Self::Uint32
                | Self::Int64
                | Self::Uint64
        )
    }

    pub fn is_container(self) -> bool {
        matches!(self, Self::Array | Self::Dict)
    }

    fn width_mask(self) -> u64 {
        match self {
            Self::Byte => 0xFF,
            Self::Int16 | Self::Uint16 => 0xFFFF,
            Self::Int32 | Self::Uint32 => 0xFFFF_FFFF,
            _ => u64::MAX,
        }
    }
}

impl fmt::Display for HolderType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::None => "none",
            Self::Byte => "byte",
            Self::Boolean => "boolean",
            Self::Int16 => "int16",
            Self::Uint16 => "uint16",
            Self::Int32 => "int32",
            Self::Uint32 => "uint32",
            Self::Int64 => "int64",
            Self::Uint64 => "uint64",
            Self::Double => "double",
            Self::String => "string",
            Self::ObjectPath => "object path",
            Self::Signature => "signature",
            Self::Array => "array",
            Self::Dict => "dictionary",
        };
        f.write_str(s)
    }
}

/// A D-Bus type signature carried as a value (`g`).
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Signature(String);

impl Signature {
    pub fn new(signature: impl Into<String>) -> Self {
        Self(signature.into())
    }

    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for Signature {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.0, f)
    }
}

/// A tagged D-Bus value.
///
/// The type tag is fixed when the [`Holder`] is created. Containers are built up by appending and
/// then treated as read-only.
#[derive(Debug, Clone, Default)]
pub struct Holder {
    ty: HolderType,
    slot: Slot,
    signature: Option<String>,
}

#[derive(Debug, Clone, Default)]
enum Slot {
    #[default]
    Empty,
    Boolean(bool),
    Integer(u64),
    Double(f64),
    Text(String),
    Array(Vec<Holder>),
    // (key, value) in insertion order. Keys are always basic holders.
    Dict(Vec<(Holder, Holder)>),
}

impl Holder {
    /// Returns an empty [`HolderType::None`] holder.
    pub fn none() -> Self {
        Self::default()
    }

    /// Creates a holder from any value with a [`From`] conversion, picking the matching tag.
    pub fn create<T: Into<Holder>>(value: T) -> Self {
        value.into()
    }

    /// Creates an empty array.
    pub fn array() -> Self {
        Self::with(HolderType::Array, Slot::Array(Vec::new()))
    }

    /// Creates an empty dictionary.
    pub fn dict() -> Self {
        Self::with(HolderType::Dict, Slot::Dict(Vec::new()))
    }

    fn with(ty: HolderType, slot: Slot) -> Self {
        Self {
            ty,
            slot,
            signature: None,
        }
    }

    fn integer(ty: HolderType, raw: u64) -> Self {
        Self::with(ty, Slot::Integer(raw))
    }

    fn text(ty: HolderType, text: String) -> Self {
        Self::with(ty, Slot::Text(text))
    }

    /// Returns the type tag of this holder.
    #[inline]
    pub fn ty(&self) -> HolderType {
        self.ty
    }

    /// Converts the held value to `T`.
    ///
    /// Integer types accept any integer holder and mask it to their own width. Any other mismatch
    /// between `T` and the held type is an error.
    pub fn get<T: FromHolder>(&self) -> Result<T> {
        T::from_holder(self)
    }

    /// Appends an element to an array holder.
    ///
    /// # Panics
    ///
    /// Panics if this holder is not an array.
    pub fn array_append(&mut self, value: impl Into<Holder>) {
        match &mut self.slot {
            Slot::Array(items) => items.push(value.into()),
            _ => panic!("cannot append an array element to a {} holder", self.ty),
        }
    }

    /// Appends an entry to a dictionary holder.
    ///
    /// Entries keep their insertion order, and keys of different basic types may be mixed.
    ///
    /// # Panics
    ///
    /// Panics if this holder is not a dictionary, or if `key` is not of a basic type.
    pub fn dict_append(&mut self, key: impl Into<Holder>, value: impl Into<Holder>) {
        let key = key.into();
        if key.ty.code().is_none() {
            panic!("a {} cannot be used as a dictionary key", key.ty);
        }
        match &mut self.slot {
            Slot::Dict(entries) => entries.push((key, value.into())),
            _ => panic!("cannot append a dictionary entry to a {} holder", self.ty),
        }
    }

    /// Returns the number of elements of an array or entries of a dictionary.
    ///
    /// Returns 0 for every other type.
    pub fn len(&self) -> usize {
        match &self.slot {
            Slot::Array(items) => items.len(),
            Slot::Dict(entries) => entries.len(),
            _ => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Iterates over the elements of an array holder (nothing for other types).
    pub fn array_iter(&self) -> std::slice::Iter<'_, Holder> {
        match &self.slot {
            Slot::Array(items) => items.iter(),
            _ => [].iter(),
        }
    }

    /// Returns every dictionary entry as `(key, value)` in insertion order.
    pub fn dict_entries(&self) -> &[(Holder, Holder)] {
        match &self.slot {
            Slot::Dict(entries) => entries,
            _ => &[],
        }
    }

    /// Iterates, in insertion order, over the dictionary entries whose key is of type `K`.
    pub fn dict_iter<K: DictKey>(&self) -> impl Iterator<Item = (K, &Holder)> + '_ {
        self.dict_entries()
            .iter()
            .filter(|(key, _)| key.ty == K::TYPE)
            .filter_map(|(key, value)| K::from_holder(key).ok().map(|key| (key, value)))
    }

    /// Looks up a dictionary entry by key.
    ///
    /// If the key occurs more than once, the last entry wins.
    pub fn dict_get<K: DictKey>(&self, key: &K) -> Option<&Holder> {
        self.dict_iter::<K>()
            .filter(|(k, _)| k == key)
            .last()
            .map(|(_, value)| value)
    }

    /// Forces [`Holder::signature`] to return `signature`.
    pub fn set_signature_override(&mut self, signature: impl Into<String>) {
        self.signature = Some(signature.into());
    }

    pub fn signature_override(&self) -> Option<&str> {
        self.signature.as_deref()
    }

    /// Returns the D-Bus type signature of this value.
    ///
    /// Arrays whose elements don't all share one type, and dictionaries whose values don't (or
    /// whose values are containers), use the variant type `v` for their contents. Empty arrays
    /// are `av` and empty dictionaries are `a{sv}`.
    pub fn signature(&self) -> String {
        if let Some(signature) = &self.signature {
            return signature.clone();
        }

        match &self.slot {
            Slot::Array(items) => format!("a{}", contents_signature(items.iter(), true)),
            Slot::Dict(entries) if entries.is_empty() => "a{sv}".to_string(),
            Slot::Dict(entries) => format!(
                "a{{{}{}}}",
                contents_signature(entries.iter().map(|(key, _)| key), false),
                contents_signature(entries.iter().map(|(_, value)| value), false),
            ),
            _ => self.ty.code().map(String::from).unwrap_or_default(),
        }
    }

    /// Renders the value as a multi-line, indented, human-readable string.
    ///
    /// Byte arrays are hex-dumped 32 bytes per line. This is meant for logs and diagnostics only.
    pub fn represent(&self) -> String {
        let mut out = String::new();
        for line in self.represent_lines() {
            out.push_str(&line);
            out.push('\n');
        }
        out
    }

    fn represent_lines(&self) -> Vec<String> {
        match &self.slot {
            Slot::Array(items) => {
                let mut lines = vec!["Array:".to_string()];
                if items.first().map(Holder::ty) == Some(HolderType::Byte) {
                    for chunk in items.chunks(32) {
                        let line: String = chunk
                            .iter()
                            .map(|byte| format!("{:02x} ", byte.get::<u8>().unwrap_or(0)))
                            .collect();
                        lines.push(format!("  {}", line));
                    }
                } else {
                    for item in items {
                        lines.extend(item.represent_lines().into_iter().map(|l| format!("  {}", l)));
                    }
                }
                lines
            }
            Slot::Dict(entries) => {
                let mut lines = vec!["Dictionary:".to_string()];
                for (key, value) in entries {
                    lines.push(format!("  {}:", key.represent_inline()));
                    lines.extend(value.represent_lines().into_iter().map(|l| format!("    {}", l)));
                }
                lines
            }
            _ => vec![self.represent_inline()],
        }
    }

    fn represent_inline(&self) -> String {
        match &self.slot {
            Slot::Empty => "None".to_string(),
            Slot::Boolean(b) => b.to_string(),
            Slot::Integer(raw) => match self.ty {
                HolderType::Byte => (*raw as u8).to_string(),
                HolderType::Int16 => (*raw as u16 as i16).to_string(),
                HolderType::Uint16 => (*raw as u16).to_string(),
                HolderType::Int32 => (*raw as u32 as i32).to_string(),
                HolderType::Uint32 => (*raw as u32).to_string(),
                HolderType::Int64 => (*raw as i64).to_string(),
                _ => raw.to_string(),
            },
            Slot::Double(d) => d.to_string(),
            Slot::Text(s) => s.clone(),
            Slot::Array(_) | Slot::Dict(_) => self.ty.to_string(),
        }
    }

    // Orders entries by key; used for dictionaries decoded from unordered maps.
    pub(crate) fn sort_dict(&mut self) {
        if let Slot::Dict(entries) = &mut self.slot {
            entries.sort_by(|(a, _), (b, _)| (a.ty, a.key_repr()).cmp(&(b.ty, b.key_repr())));
        }
    }

    fn key_repr(&self) -> KeyRepr<'_> {
        match &self.slot {
            Slot::Boolean(b) => KeyRepr::Boolean(*b),
            Slot::Integer(raw) => KeyRepr::Integer(raw & self.ty.width_mask()),
            Slot::Double(d) => KeyRepr::Double(d.to_bits()),
            Slot::Text(s) => KeyRepr::Text(s),
            Slot::Empty | Slot::Array(_) | Slot::Dict(_) => KeyRepr::Empty,
        }
    }

    // One map over every key type; equal maps means equal projections onto each key type.
    fn dict_projection(&self) -> BTreeMap<(HolderType, KeyRepr<'_>), &Holder> {
        self.dict_entries()
            .iter()
            .map(|(key, value)| ((key.ty, key.key_repr()), value))
            .collect()
    }
}

#[derive(PartialEq, Eq, PartialOrd, Ord)]
enum KeyRepr<'a> {
    Empty,
    Boolean(bool),
    Integer(u64),
    Double(u64),
    Text(&'a str),
}

fn contents_signature<'a>(mut items: impl Iterator<Item = &'a Holder>, containers: bool) -> String {
    let Some(first) = items.next() else {
        return "v".to_string();
    };
    let signature = first.signature();
    if signature.is_empty() || (!containers && first.ty.is_container()) {
        return "v".to_string();
    }
    for item in items {
        if item.ty != first.ty || item.signature() != signature {
            return "v".to_string();
        }
    }
    signature
}

impl PartialEq for Holder {
    fn eq(&self, other: &Self) -> bool {
        if self.ty != other.ty {
            return false;
        }

        match (&self.slot, &other.slot) {
            (Slot::Empty, Slot::Empty) => true,
            (Slot::Boolean(a), Slot::Boolean(b)) => a == b,
            (Slot::Integer(a), Slot::Integer(b)) => {
                let mask = self.ty.width_mask();
                a & mask == b & mask
            }
            (Slot::Double(a), Slot::Double(b)) => a == b || (a.is_nan() && b.is_nan()),
            (Slot::Text(a), Slot::Text(b)) => a == b,
            (Slot::Array(a), Slot::Array(b)) => a == b,
            (Slot::Dict(_), Slot::Dict(_)) => self.dict_projection() == other.dict_projection(),
            _ => false,
        }
    }
}

/// Conversion out of a [`Holder`], used by [`Holder::get`].
pub trait FromHolder: Sized {
    fn from_holder(holder: &Holder) -> Result<Self>;
}

/// A basic type usable as a typed dictionary key.
///
/// Typed dictionary access ([`Holder::dict_iter`], map conversions) only sees the entries whose
/// key has exactly the tag [`DictKey::TYPE`].
pub trait DictKey: Into<Holder> + FromHolder + Ord + Clone {
    const TYPE: HolderType;
}

macro_rules! integer_holder {
    ($($t:ty => $variant:ident, $mask:expr;)*) => {$(
        impl From<$t> for Holder {
            fn from(value: $t) -> Self {
                Holder::integer(HolderType::$variant, value as u64)
            }
        }

        impl FromHolder for $t {
            fn from_holder(holder: &Holder) -> Result<Self> {
                match holder.slot {
                    Slot::Integer(raw) => Ok((raw & $mask) as $t),
                    _ => Err(Error::wrong_variant_type(stringify!($t), holder.ty)),
                }
            }
        }

        impl DictKey for $t {
            const TYPE: HolderType = HolderType::$variant;
        }
    )*};
}

integer_holder! {
    u8 => Byte, 0xFF;
    i16 => Int16, 0xFFFF;
    u16 => Uint16, 0xFFFF;
    i32 => Int32, 0xFFFF_FFFF;
    u32 => Uint32, 0xFFFF_FFFF;
    i64 => Int64, u64::MAX;
    u64 => Uint64, u64::MAX;
}

impl From<bool> for Holder {
    fn from(value: bool) -> Self {
        Holder::with(HolderType::Boolean, Slot::Boolean(value))
    }
}

impl FromHolder for bool {
    fn from_holder(holder: &Holder) -> Result<Self> {
        match holder.slot {
            Slot::Boolean(b) => Ok(b),
            _ => Err(Error::wrong_variant_type("bool", holder.ty)),
        }
    }
}

impl DictKey for bool {
    const TYPE: HolderType = HolderType::Boolean;
}

impl From<f64> for Holder {
    fn from(value: f64) -> Self {
        Holder::with(HolderType::Double, Slot::Double(value))
    }
}

impl FromHolder for f64 {
    fn from_holder(holder: &Holder) -> Result<Self> {
        match holder.slot {
            Slot::Double(d) => Ok(d),
            _ => Err(Error::wrong_variant_type("f64", holder.ty)),
        }
    }
}

impl From<String> for Holder {
    fn from(value: String) -> Self {
        Holder::text(HolderType::String, value)
    }
}

impl From<&str> for Holder {
    fn from(value: &str) -> Self {
        Holder::text(HolderType::String, value.to_string())
    }
}

/// Reads strings, object paths and signatures alike.
impl FromHolder for String {
    fn from_holder(holder: &Holder) -> Result<Self> {
        match &holder.slot {
            Slot::Text(s) => Ok(s.clone()),
            _ => Err(Error::wrong_variant_type("String", holder.ty)),
        }
    }
}

impl DictKey for String {
    const TYPE: HolderType = HolderType::String;
}

impl From<Path> for Holder {
    fn from(value: Path) -> Self {
        Holder::text(HolderType::ObjectPath, value.into())
    }
}

impl From<&Path> for Holder {
    fn from(value: &Path) -> Self {
        Holder::text(HolderType::ObjectPath, value.as_str().to_string())
    }
}

impl FromHolder for Path {
    fn from_holder(holder: &Holder) -> Result<Self> {
        match (&holder.slot, holder.ty) {
            (Slot::Text(s), HolderType::ObjectPath) => Ok(Path::new(s.clone())?),
            _ => Err(Error::wrong_variant_type("Path", holder.ty)),
        }
    }
}

impl DictKey for Path {
    const TYPE: HolderType = HolderType::ObjectPath;
}

impl From<Signature> for Holder {
    fn from(value: Signature) -> Self {
        Holder::text(HolderType::Signature, value.0)
    }
}

impl FromHolder for Signature {
    fn from_holder(holder: &Holder) -> Result<Self> {
        match (&holder.slot, holder.ty) {
            (Slot::Text(s), HolderType::Signature) => Ok(Signature(s.clone())),
            _ => Err(Error::wrong_variant_type("Signature", holder.ty)),
        }
    }
}

impl DictKey for Signature {
    const TYPE: HolderType = HolderType::Signature;
}

impl FromHolder for Holder {
    fn from_holder(holder: &Holder) -> Result<Self> {
        Ok(holder.clone())
    }
}

impl<T: Into<Holder>> From<Vec<T>> for Holder {
    fn from(value: Vec<T>) -> Self {
        Holder::with(
            HolderType::Array,
            Slot::Array(value.into_iter().map(Into::into).collect()),
        )
    }
}

impl<T: FromHolder> FromHolder for Vec<T> {
    fn from_holder(holder: &Holder) -> Result<Self> {
        match &holder.slot {
            Slot::Array(items) => items.iter().map(T::from_holder).collect(),
            _ => Err(Error::wrong_variant_type("array", holder.ty)),
        }
    }
}

impl<K: DictKey, V: Into<Holder>> From<BTreeMap<K, V>> for Holder {
    fn from(value: BTreeMap<K, V>) -> Self {
        let mut dict = Holder::dict();
        for (key, value) in value {
            dict.dict_append(key, value);
        }
        dict
    }
}

impl<K: DictKey, V: FromHolder> FromHolder for BTreeMap<K, V> {
    fn from_holder(holder: &Holder) -> Result<Self> {
        if holder.ty != HolderType::Dict {
            return Err(Error::wrong_variant_type("dictionary", holder.ty));
        }
        holder
            .dict_iter::<K>()
            .map(|(key, value)| Ok((key, V::from_holder(value)?)))
            .collect()
    }
}

impl<K: DictKey + Hash, V: FromHolder> FromHolder for HashMap<K, V> {
    fn from_holder(holder: &Holder) -> Result<Self> {
        if holder.ty != HolderType::Dict {
            return Err(Error::wrong_variant_type("dictionary", holder.ty));
        }
        holder
            .dict_iter::<K>()
            .map(|(key, value)| Ok((key, V::from_holder(value)?)))
            .collect()
    }
}
