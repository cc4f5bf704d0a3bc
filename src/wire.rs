//! Conversion between [`Holder`]s and zbus' dynamic [`Value`]s.

use std::{collections::HashMap, hash::Hash};

use zbus::zvariant::{self, Array, Basic, Dict, ObjectPath, Value};

use crate::{holder::Signature, path::Path, Error, Holder, HolderType, Result};

/// Encodes `holder` as a value of the D-Bus type `signature`.
///
/// `v` wraps the holder in a variant typed by [`Holder::signature`]. Arrays and dictionaries
/// encode their contents with the element (or key and value) signature. Basic types must match
/// the holder's tag exactly.
pub fn encode(holder: &Holder, signature: &str) -> Result<Value<'static>> {
    let mut chars = signature.chars();
    let Some(first) = chars.next() else {
        return Err(Error::other("cannot encode a value with an empty signature"));
    };

    match first {
        'v' => {
            let inner = holder.signature();
            if inner.is_empty() {
                return Err(Error::wrong_variant_type("a value", holder.ty()));
            }
            Ok(Value::Value(Box::new(encode(holder, &inner)?)))
        }
        'a' if signature.starts_with("a{") && signature.ends_with('}') => {
            if holder.ty() != HolderType::Dict {
                return Err(Error::wrong_variant_type(signature, holder.ty()));
            }
            let (Some(key_sig), Some(value_sig)) =
                (signature.get(2..3), signature.get(3..signature.len() - 1))
            else {
                return Err(Error::other(format!("malformed dictionary type `{}`", signature)));
            };
            if !is_basic(key_sig) || value_sig.is_empty() {
                return Err(Error::other(format!("malformed dictionary type `{}`", signature)));
            }
            let mut dict = Dict::new(owned_signature(key_sig)?, owned_signature(value_sig)?);
            for (key, value) in holder.dict_entries() {
                dict.append(encode(key, key_sig)?, encode(value, value_sig)?)
                    .map_err(Error::from)?;
            }
            Ok(Value::Dict(dict))
        }
        'a' => {
            if holder.ty() != HolderType::Array {
                return Err(Error::wrong_variant_type(signature, holder.ty()));
            }
            let element_sig = &signature[1..];
            if element_sig.is_empty() {
                return Err(Error::other("array type without an element type"));
            }
            let mut array = Array::new(owned_signature(element_sig)?);
            for item in holder.array_iter() {
                array.append(encode(item, element_sig)?).map_err(Error::from)?;
            }
            Ok(Value::Array(array))
        }
        code if chars.next().is_none() => encode_basic(holder, code),
        _ => Err(Error::other(format!(
            "cannot encode a value as `{}`",
            signature
        ))),
    }
}

fn encode_basic(holder: &Holder, code: char) -> Result<Value<'static>> {
    if holder.ty().code() != Some(code) {
        return Err(Error::wrong_variant_type(code.to_string(), holder.ty()));
    }

    Ok(match code {
        'y' => Value::U8(holder.get()?),
        'b' => Value::Bool(holder.get()?),
        'n' => Value::I16(holder.get()?),
        'q' => Value::U16(holder.get()?),
        'i' => Value::I32(holder.get()?),
        'u' => Value::U32(holder.get()?),
        'x' => Value::I64(holder.get()?),
        't' => Value::U64(holder.get()?),
        'd' => Value::F64(holder.get()?),
        's' => Value::from(holder.get::<String>()?),
        'o' => Value::ObjectPath(
            ObjectPath::try_from(holder.get::<String>()?).map_err(Error::from)?,
        ),
        'g' => Value::Signature(owned_signature(&holder.get::<String>()?)?),
        _ => unreachable!("every basic type code is handled"),
    })
}

fn is_basic(code: &str) -> bool {
    matches!(code, "y" | "b" | "n" | "q" | "i" | "u" | "x" | "t" | "d" | "s" | "o" | "g")
}

fn owned_signature(signature: &str) -> Result<zvariant::Signature<'static>> {
    zvariant::Signature::try_from(signature.to_string()).map_err(Error::from)
}

/// Decodes a received [`Value`] into a [`Holder`].
///
/// Variants are unwrapped, and structures become arrays of their fields. Arrays and dictionaries
/// keep the type they were received as (see [`Holder::set_signature_override`]), so that they are
/// sent back unchanged. File descriptors can't be represented and fail to decode.
pub fn decode(value: &Value<'_>) -> Result<Holder> {
    Ok(match value {
        Value::U8(v) => Holder::create(*v),
        Value::Bool(v) => Holder::create(*v),
        Value::I16(v) => Holder::create(*v),
        Value::U16(v) => Holder::create(*v),
        Value::I32(v) => Holder::create(*v),
        Value::U32(v) => Holder::create(*v),
        Value::I64(v) => Holder::create(*v),
        Value::U64(v) => Holder::create(*v),
        Value::F64(v) => Holder::create(*v),
        Value::Str(s) => Holder::create(s.as_str()),
        Value::Signature(s) => Holder::create(Signature::new(s.as_str())),
        Value::ObjectPath(p) => Holder::create(Path::new(p.as_str())?),
        Value::Value(inner) => decode(inner)?,
        Value::Array(array) => {
            let mut holder = Holder::array();
            for item in array.get() {
                holder.array_append(decode(item)?);
            }
            holder.set_signature_override(value.value_signature().as_str());
            holder
        }
        Value::Dict(dict) => {
            let signature = value.value_signature();
            let mut holder = decode_dict(dict, signature.as_str())?;
            holder.set_signature_override(signature.as_str());
            holder
        }
        Value::Structure(structure) => {
            let mut holder = Holder::array();
            for field in structure.fields() {
                holder.array_append(decode(field)?);
            }
            holder
        }
        other => {
            return Err(Error::other(format!(
                "cannot decode a value of type `{}`",
                other.value_signature()
            )))
        }
    })
}

fn decode_dict(dict: &Dict<'_, '_>, signature: &str) -> Result<Holder> {
    match signature.chars().nth(2) {
        Some('y') => decode_entries(dict, |k: u8| Ok(Holder::create(k))),
        Some('b') => decode_entries(dict, |k: bool| Ok(Holder::create(k))),
        Some('n') => decode_entries(dict, |k: i16| Ok(Holder::create(k))),
        Some('q') => decode_entries(dict, |k: u16| Ok(Holder::create(k))),
        Some('i') => decode_entries(dict, |k: i32| Ok(Holder::create(k))),
        Some('u') => decode_entries(dict, |k: u32| Ok(Holder::create(k))),
        Some('x') => decode_entries(dict, |k: i64| Ok(Holder::create(k))),
        Some('t') => decode_entries(dict, |k: u64| Ok(Holder::create(k))),
        Some('s') => decode_entries(dict, |k: String| Ok(Holder::create(k))),
        Some('o') => decode_entries::<ObjectPath<'_>, _>(dict, |k| {
            Ok(Holder::create(Path::new(k.as_str())?))
        }),
        Some('g') => decode_entries::<zvariant::Signature<'_>, _>(dict, |k| {
            Ok(Holder::create(Signature::new(k.as_str())))
        }),
        _ => Err(Error::other(format!(
            "unsupported dictionary type `{}`",
            signature
        ))),
    }
}

fn decode_entries<'k, 'v, K, F>(dict: &Dict<'k, 'v>, key: F) -> Result<Holder>
where
    F: Fn(K) -> Result<Holder>,
    K: Basic + TryFrom<Value<'k>> + Hash + Eq,
    K::Error: Into<zvariant::Error>,
{
    let map = HashMap::<K, Value<'v>>::try_from(dict.clone()).map_err(Error::from)?;
    let mut holder = Holder::dict();
    for (k, v) in map {
        holder.dict_append(key(k)?, decode(&v)?);
    }
    holder.sort_dict();
    Ok(holder)
}

/// Decodes a `a{sv}` property map as delivered by the `org.freedesktop.DBus.Properties` and
/// `org.freedesktop.DBus.ObjectManager` signals.
pub(crate) fn decode_properties(properties: &HashMap<&str, Value<'_>>) -> Result<Holder> {
    let mut holder = Holder::dict();
    for (name, value) in properties {
        holder.dict_append(*name, decode(value)?);
    }
    holder.sort_dict();
    Ok(holder)
}
