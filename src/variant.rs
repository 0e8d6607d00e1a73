//! Normalization of variant-typed D-Bus dictionaries.
//!
//! BlueZ transports advertisement payloads as dictionaries of variants.
//! The functions here flatten them into plain byte-vector maps and are
//! total: entries whose value does not cast to a byte sequence are dropped
//! with a warning, and empty input yields empty output.

use dbus::arg::{cast, RefArg, Variant};
use std::{collections::HashMap, hash::Hash};
use uuid::Uuid;

/// Flattens a variant dictionary into a map of byte vectors, keeping the keys.
pub(crate) fn byte_dict<K>(dict: &HashMap<K, Variant<Box<dyn RefArg + 'static>>>) -> HashMap<K, Vec<u8>>
where
    K: Clone + Eq + Hash,
{
    let mut out = HashMap::new();
    for (key, value) in dict {
        match cast::<Vec<u8>>(&value.0).cloned() {
            Some(bytes) => {
                out.insert(key.clone(), bytes);
            }
            None => {
                log::warn!("dropping dictionary entry with non-byte value of signature {}", value.0.signature());
            }
        }
    }
    out
}

/// Flattens a string-keyed variant dictionary into a map of byte vectors keyed by UUID.
///
/// Entries with unparseable keys are dropped along with non-byte values.
pub(crate) fn uuid_byte_dict(
    dict: &HashMap<String, Variant<Box<dyn RefArg + 'static>>>,
) -> HashMap<Uuid, Vec<u8>> {
    let mut out = HashMap::new();
    for (key, value) in dict {
        match (key.parse::<Uuid>(), cast::<Vec<u8>>(&value.0).cloned()) {
            (Ok(uuid), Some(bytes)) => {
                out.insert(uuid, bytes);
            }
            (Err(_), _) => {
                log::warn!("dropping dictionary entry with invalid UUID key {}", key);
            }
            (_, None) => {
                log::warn!("dropping dictionary entry with non-byte value of signature {}", value.0.signature());
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bytes_variant(bytes: &[u8]) -> Variant<Box<dyn RefArg + 'static>> {
        Variant(Box::new(bytes.to_vec()))
    }

    fn string_variant(s: &str) -> Variant<Box<dyn RefArg + 'static>> {
        Variant(Box::new(s.to_string()))
    }

    #[test]
    fn byte_dict_flattens_byte_values() {
        let mut dict = HashMap::new();
        dict.insert(0x004c_u16, bytes_variant(&[0x02, 0x15]));
        dict.insert(0x0075_u16, bytes_variant(&[0x42]));

        let out = byte_dict(&dict);
        assert_eq!(out.len(), 2);
        assert_eq!(out[&0x004c], vec![0x02, 0x15]);
        assert_eq!(out[&0x0075], vec![0x42]);
    }

    #[test]
    fn byte_dict_drops_non_byte_values() {
        let mut dict = HashMap::new();
        dict.insert(1_u16, bytes_variant(&[1, 2, 3]));
        dict.insert(2_u16, string_variant("not bytes"));

        let out = byte_dict(&dict);
        assert_eq!(out.len(), 1);
        assert_eq!(out[&1], vec![1, 2, 3]);
    }

    #[test]
    fn byte_dict_of_empty_input_is_empty() {
        let dict: HashMap<u8, Variant<Box<dyn RefArg + 'static>>> = HashMap::new();
        assert!(byte_dict(&dict).is_empty());
    }

    #[test]
    fn uuid_byte_dict_parses_keys() {
        let mut dict = HashMap::new();
        dict.insert("0000180f-0000-1000-8000-00805f9b34fb".to_string(), bytes_variant(&[0x64]));

        let out = uuid_byte_dict(&dict);
        let uuid: Uuid = "0000180f-0000-1000-8000-00805f9b34fb".parse().unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[&uuid], vec![0x64]);
    }

    #[test]
    fn uuid_byte_dict_drops_bad_entries() {
        let mut dict = HashMap::new();
        dict.insert("not-a-uuid".to_string(), bytes_variant(&[1]));
        dict.insert("0000180f-0000-1000-8000-00805f9b34fb".to_string(), string_variant("nope"));

        assert!(uuid_byte_dict(&dict).is_empty());
    }
}
