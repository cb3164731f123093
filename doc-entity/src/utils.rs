use tikv_client::Key;

use crate::Error;

pub(crate) fn document_path(bucket: &str, id: &str) -> String {
    format!("{}/doc/{}", bucket, id)
}

pub(crate) fn document_prefix(bucket: &str) -> String {
    format!("{}/doc/", bucket)
}

pub(crate) fn design_document_path(bucket: &str, name: &str) -> String {
    format!("{}/design/{}", bucket, name)
}

/// Smallest key strictly greater than `key`.
pub(crate) fn next_key(key: &Key) -> Key {
    let mut next_key = Into::<Vec<u8>>::into(key.clone());
    next_key.push(0);
    Key::from(next_key)
}

/// Smallest key greater than every key starting with `prefix`.
pub(crate) fn prefix_end(prefix: &str) -> Key {
    let mut end = prefix.as_bytes().to_vec();
    while let Some(last) = end.pop() {
        if last < 0xff {
            end.push(last + 1);
            return Key::from(end);
        }
    }
    Key::from(end)
}

pub(crate) fn key_to_string(key: &Key) -> Result<String, Error> {
    String::from_utf8(Into::<Vec<u8>>::into(key.clone())).map_err(Error::InvalidUtf8)
}

/// Id for records created without one.
pub fn generate_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

pub(crate) fn capitalize(name: &str) -> String {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}
