use base64::{prelude::BASE64_STANDARD, Engine};
use rand::distributions::{Alphanumeric, DistString};
use time::{OffsetDateTime, UtcOffset};
use yaserde::YaSerialize;

use crate::{
    error::{SamlError, SamlResult},
    DATE_TIME_FORMAT,
};

pub fn random_string(len: usize) -> String {
    Alphanumeric.sample_string(&mut rand::thread_rng(), len)
}

/// A fresh xs:ID value.
pub fn random_id() -> String {
    format!("_id{}", random_string(32))
}

pub fn decode_xml_base64(input: &str) -> Result<Vec<u8>, base64::DecodeError> {
    let stripped = input.replace([' ', '\n', '\r', '\t'], "");
    BASE64_STANDARD.decode(stripped)
}

/// xs:dateTime in UTC with second precision.
pub fn format_date_time(instant: OffsetDateTime) -> SamlResult<String> {
    instant
        .to_offset(UtcOffset::UTC)
        .format(&DATE_TIME_FORMAT)
        .map_err(|e| SamlError::Serialization(e.to_string()))
}

pub fn to_xml_string<T: YaSerialize>(value: &T) -> SamlResult<String> {
    yaserde::ser::to_string(value).map_err(SamlError::Serialization)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_ids_are_ncnames() {
        let id = random_id();
        assert!(id.starts_with("_id"));
        assert_eq!(id.len(), 35);
        assert_ne!(id, random_id());
    }

    #[test]
    fn decodes_wrapped_base64() {
        assert_eq!(decode_xml_base64("aGVs\n bG8=").unwrap(), b"hello");
    }

    #[test]
    fn formats_date_times_in_utc() {
        let instant = time::macros::datetime!(2023-09-08 16:53:02.250 +02:00);
        assert_eq!(format_date_time(instant).unwrap(), "2023-09-08T14:53:02Z");
    }
}
