//! Record-to-bytes conversion.
//!
//! The compactor is generic over the record type and takes the serialization
//! strategy as a value.

use bytes::Bytes;

/// Converts an application record to the bytes written into a part file.
pub trait Converter<T>: Send + Sync {
    fn convert(&self, record: &T) -> Bytes;
}

/// Passes byte records through unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct BytesConverter;

impl Converter<Vec<u8>> for BytesConverter {
    fn convert(&self, record: &Vec<u8>) -> Bytes {
        Bytes::copy_from_slice(record)
    }
}

impl Converter<Bytes> for BytesConverter {
    fn convert(&self, record: &Bytes) -> Bytes {
        record.clone()
    }
}

/// Encodes string records as UTF-8.
#[derive(Debug, Clone, Copy, Default)]
pub struct StringConverter;

impl Converter<String> for StringConverter {
    fn convert(&self, record: &String) -> Bytes {
        Bytes::copy_from_slice(record.as_bytes())
    }
}

impl Converter<&'static str> for StringConverter {
    fn convert(&self, record: &&'static str) -> Bytes {
        Bytes::from_static(record.as_bytes())
    }
}

impl<T, F> Converter<T> for F
where
    F: Fn(&T) -> Vec<u8> + Send + Sync,
{
    fn convert(&self, record: &T) -> Bytes {
        Bytes::from(self(record))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn convert_with<T>(converter: &dyn Converter<T>, record: T) -> Bytes {
        converter.convert(&record)
    }

    #[test]
    fn test_bytes_converter_is_identity() {
        let out = convert_with(&BytesConverter, vec![0u8, 159, 146, 150]);
        assert_eq!(out.as_ref(), &[0u8, 159, 146, 150]);
    }

    #[test]
    fn test_string_converter_encodes_utf8() {
        let out = convert_with(&StringConverter, "héllo".to_string());
        assert_eq!(out.as_ref(), "héllo".as_bytes());
    }

    #[test]
    fn test_closure_converter() {
        let to_csv = |r: &(u32, &str)| format!("{},{}", r.0, r.1).into_bytes();
        let out = convert_with(&to_csv, (7, "cpu"));
        assert_eq!(out.as_ref(), b"7,cpu");
    }
}
