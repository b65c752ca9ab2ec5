//! Detection of publish markers.
//!
//! A publish marker is written by the config console while a release is in
//! flight: `PUBLISH&{token}&{flag}&{revision}&{payload}`. It is control
//! metadata and never config content.

const PUBLISH_TAG: &str = "PUBLISH";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishMarker {
    pub token: String,
    pub flag: i64,
    pub revision: i64,
    pub payload: String,
}

impl PublishMarker {
    /// Parses `value` as a marker; `None` if it is regular content.
    pub fn parse(value: &[u8]) -> Option<Self> {
        let text = std::str::from_utf8(value).ok()?;
        let mut parts = text.splitn(5, '&');
        if parts.next()? != PUBLISH_TAG {
            return None;
        }
        let token = parts.next()?;
        let flag = parts.next()?.parse().ok()?;
        let revision = parts.next()?.parse().ok()?;
        let payload = parts.next()?;
        Some(Self {
            token: token.to_string(),
            flag,
            revision,
            payload: payload.to_string(),
        })
    }
}

/// Returns the marker revision if `value` is a publish marker.
pub fn check_publish(value: &[u8]) -> Option<i64> {
    PublishMarker::parse(value).map(|marker| marker.revision)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_marker() {
        let marker = PublishMarker::parse(b"PUBLISH&THIS_IS_TOKEN&1&22&SecretData==").unwrap();
        assert_eq!(marker.token, "THIS_IS_TOKEN");
        assert_eq!(marker.flag, 1);
        assert_eq!(marker.revision, 22);
        assert_eq!(marker.payload, "SecretData==");
    }

    #[test]
    fn test_payload_may_contain_separator() {
        let marker = PublishMarker::parse(b"PUBLISH&t&0&3&a&b").unwrap();
        assert_eq!(marker.payload, "a&b");
    }

    #[test]
    fn test_regular_content_is_not_a_marker() {
        assert_eq!(check_publish(b""), None);
        assert_eq!(check_publish(b"database = \"127.0.0.1:3306\""), None);
        assert_eq!(check_publish(b"PUBLISH&t&x&22&p"), None);
        assert_eq!(check_publish(b"PUBLISH&t&1&rev&p"), None);
        assert_eq!(check_publish(b"PUBLISH&t&1&22"), None);
        assert_eq!(check_publish(b"publish&t&1&22&p"), None);
        assert_eq!(check_publish(&[0xff, 0xfe]), None);
    }
}
