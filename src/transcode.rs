use std::borrow::Cow;

use bytes::Bytes;
use encoding_rs::Encoding;

/// Decode `body` with a legacy byte encoding into UTF-8 text.
///
/// Pass-through when no encoding is configured, and a cheap pass-through
/// when the bytes already decode borrowed (pure ASCII under most legacy code
/// pages). Undecodable sequences become replacement characters rather than
/// failing the response.
pub(crate) fn transcode(body: Bytes, encoding: Option<&'static Encoding>) -> Bytes {
    let Some(encoding) = encoding else {
        return body;
    };
    let (text, _, _) = encoding.decode(&body);
    match text {
        Cow::Borrowed(_) => body,
        Cow::Owned(text) => Bytes::from(text),
    }
}
