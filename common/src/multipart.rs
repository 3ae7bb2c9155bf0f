//! Wire layout of `multipart/x-mixed-replace` sections shared by the sender,
//! which writes them, and the receiver, which splits them.

use bytes::{BufMut, Bytes, BytesMut};

/// One multipart section: boundary, headers, image, trailing CRLF.
///
/// `boundary` is the full token, leading dashes included.
pub fn format_part(boundary: &str, jpeg: &[u8]) -> Bytes {
    let header = format!(
        "{boundary}\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\n\r\n",
        jpeg.len()
    );
    let mut part = BytesMut::with_capacity(header.len() + jpeg.len() + 2);
    part.put_slice(header.as_bytes());
    part.put_slice(jpeg);
    part.put_slice(b"\r\n");
    part.freeze()
}

/// `Content-Type` header value announcing `boundary`.
pub fn content_type(boundary: &str) -> String {
    let bare = boundary.strip_prefix("--").unwrap_or(boundary);
    format!("multipart/x-mixed-replace; boundary={bare}")
}
