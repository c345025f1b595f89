use crate::error::{Result, TunnelError};

/// Decode a `Transfer-Encoding: chunked` body from the front of `buf`.
///
/// Returns the decoded body and the number of bytes consumed (including the
/// trailer section), or `None` when `buf` ends before the last chunk.
pub(crate) fn decode(buf: &[u8], max_len: usize) -> Result<Option<(Vec<u8>, usize)>> {
    let mut body = Vec::new();
    let mut pos = 0;

    loop {
        let (line_len, size) = match httparse::parse_chunk_size(&buf[pos..]) {
            Ok(httparse::Status::Complete(parsed)) => parsed,
            Ok(httparse::Status::Partial) => return Ok(None),
            Err(_) => return Err(TunnelError::Malformed("invalid chunk size".to_string())),
        };
        pos += line_len;
        if size == 0 {
            break;
        }

        let too_large = || TunnelError::Malformed("chunked body too large".to_string());
        let size = usize::try_from(size)
            .ok()
            .filter(|size| {
                body.len()
                    .checked_add(*size)
                    .is_some_and(|total| total <= max_len)
            })
            .ok_or_else(too_large)?;
        let end = pos.checked_add(size).ok_or_else(too_large)?;
        let next = end.checked_add(2).ok_or_else(too_large)?;
        if buf.len() < next {
            return Ok(None);
        }
        if &buf[end..next] != b"\r\n" {
            return Err(TunnelError::Malformed(
                "chunk data not terminated by CRLF".to_string(),
            ));
        }
        body.extend_from_slice(&buf[pos..end]);
        pos = next;
    }

    // Trailer fields are dropped; the section ends with an empty line.
    loop {
        let rest = &buf[pos..];
        let Some(eol) = rest.windows(2).position(|w| w == b"\r\n") else {
            return Ok(None);
        };
        pos += eol + 2;
        if eol == 0 {
            return Ok(Some((body, pos)));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_complete_body() {
        let raw = b"5\r\nhello\r\n6;ext=1\r\n world\r\n0\r\n\r\nNEXT";
        let (body, consumed) = decode(raw, usize::MAX).unwrap().unwrap();
        assert_eq!(body, b"hello world");
        assert_eq!(&raw[consumed..], b"NEXT");
    }

    #[test]
    fn test_decode_with_trailers() {
        let raw = b"3\r\nabc\r\n0\r\nExpires: never\r\n\r\n";
        let (body, consumed) = decode(raw, usize::MAX).unwrap().unwrap();
        assert_eq!(body, b"abc");
        assert_eq!(consumed, raw.len());
    }

    #[test]
    fn test_decode_partial() {
        assert!(decode(b"5\r\nhel", usize::MAX).unwrap().is_none());
        assert!(decode(b"5\r\nhello\r\n", usize::MAX).unwrap().is_none());
        assert!(decode(b"0\r\n", usize::MAX).unwrap().is_none());
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(decode(b"zz\r\n", usize::MAX).is_err());
        assert!(decode(b"3\r\nabcXX0\r\n\r\n", usize::MAX).is_err());
        assert!(decode(b"10\r\n", 4).is_err());
    }

    #[test]
    fn test_decode_rejects_overflowing_size() {
        let huge = b"ffffffffffffffff\r\nabc";
        assert!(matches!(
            decode(huge, usize::MAX),
            Err(TunnelError::Malformed(_))
        ));

        let later = b"1\r\na\r\nffffffffffffffff\r\nzz";
        assert!(matches!(
            decode(later, usize::MAX),
            Err(TunnelError::Malformed(_))
        ));
    }
}
