//! Inline big-column tokens.

use ktable_common::{BlobId, KtableError, Result};

use super::{STR_LIMIT, STR_MIN};

/// Location of a value inside a blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pointer {
    pub blob_id: BlobId,
    pub offset: usize,
    pub size: usize,
}

/// Parsed token: the inline prefix and, for long values, where the rest lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BigRef<'a> {
    pub prefix: &'a [u8],
    pub pointer: Option<Pointer>,
}

impl Pointer {
    fn parse(text: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(text)
            .map_err(|_| KtableError::Execution("big-column pointer is not utf-8".to_string()))?;
        let mut parts = text.split(':');
        let (Some(id), Some(offset), Some(size), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(KtableError::Execution(format!(
                "malformed big-column pointer '{text}'"
            )));
        };
        let num = |s: &str| {
            s.parse::<usize>().map_err(|_| {
                KtableError::Execution(format!("malformed big-column pointer '{text}'"))
            })
        };
        Ok(Self {
            blob_id: BlobId(id.to_string()),
            offset: num(offset)?,
            size: num(size)?,
        })
    }

    pub fn render(&self) -> String {
        format!("{}:{}:{}", self.blob_id, self.offset, self.size)
    }
}

impl<'a> BigRef<'a> {
    /// Splits a token at its last `~`. A token without `~` is a bare value.
    pub fn parse(token: &'a [u8]) -> Result<Self> {
        let Some(at) = token.iter().rposition(|b| *b == b'~') else {
            return Ok(Self {
                prefix: token,
                pointer: None,
            });
        };
        let (prefix, ptr) = (&token[..at], &token[at + 1..]);
        let pointer = if ptr.is_empty() {
            None
        } else {
            Some(Pointer::parse(ptr)?)
        };
        Ok(Self { prefix, pointer })
    }
}

/// True when `len` bytes fit inline.
pub fn is_short(len: usize) -> bool {
    len < STR_LIMIT
}

/// `value~`.
pub fn short_token(value: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(value.len() + 1);
    out.extend_from_slice(value);
    out.push(b'~');
    out
}

/// `prefix~blob:offset:size`.
pub fn long_token(prefix: &[u8], pointer: &Pointer) -> Vec<u8> {
    let ptr = pointer.render();
    let mut out = Vec::with_capacity(prefix.len() + 1 + ptr.len());
    out.extend_from_slice(prefix);
    out.push(b'~');
    out.extend_from_slice(ptr.as_bytes());
    out
}

/// First `STR_MIN` characters of a string, never splitting a character.
pub fn str_prefix(value: &str) -> &str {
    match value.char_indices().nth(STR_MIN) {
        Some((at, _)) => &value[..at],
        None => value,
    }
}

pub fn bytes_prefix(value: &[u8]) -> &[u8] {
    &value[..value.len().min(STR_MIN)]
}

#[cfg(test)]
mod tests {
    use ktable_common::BlobId;

    use super::{long_token, short_token, str_prefix, BigRef, Pointer};

    #[test]
    fn short_tokens_have_no_pointer() {
        let token = short_token(b"a~b");
        assert_eq!(token, b"a~b~");
        let r = BigRef::parse(&token).expect("parse");
        assert_eq!(r.prefix, b"a~b");
        assert!(r.pointer.is_none());
    }

    #[test]
    fn long_tokens_keep_prefix_and_pointer() {
        let ptr = Pointer {
            blob_id: BlobId("abc123".to_string()),
            offset: 17,
            size: 300,
        };
        let token = long_token(b"pre~fix", &ptr);
        assert_eq!(token, b"pre~fix~abc123:17:300");
        let r = BigRef::parse(&token).expect("parse");
        assert_eq!(r.prefix, b"pre~fix");
        assert_eq!(r.pointer, Some(ptr));
    }

    #[test]
    fn malformed_pointer_is_an_error() {
        assert!(BigRef::parse(b"x~id:1").is_err());
        assert!(BigRef::parse(b"x~id:a:2").is_err());
    }

    #[test]
    fn prefix_respects_char_boundaries() {
        let s = "ééééééééééééééé";
        assert_eq!(str_prefix(s).chars().count(), 12);
        assert_eq!(str_prefix("short"), "short");
    }
}
