//! Type-signature scanning.
//!
//! A signature is a string of single-character type tokens. Basic tokens are
//! `y b n q i u x t d s o g h`; containers are `a` followed by one element
//! signature, `(...)` structs, `{kv}` dict entries (legal only directly under
//! an array) and `v` variants. The codec walks signatures through
//! [`SignatureIter`] and uses the boundary finders below to carve out the
//! nested signature of a container it has just entered.

use crate::error::{Error, Result};

pub const BASIC_TOKENS: &str = "ybnqiuxtdsogh";

pub fn is_basic_token(token: char) -> bool {
    BASIC_TOKENS.contains(token)
}

/// Cursor over the tokens of a signature string.
#[derive(Debug, Clone)]
pub struct SignatureIter<'a> {
    sig: &'a str,
    pos: usize,
}

impl<'a> SignatureIter<'a> {
    pub fn new(sig: &'a str) -> SignatureIter<'a> {
        SignatureIter { sig, pos: 0 }
    }

    pub fn peek(&self) -> Option<char> {
        self.sig.as_bytes().get(self.pos).map(|b| *b as char)
    }

    pub fn is_empty(&self) -> bool {
        self.pos >= self.sig.len()
    }

    /// The unconsumed remainder of the signature.
    pub fn rest(&self) -> &'a str {
        &self.sig[self.pos..]
    }
}

impl<'a> Iterator for SignatureIter<'a> {
    type Item = char;

    fn next(&mut self) -> Option<char> {
        let b = *self.sig.as_bytes().get(self.pos)?;
        self.pos += 1;
        Some(b as char)
    }
}

/// Consumes tokens up to and including the `)` matching an already-consumed
/// `(`, returning the inner signature without the closing token.
pub fn find_struct_end(iter: &mut SignatureIter<'_>) -> Result<String> {
    find_container_end(iter, '(', ')')
}

/// Consumes tokens up to and including the `}` matching an already-consumed
/// `{`, returning the inner signature without the closing token.
pub fn find_dict_end(iter: &mut SignatureIter<'_>) -> Result<String> {
    find_container_end(iter, '{', '}')
}

fn find_container_end(iter: &mut SignatureIter<'_>, open: char, close: char) -> Result<String> {
    let mut depth = 1usize;
    let mut inner = String::new();
    for token in iter {
        if token == open {
            depth += 1;
        } else if token == close {
            depth -= 1;
            if depth == 0 {
                return Ok(inner);
            }
        }
        inner.push(token);
    }
    Err(Error::Signature(format!(
        "signature ended before matching '{}'",
        close
    )))
}

/// Consumes exactly one complete element signature. Called after the `a` of
/// an array has been consumed; a chain of `a` tokens recurses so
/// array-of-array element signatures come out whole.
pub fn find_array_element(iter: &mut SignatureIter<'_>) -> Result<String> {
    match iter.next() {
        Some('a') => {
            let mut elem = String::from("a");
            elem.push_str(&find_array_element(iter)?);
            Ok(elem)
        }
        Some('(') => {
            let mut elem = String::from("(");
            elem.push_str(&find_struct_end(iter)?);
            elem.push(')');
            Ok(elem)
        }
        Some('{') => {
            let mut elem = String::from("{");
            elem.push_str(&find_dict_end(iter)?);
            elem.push('}');
            Ok(elem)
        }
        Some(token) if is_basic_token(token) || token == 'v' => Ok(token.to_string()),
        Some(token) => Err(Error::Signature(format!(
            "unexpected token '{}' in array element signature",
            token
        ))),
        None => Err(Error::Signature(
            "signature ended before array element".to_owned(),
        )),
    }
}

/// Checks that a signature is a well-formed sequence of complete types:
/// balanced brackets, known tokens only, dict entries only directly under an
/// array and keyed by a single basic token.
pub fn validate_signature(sig: &str) -> Result<()> {
    let mut iter = SignatureIter::new(sig);
    while !iter.is_empty() {
        validate_single(&mut iter)?;
    }
    Ok(())
}

/// Counts the complete types at the top level of a signature.
pub fn count_complete_types(sig: &str) -> Result<usize> {
    let mut iter = SignatureIter::new(sig);
    let mut count = 0;
    while !iter.is_empty() {
        validate_single(&mut iter)?;
        count += 1;
    }
    Ok(count)
}

fn validate_single(iter: &mut SignatureIter<'_>) -> Result<()> {
    match iter.next() {
        Some(token) if is_basic_token(token) || token == 'v' => Ok(()),
        Some('a') => match iter.peek() {
            Some('{') => {
                iter.next();
                validate_dict_inner(iter)
            }
            Some(_) => validate_single(iter),
            None => Err(Error::Signature(
                "signature ended before array element".to_owned(),
            )),
        },
        Some('(') => {
            let mut members = 0;
            loop {
                match iter.peek() {
                    Some(')') => {
                        iter.next();
                        break;
                    }
                    Some(_) => {
                        validate_single(iter)?;
                        members += 1;
                    }
                    None => {
                        return Err(Error::Signature(
                            "signature ended before matching ')'".to_owned(),
                        ))
                    }
                }
            }
            if members == 0 {
                return Err(Error::Signature("empty struct signature".to_owned()));
            }
            Ok(())
        }
        Some('{') => Err(Error::Signature(
            "dict entry outside of array".to_owned(),
        )),
        Some(token) => Err(Error::Signature(format!("unknown token '{}'", token))),
        None => Err(Error::Signature("empty signature".to_owned())),
    }
}

fn validate_dict_inner(iter: &mut SignatureIter<'_>) -> Result<()> {
    match iter.next() {
        Some(key) if is_basic_token(key) => {}
        Some(key) => {
            return Err(Error::Signature(format!(
                "dict key token '{}' is not basic",
                key
            )))
        }
        None => {
            return Err(Error::Signature(
                "signature ended before dict key".to_owned(),
            ))
        }
    }
    validate_single(iter)?;
    match iter.next() {
        Some('}') => Ok(()),
        Some(token) => Err(Error::Signature(format!(
            "expected '}}' after dict value, got '{}'",
            token
        ))),
        None => Err(Error::Signature(
            "signature ended before matching '}'".to_owned(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn struct_end_returns_inner_signature() {
        // the leading '(' has already been consumed by the caller
        let mut iter = SignatureIter::new("ii)");
        assert_eq!(find_struct_end(&mut iter).unwrap(), "ii");
        assert!(iter.is_empty());
    }

    #[test]
    fn struct_end_handles_nesting() {
        let mut iter = SignatureIter::new("i(si)a{su})x");
        assert_eq!(find_struct_end(&mut iter).unwrap(), "i(si)a{su}");
        assert_eq!(iter.rest(), "x");
    }

    #[test]
    fn struct_end_fails_on_exhaustion() {
        let mut iter = SignatureIter::new("ii");
        assert!(matches!(
            find_struct_end(&mut iter),
            Err(Error::Signature(_))
        ));
    }

    #[test]
    fn dict_end_returns_inner_signature() {
        let mut iter = SignatureIter::new("sv}i");
        assert_eq!(find_dict_end(&mut iter).unwrap(), "sv");
        assert_eq!(iter.rest(), "i");
    }

    #[test]
    fn array_element_consumes_prefix_chains() {
        let mut iter = SignatureIter::new("aaiu");
        assert_eq!(find_array_element(&mut iter).unwrap(), "aai");
        assert_eq!(iter.rest(), "u");

        let mut iter = SignatureIter::new("(is)x");
        assert_eq!(find_array_element(&mut iter).unwrap(), "(is)");
        assert_eq!(iter.rest(), "x");

        let mut iter = SignatureIter::new("{sv}");
        assert_eq!(find_array_element(&mut iter).unwrap(), "{sv}");
        assert!(iter.is_empty());
    }

    #[test]
    fn array_element_rejects_stray_close() {
        let mut iter = SignatureIter::new(")i");
        assert!(matches!(
            find_array_element(&mut iter),
            Err(Error::Signature(_))
        ));
    }

    #[test]
    fn validation_accepts_well_formed_signatures() {
        for sig in ["", "i", "a{sv}", "a(ii)", "aaay", "(i(s)a{yv})", "vvv", "h"] {
            validate_signature(sig).unwrap();
        }
    }

    #[test]
    fn validation_rejects_malformed_signatures() {
        for sig in ["{si}", "a{vs}", "a{(i)s}", "(", "()", "z", "a", "(i"] {
            assert!(validate_signature(sig).is_err(), "accepted {:?}", sig);
        }
    }

    #[test]
    fn complete_type_count() {
        assert_eq!(count_complete_types("").unwrap(), 0);
        assert_eq!(count_complete_types("i").unwrap(), 1);
        assert_eq!(count_complete_types("ia{sv}(xy)").unwrap(), 3);
    }
}
