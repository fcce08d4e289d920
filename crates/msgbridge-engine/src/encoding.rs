//! Type-encoding conversion
//!
//! The runtime describes method signatures with a terse positional grammar:
//! one-character primitive codes, `{name=fields}` structs, `(name=members)`
//! unions, `[Ntype]` arrays, `^type` pointers, `bN` bitfields, optional
//! qualifier prefixes (`r`, `n`, `N`, `o`, `O`, `R`, `V`) and, in method
//! encodings, frame-offset digits after every type:
//!
//! ```text
//! i24@0:8i16B20          - (int)a:(int)x b:(BOOL)y
//! {CGPoint=dd}16@0:8     - (CGPoint)point
//! ```
//!
//! The scan format is the same text with `|` appended after every
//! top-level entry, so argument boundaries are explicit:
//!
//! ```text
//! i24|@0|:8|i16|B20|
//! ```
//!
//! Entry 0 is the return type, entry 1 the receiver, entry 2 the selector
//! and entries 3.. the declared parameters.

use msgbridge_sdk::{BridgeError, BridgeResult};

/// Delimiter appended after every entry in the scan format
pub const ARG_DELIMITER: u8 = b'|';

/// Index of the return type in the scan format
pub const RETURN_INDEX: usize = 0;

/// Index of the first declared parameter (after receiver and selector)
pub const FIRST_PARAM_INDEX: usize = 3;

const QUALIFIERS: &[u8] = b"rnNoORV";
const PRIMITIVES: &[u8] = b"cislqCISLQfdDBv*#:?";

// ============================================================================
// Scanning
// ============================================================================

/// Length of the type code starting at `start`, qualifiers included.
///
/// Aggregates span to their matching close delimiter; quoted names (field
/// names, object class names) are skipped without interpretation.
fn code_len(enc: &[u8], start: usize) -> Result<usize, &'static str> {
    let mut i = start;
    while i < enc.len() && QUALIFIERS.contains(&enc[i]) {
        i += 1;
    }
    let Some(&c) = enc.get(i) else {
        return Err("truncated type code");
    };
    i += 1;
    match c {
        b'{' | b'(' | b'[' => i = skip_nested(enc, i - 1)?,
        b'^' => i += code_len(enc, i)?,
        b'b' => {
            let end = skip_digits(enc, i);
            if end == i {
                return Err("bitfield without width");
            }
            i = end;
        }
        b'@' => match enc.get(i) {
            Some(b'"') => i = skip_quoted(enc, i)?,
            Some(b'?') => i += 1,
            _ => {}
        },
        c if PRIMITIVES.contains(&c) => {}
        _ => return Err("unknown type code"),
    }
    Ok(i - start)
}

/// Given the index of an open delimiter, return the index just past its match.
fn skip_nested(enc: &[u8], open: usize) -> Result<usize, &'static str> {
    let mut stack: Vec<u8> = Vec::with_capacity(4);
    let mut i = open;
    while i < enc.len() {
        match enc[i] {
            b'{' => stack.push(b'}'),
            b'(' => stack.push(b')'),
            b'[' => stack.push(b']'),
            b'"' => {
                i = skip_quoted(enc, i)?;
                continue;
            }
            close @ (b'}' | b')' | b']') => {
                if stack.pop() != Some(close) {
                    return Err("mismatched aggregate delimiter");
                }
                if stack.is_empty() {
                    return Ok(i + 1);
                }
            }
            _ => {}
        }
        i += 1;
    }
    Err("unterminated aggregate")
}

fn skip_quoted(enc: &[u8], quote: usize) -> Result<usize, &'static str> {
    match enc[quote + 1..].iter().position(|&b| b == b'"') {
        Some(len) => Ok(quote + 1 + len + 1),
        None => Err("unterminated quoted name"),
    }
}

fn skip_digits(enc: &[u8], mut i: usize) -> usize {
    while i < enc.len() && enc[i].is_ascii_digit() {
        i += 1;
    }
    i
}

/// Byte ranges of the top-level entries, frame-offset digits included.
fn entries(encoding: &str) -> BridgeResult<Vec<(usize, usize)>> {
    let enc = encoding.as_bytes();
    if enc.is_empty() {
        return Err(BridgeError::malformed(encoding, "empty encoding"));
    }
    let mut spans = Vec::new();
    let mut i = 0;
    while i < enc.len() {
        let len = code_len(enc, i).map_err(|reason| BridgeError::malformed(encoding, reason))?;
        let mut end = i + len;
        if enc.get(end) == Some(&b'-') {
            end += 1;
        }
        end = skip_digits(enc, end);
        spans.push((i, end));
        i = end;
    }
    Ok(spans)
}

// ============================================================================
// Conversion
// ============================================================================

/// Output capacity `convert` needs: the input, one delimiter per entry and a
/// terminator.
pub fn scan_capacity(encoding: &str) -> BridgeResult<usize> {
    Ok(encoding.len() + entries(encoding)?.len() + 1)
}

/// Convert a native encoding into the delimited scan format
pub fn convert(encoding: &str) -> BridgeResult<String> {
    let spans = entries(encoding)?;
    let mut out = String::with_capacity(encoding.len() + spans.len() + 1);
    for (start, end) in spans {
        out.push_str(&encoding[start..end]);
        out.push(ARG_DELIMITER as char);
    }
    Ok(out)
}

/// Convert a scan-format string back into the native encoding
pub fn revert(scan: &str) -> String {
    scan.chars().filter(|&c| c != ARG_DELIMITER as char).collect()
}

/// Number of entries in a scan-format string (return type included)
pub fn arg_count(scan: &str) -> usize {
    scan.bytes().filter(|&b| b == ARG_DELIMITER).count()
}

/// The scan string starting at entry `index`, or `None` past the end
pub fn arg_at(scan: &str, index: usize) -> Option<&str> {
    let mut start = 0;
    for _ in 0..index {
        let delim = scan[start..].bytes().position(|b| b == ARG_DELIMITER)?;
        start += delim + 1;
    }
    if start >= scan.len() {
        None
    } else {
        Some(&scan[start..])
    }
}

/// Length of the type code at the start of `at` (offset digits excluded)
pub fn arg_length(at: &str) -> BridgeResult<usize> {
    code_len(at.as_bytes(), 0).map_err(|reason| BridgeError::malformed(at, reason))
}

/// The type code of entry `index` (offset digits and delimiter excluded)
pub fn arg_code(scan: &str, index: usize) -> BridgeResult<&str> {
    let at = arg_at(scan, index).ok_or_else(|| {
        BridgeError::malformed(scan, format!("no entry at index {}", index))
    })?;
    let len = arg_length(at)?;
    Ok(&at[..len])
}

/// Strip leading type qualifiers
pub fn strip_qualifiers(code: &str) -> &str {
    code.trim_start_matches(|c: char| c.is_ascii() && QUALIFIERS.contains(&(c as u8)))
}

/// Tag name of a struct or union code (`{name=...}`, `{name}`, `(name=...)`)
pub fn struct_name(code: &str) -> BridgeResult<&str> {
    let body = strip_qualifiers(code);
    let bytes = body.as_bytes();
    if !matches!(bytes.first(), Some(b'{') | Some(b'(')) {
        return Err(BridgeError::malformed(code, "not an aggregate type code"));
    }
    let end = skip_nested(bytes, 0).map_err(|reason| BridgeError::malformed(code, reason))?;
    let inner = &body[1..end - 1];
    let name = match inner.find('=') {
        Some(eq) => &inner[..eq],
        None => inner,
    };
    if name.is_empty() || name.contains(['{', '}', '(', ')', '"']) {
        return Err(BridgeError::malformed(code, "missing aggregate tag name"));
    }
    Ok(name)
}

/// Member codes of a struct/union code, with optional quoted names.
///
/// `{CGPoint="x"d"y"d}` yields `[(Some("x"), "d"), (Some("y"), "d")]`; a code
/// without `=` has no members.
pub fn aggregate_members(code: &str) -> BridgeResult<Vec<(Option<&str>, &str)>> {
    let body = strip_qualifiers(code);
    let bytes = body.as_bytes();
    let end = skip_nested(bytes, 0).map_err(|reason| BridgeError::malformed(code, reason))?;
    let inner = &body[1..end - 1];
    let Some(eq) = inner.find('=') else {
        return Ok(Vec::new());
    };
    let members = &inner[eq + 1..];
    let mb = members.as_bytes();
    let mut out = Vec::new();
    let mut i = 0;
    while i < mb.len() {
        let mut name = None;
        if mb[i] == b'"' {
            let close = skip_quoted(mb, i).map_err(|reason| BridgeError::malformed(code, reason))?;
            name = Some(&members[i + 1..close - 1]);
            i = close;
        }
        let len = code_len(mb, i).map_err(|reason| BridgeError::malformed(code, reason))?;
        out.push((name, &members[i..i + len]));
        i += len;
    }
    Ok(out)
}

/// Element count and element code of an array code (`[12^f]`)
pub fn array_parts(code: &str) -> BridgeResult<(usize, &str)> {
    let body = strip_qualifiers(code);
    let bytes = body.as_bytes();
    if bytes.first() != Some(&b'[') {
        return Err(BridgeError::malformed(code, "not an array type code"));
    }
    let end = skip_nested(bytes, 0).map_err(|reason| BridgeError::malformed(code, reason))?;
    let digits_end = skip_digits(bytes, 1);
    let count = body[1..digits_end]
        .parse::<usize>()
        .map_err(|_| BridgeError::malformed(code, "array without element count"))?;
    let elem = &body[digits_end..end - 1];
    let len = code_len(elem.as_bytes(), 0).map_err(|reason| BridgeError::malformed(code, reason))?;
    if len != elem.len() {
        return Err(BridgeError::malformed(code, "trailing data in array element"));
    }
    Ok((count, elem))
}
