//! Minimal DER encoding and decoding for certificate signing requests.
//!
//! Only the handful of universal types a PKCS#10 request and an EC
//! SubjectPublicKeyInfo need are covered. The reader exists so encoded
//! output can be checked structurally before it leaves the process.

pub const TAG_INTEGER: u8 = 0x02;
pub const TAG_BIT_STRING: u8 = 0x03;
pub const TAG_OID: u8 = 0x06;
pub const TAG_UTF8_STRING: u8 = 0x0c;
pub const TAG_PRINTABLE_STRING: u8 = 0x13;
pub const TAG_SEQUENCE: u8 = 0x30;
pub const TAG_SET: u8 = 0x31;

/// How an unsigned big-endian magnitude becomes INTEGER content octets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IntegerPadding {
    /// Strip leading zeros, then prepend a single `0x00` when the first
    /// remaining byte has its high bit set. Always decodes as non-negative.
    #[default]
    SignAware,
    /// Strip leading zeros only. A magnitude whose first byte is `>= 0x80`
    /// decodes as a negative INTEGER; kept for servers pinned to that form.
    StripOnly,
}

pub fn encode_length(len: usize, out: &mut Vec<u8>) {
    if len < 0x80 {
        out.push(len as u8);
        return;
    }
    let bytes = len.to_be_bytes();
    let first = bytes.iter().position(|b| *b != 0).unwrap_or(bytes.len() - 1);
    let significant = &bytes[first..];
    out.push(0x80 | significant.len() as u8);
    out.extend_from_slice(significant);
}

pub fn tlv(tag: u8, content: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(content.len() + 6);
    out.push(tag);
    encode_length(content.len(), &mut out);
    out.extend_from_slice(content);
    out
}

/// Constructed value whose content is the concatenation of `parts`.
pub fn constructed(tag: u8, parts: &[&[u8]]) -> Vec<u8> {
    tlv(tag, &parts.concat())
}

pub fn sequence(parts: &[&[u8]]) -> Vec<u8> {
    constructed(TAG_SEQUENCE, parts)
}

pub fn set(parts: &[&[u8]]) -> Vec<u8> {
    constructed(TAG_SET, parts)
}

/// Context-specific constructed tag `[number]`.
pub fn context_constructed(number: u8, content: &[u8]) -> Vec<u8> {
    tlv(0xa0 | (number & 0x1f), content)
}

/// Content octets of an INTEGER holding the unsigned `magnitude`.
pub fn unsigned_integer_content(magnitude: &[u8], padding: IntegerPadding) -> Vec<u8> {
    let trimmed = match magnitude.iter().position(|b| *b != 0) {
        Some(first) => &magnitude[first..],
        None => &[][..],
    };

    let mut content = Vec::with_capacity(trimmed.len() + 1);
    let needs_pad = match padding {
        IntegerPadding::SignAware => trimmed.first().map_or(true, |b| b & 0x80 != 0),
        IntegerPadding::StripOnly => trimmed.is_empty(),
    };
    if needs_pad {
        content.push(0x00);
    }
    content.extend_from_slice(trimmed);
    content
}

pub fn unsigned_integer(magnitude: &[u8], padding: IntegerPadding) -> Vec<u8> {
    tlv(TAG_INTEGER, &unsigned_integer_content(magnitude, padding))
}

pub fn small_integer(value: u64) -> Vec<u8> {
    unsigned_integer(&value.to_be_bytes(), IntegerPadding::SignAware)
}

/// OBJECT IDENTIFIER from its arcs. Callers pass well-formed constants
/// (at least two arcs, first arc 0..=2).
pub fn oid(arcs: &[u64]) -> Vec<u8> {
    let mut content = Vec::new();
    if arcs.len() >= 2 {
        push_base128(arcs[0] * 40 + arcs[1], &mut content);
        for arc in &arcs[2..] {
            push_base128(*arc, &mut content);
        }
    }
    tlv(TAG_OID, &content)
}

fn push_base128(mut value: u64, out: &mut Vec<u8>) {
    let mut groups = vec![(value & 0x7f) as u8];
    value >>= 7;
    while value > 0 {
        groups.push(0x80 | (value & 0x7f) as u8);
        value >>= 7;
    }
    groups.reverse();
    out.extend_from_slice(&groups);
}

pub fn utf8_string(value: &str) -> Vec<u8> {
    tlv(TAG_UTF8_STRING, value.as_bytes())
}

pub fn printable_string(value: &str) -> Vec<u8> {
    tlv(TAG_PRINTABLE_STRING, value.as_bytes())
}

/// BIT STRING with zero unused bits.
pub fn bit_string(bytes: &[u8]) -> Vec<u8> {
    let mut content = Vec::with_capacity(bytes.len() + 1);
    content.push(0x00);
    content.extend_from_slice(bytes);
    tlv(TAG_BIT_STRING, &content)
}

/// A decoded tag-length-value triple borrowing from the input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tlv<'a> {
    pub class: u8,
    pub constructed: bool,
    pub tag: u32,
    pub value: &'a [u8],
    /// The complete encoding of this element, header included.
    pub raw: &'a [u8],
}

/// Read one element, returning it and the remaining input.
pub fn read_tlv(input: &[u8]) -> Result<(Tlv<'_>, &[u8]), String> {
    if input.len() < 2 {
        return Err("truncated TLV".to_string());
    }

    let first = input[0];
    let class = first >> 6;
    let constructed = (first & 0b0010_0000) != 0;
    let mut tag: u32 = u32::from(first & 0b0001_1111);
    let mut idx = 1;

    if tag == 0b0001_1111 {
        tag = 0;
        loop {
            if idx >= input.len() {
                return Err("truncated high-tag-number".to_string());
            }
            let b = input[idx];
            idx += 1;
            tag = (tag << 7) | u32::from(b & 0x7f);
            if b & 0x80 == 0 {
                break;
            }
        }
    }

    if idx >= input.len() {
        return Err("truncated length".to_string());
    }
    let len_byte = input[idx];
    idx += 1;

    let len = if len_byte & 0x80 == 0 {
        usize::from(len_byte)
    } else {
        let num = usize::from(len_byte & 0x7f);
        if num == 0 || num > 4 || idx + num > input.len() {
            return Err("invalid long-form length".to_string());
        }
        let mut l = 0usize;
        for i in 0..num {
            l = (l << 8) | usize::from(input[idx + i]);
        }
        idx += num;
        l
    };

    if idx + len > input.len() {
        return Err("truncated value".to_string());
    }

    let element = Tlv {
        class,
        constructed,
        tag,
        value: &input[idx..idx + len],
        raw: &input[..idx + len],
    };
    Ok((element, &input[idx + len..]))
}

/// Read a universal element with the given tag number.
pub fn read_universal(input: &[u8], tag: u8) -> Result<(Tlv<'_>, &[u8]), String> {
    let (element, rest) = read_tlv(input)?;
    let expected = u32::from(tag & 0x1f);
    if element.class != 0 || element.tag != expected {
        return Err(format!(
            "expected universal tag {expected}, found class {} tag {}",
            element.class, element.tag
        ));
    }
    Ok((element, rest))
}

/// Read an INTEGER as an unsigned magnitude without leading zero octets.
///
/// Content with the high bit set is accepted as unsigned, so both
/// [`IntegerPadding`] forms decode to the same magnitude.
pub fn read_unsigned_integer(input: &[u8]) -> Result<(&[u8], &[u8]), String> {
    let (element, rest) = read_universal(input, TAG_INTEGER)?;
    if element.value.is_empty() {
        return Err("empty INTEGER".to_string());
    }
    let first = element
        .value
        .iter()
        .position(|b| *b != 0)
        .unwrap_or(element.value.len());
    Ok((&element.value[first..], rest))
}
