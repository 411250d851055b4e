//! Calypso Common - Byte-level helpers shared by the Calypso terminal crates
//!
//! BER-TLV lookup used to walk the FCI returned on application selection,
//! status-word naming for logs and error messages, and the big-endian
//! integer conversions used by record, counter and Stored Value parsing.

/// Read one TLV header at `offset`.
///
/// Returns `(tag, value_start, value_len)` or `None` when the header runs past
/// the end of `data`. Tags are one byte, or two bytes when the low five bits
/// of the first byte are all set (e.g. `BF0C`).
fn read_header(data: &[u8], offset: usize) -> Option<(&[u8], usize, usize)> {
    let first = *data.get(offset)?;
    let tag_len = if first & 0x1F == 0x1F { 2 } else { 1 };
    let tag = data.get(offset..offset + tag_len)?;
    let mut i = offset + tag_len;

    let len_byte = *data.get(i)? as usize;
    i += 1;

    let value_len = if len_byte & 0x80 != 0 {
        let num_len_bytes = len_byte & 0x7F;
        let len_bytes = data.get(i..i + num_len_bytes)?;
        i += num_len_bytes;
        len_bytes.iter().fold(0usize, |acc, &b| (acc << 8) | b as usize)
    } else {
        len_byte
    };

    Some((tag, i, value_len))
}

/// Find a tag at the top level of BER-TLV encoded data and return its value.
///
/// # Arguments
/// * `data` - The TLV-encoded data to search
/// * `tag` - The tag bytes to search for (1 or 2 bytes)
///
/// # Returns
/// * `Some(&[u8])` - The value bytes if the tag is found
/// * `None` - If the tag is absent or the data is truncated
pub fn find_tag<'a>(data: &'a [u8], tag: &[u8]) -> Option<&'a [u8]> {
    let mut offset = 0;
    while offset < data.len() {
        let (current, value_start, value_len) = read_header(data, offset)?;
        let value_end = value_start.checked_add(value_len)?;

        if current == tag {
            return data.get(value_start..value_end);
        }

        offset = value_end;
    }
    None
}

/// Follow a path of nested constructed tags, e.g. `6F / A5 / BF0C / C7`.
pub fn find_path<'a>(data: &'a [u8], path: &[&[u8]]) -> Option<&'a [u8]> {
    path.iter().try_fold(data, |current, tag| find_tag(current, tag))
}

/// Tags found in the FCI returned by a Calypso application
pub mod tags {
    pub const FCI_TEMPLATE: &[u8] = &[0x6F];
    pub const DF_NAME: &[u8] = &[0x84];
    pub const FCI_PROPRIETARY_TEMPLATE: &[u8] = &[0xA5];
    pub const FCI_ISSUER_DISCRETIONARY_DATA: &[u8] = &[0xBF, 0x0C];
    pub const APPLICATION_SERIAL_NUMBER: &[u8] = &[0xC7];
    pub const DISCRETIONARY_DATA: &[u8] = &[0x53];
}

/// Status word constants
pub mod sw {
    pub const SUCCESS: u16 = 0x9000;
    pub const DF_INVALIDATED: u16 = 0x6283;
    pub const WRONG_LENGTH: u16 = 0x6700;
    pub const SESSION_BUFFER_OVERFLOW: u16 = 0x6400;
    pub const SECURITY_STATUS_NOT_SATISFIED: u16 = 0x6982;
    pub const CONDITIONS_NOT_SATISFIED: u16 = 0x6985;
    pub const INCORRECT_SIGNATURE: u16 = 0x6988;
    pub const FILE_NOT_FOUND: u16 = 0x6A82;
    pub const RECORD_NOT_FOUND: u16 = 0x6A83;
    pub const INCORRECT_P1_P2: u16 = 0x6B00;
    pub const INS_NOT_SUPPORTED: u16 = 0x6D00;
    pub const CLA_NOT_SUPPORTED: u16 = 0x6E00;
}

/// Get a human-readable description of a status word
pub fn status_name(status_word: u16) -> &'static str {
    match status_word {
        0x9000 => "Successful execution",
        0x6283 => "Selected DF is invalidated",
        0x6400 => "Too many modifications in session",
        0x6700 => "Lc value not supported",
        0x6981 => "Command forbidden on this file type",
        0x6982 => "Security conditions not fulfilled",
        0x6985 => "Access forbidden",
        0x6986 => "Command not allowed (no current EF)",
        0x6988 => "Incorrect signature",
        0x6A82 => "File not found",
        0x6A83 => "Record not found",
        0x6B00 => "Incorrect P1 or P2",
        0x6D00 => "Instruction unknown",
        0x6E00 => "Class not supported",
        _ => "Unknown status",
    }
}

/// Unsigned big-endian integer from up to 4 bytes
pub fn be_uint(bytes: &[u8]) -> u32 {
    bytes.iter().fold(0u32, |acc, &b| (acc << 8) | b as u32)
}

/// Signed big-endian integer from 1 to 4 bytes (two's complement on the given width)
pub fn be_int(bytes: &[u8]) -> i32 {
    if bytes.is_empty() {
        return 0;
    }
    let bits = (bytes.len() * 8) as u32;
    let raw = be_uint(bytes);
    if bits >= 32 {
        return raw as i32;
    }
    let shift = 32 - bits;
    ((raw << shift) as i32) >> shift
}

/// Low `width` bytes of `value`, big-endian
pub fn to_be_bytes(value: i32, width: usize) -> Vec<u8> {
    let full = value.to_be_bytes();
    full[full.len() - width.min(4)..].to_vec()
}
