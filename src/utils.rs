/// Formats bytes as uppercase hexadecimal pairs separated by spaces.
pub(crate) fn format_hex(bytes: &[u8]) -> String {
    if bytes.is_empty() {
        return "<empty>".to_string();
    }

    let encoded = hex::encode_upper(bytes);
    let mut rendered = String::with_capacity(bytes.len().saturating_mul(3));
    for (index, pair) in encoded.as_bytes().chunks(2).enumerate() {
        if index > 0 {
            rendered.push(' ');
        }
        rendered.extend(pair.iter().map(|&digit| char::from(digit)));
    }
    rendered
}

/// Formats an optional RSSI for terminal output.
pub(crate) fn format_rssi(rssi: Option<i16>) -> String {
    match rssi {
        Some(value) => format!("{value} dBm"),
        None => "-".to_string(),
    }
}

/// Shortens a Bluetooth base UUID to its 16-bit form when it has one.
pub(crate) fn short_uuid(uuid: &str) -> &str {
    const BASE_SUFFIX: &str = "-0000-1000-8000-00805f9b34fb";
    match uuid.strip_suffix(BASE_SUFFIX) {
        Some(prefix) if prefix.len() == 8 && prefix.starts_with("0000") => &prefix[4..],
        _ => uuid,
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    use super::*;

    #[test]
    fn format_hex_handles_empty_payload() {
        assert_eq!("<empty>", format_hex(&[]));
    }

    #[test]
    fn format_hex_formats_uppercase_pairs() {
        assert_eq!("05 00 A1 FF", format_hex(&[0x05, 0x00, 0xA1, 0xFF]));
    }

    #[rstest]
    #[case::unknown(None, "-")]
    #[case::known(Some(-61), "-61 dBm")]
    fn format_rssi_renders(#[case] rssi: Option<i16>, #[case] expected: &str) {
        assert_eq!(expected, format_rssi(rssi));
    }

    #[rstest]
    #[case::base_uuid("00002a37-0000-1000-8000-00805f9b34fb", "2a37")]
    #[case::vendor_uuid(
        "6e400003-b5a3-f393-e0a9-e50e24dcca9e",
        "6e400003-b5a3-f393-e0a9-e50e24dcca9e"
    )]
    fn short_uuid_strips_the_base(#[case] uuid: &str, #[case] expected: &str) {
        assert_eq!(expected, short_uuid(uuid));
    }
}
