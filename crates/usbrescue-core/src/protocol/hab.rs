//! High Assurance Boot event codes, for decoding SDP error reports.

const STATUS_CODES: &[(u8, &str)] = &[
    (0x00, "HAB_STS_ANY"),
    (0x33, "HAB_FAILURE"),
    (0x69, "HAB_WARNING"),
    (0xf0, "HAB_SUCCESS"),
];

const REASON_CODES: &[(u8, &str)] = &[
    (0x00, "HAB_RSN_ANY"),
    (0x30, "HAB_ENG_FAIL"),
    (0x22, "HAB_INV_ADDRESS"),
    (0x0c, "HAB_INV_ASSERTION"),
    (0x28, "HAB_INV_CALL"),
    (0x21, "HAB_INV_CERTIFICATE"),
    (0x06, "HAB_INV_COMMAND"),
    (0x11, "HAB_INV_CSF"),
    (0x27, "HAB_INV_DCD"),
    (0x0f, "HAB_INV_INDEX"),
    (0x05, "HAB_INV_IVT"),
    (0x1d, "HAB_INV_KEY"),
    (0x1e, "HAB_INV_RETURN"),
    (0x18, "HAB_INV_SIGNATURE"),
    (0x17, "HAB_INV_SIZE"),
    (0x2e, "HAB_MEM_FAIL"),
    (0x2b, "HAB_OVR_COUNT"),
    (0x2d, "HAB_OVR_STORAGE"),
    (0x12, "HAB_UNS_ALGORITHM"),
    (0x03, "HAB_UNS_COMMAND"),
    (0x0a, "HAB_UNS_ENGINE"),
    (0x24, "HAB_UNS_ITEM"),
    (0x1b, "HAB_UNS_KEY"),
    (0x14, "HAB_UNS_PROTOCOL"),
    (0x09, "HAB_UNS_STATE"),
];

const CONTEXT_CODES: &[(u8, &str)] = &[
    (0x00, "HAB_CTX_ANY"),
    (0xe1, "HAB_CTX_ENTRY"),
    (0x33, "HAB_CTX_TARGET"),
    (0x0a, "HAB_CTX_AUTHENTICATE"),
    (0xdd, "HAB_CTX_DCD"),
    (0xcf, "HAB_CTX_CSF"),
    (0xc0, "HAB_CTX_COMMAND"),
    (0xdb, "HAB_CTX_AUT_DAT"),
    (0xa0, "HAB_CTX_ASSERT"),
    (0xee, "HAB_CTX_EXIT"),
];

const ENGINE_TAGS: &[(u8, &str)] = &[
    (0x00, "HAB_ENG_ANY"),
    (0x03, "HAB_ENG_SCC"),
    (0x05, "HAB_ENG_RTIC"),
    (0x06, "HAB_ENG_SAHARA"),
    (0x0a, "HAB_ENG_CSU"),
    (0x0c, "HAB_ENG_SRTC"),
    (0x1b, "HAB_ENG_DCP"),
    (0x1d, "HAB_ENG_CAAM"),
    (0x1e, "HAB_ENG_SNVS"),
    (0x21, "HAB_ENG_OCOTP"),
    (0x22, "HAB_ENG_DTCP"),
    (0x36, "HAB_ENG_ROM"),
    (0x24, "HAB_ENG_HDCP"),
    (0xff, "HAB_ENG_SW"),
];

fn lookup(table: &[(u8, &'static str)], code: u8) -> String {
    table
        .iter()
        .find(|(c, _)| *c == code)
        .map(|(_, name)| name.to_string())
        .unwrap_or_else(|| format!("0x{:02x}", code))
}

/// Render a 4-byte HAB event as `status | reason | context | engine`.
pub fn decode_event(event: &[u8]) -> String {
    let byte = |i: usize| event.get(i).copied().unwrap_or(0);
    format!(
        "{} | {} | {} | {}",
        lookup(STATUS_CODES, byte(0)),
        lookup(REASON_CODES, byte(1)),
        lookup(CONTEXT_CODES, byte(2)),
        lookup(ENGINE_TAGS, byte(3))
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_event() {
        assert_eq!(
            decode_event(&[0x33, 0x05, 0xe1, 0x36]),
            "HAB_FAILURE | HAB_INV_IVT | HAB_CTX_ENTRY | HAB_ENG_ROM"
        );
        assert_eq!(
            decode_event(&[0x42]),
            "0x42 | HAB_RSN_ANY | HAB_CTX_ANY | HAB_ENG_ANY"
        );
    }
}
