//! On-disk file names for document and operation ids.
//!
//! Ids are percent-encoded so that distinct ids never share a file: `a/b`
//! becomes `a%2Fb.json` while `a_b` stays `a_b.json`.

use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};

/// Bytes kept verbatim; everything else, `%` included, is escaped.
const ESCAPED: &AsciiSet = &NON_ALPHANUMERIC.remove(b'-').remove(b'_');

/// The `.json` file name that stores the document or operation `id`.
#[must_use]
pub fn json_file_name(id: &str) -> String {
    format!("{}.json", utf8_percent_encode(id, ESCAPED))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_safe_ids_are_kept() {
        assert_eq!(json_file_name("op-1_x"), "op-1_x.json");
    }

    #[test]
    fn test_unsafe_bytes_are_escaped() {
        assert_eq!(json_file_name("a/b:c"), "a%2Fb%3Ac.json");
        assert_eq!(json_file_name("."), "%2E.json");
        assert_eq!(json_file_name("100%"), "100%25.json");
    }

    #[test]
    fn test_lookalike_ids_get_distinct_files() {
        assert_ne!(json_file_name("a/b"), json_file_name("a_b"));
        assert_ne!(json_file_name("a%2Fb"), json_file_name("a/b"));
    }

    mod proptest_tests {
        use super::super::*;
        use percent_encoding::percent_decode_str;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn prop_file_name_decodes_back_to_id(id in "\\PC{0,40}") {
                let name = json_file_name(&id);
                let stem = name.strip_suffix(".json").unwrap_or(&name);
                prop_assert!(!stem.contains('/'));
                let decoded = percent_decode_str(stem).decode_utf8().expect("utf8");
                prop_assert_eq!(decoded, id.as_str());
            }
        }
    }
}
