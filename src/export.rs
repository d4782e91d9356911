//! Plain-text export of claimed batches

use crate::record::Record;

/// Suggested file name for a downloaded batch
pub const EXPORT_FILE_NAME: &str = "accounts.txt";

/// Render one name per line, in the given order.
///
/// Lines are separated by `\n` with no trailing newline; an empty batch
/// renders as an empty string.
pub fn format_batch(records: &[Record]) -> String {
    records
        .iter()
        .map(|record| record.name.as_str())
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::NewRecord;

    fn record(name: &str) -> Record {
        Record::create(NewRecord::named(name)).unwrap()
    }

    #[test]
    fn test_one_name_per_line_in_order() {
        let batch = vec![record("zed"), record("amy"), record("bob")];
        assert_eq!(format_batch(&batch), "zed\namy\nbob");
    }

    #[test]
    fn test_empty_batch_is_empty_text() {
        assert_eq!(format_batch(&[]), "");
    }

    #[test]
    fn test_single_record_has_no_trailing_newline() {
        assert_eq!(format_batch(&[record("solo")]), "solo");
    }
}
