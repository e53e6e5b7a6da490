mod directory;
mod file;
mod sort;
mod thumbnail;
mod tracking;

pub use self::directory::DirectoryRecord;
pub(crate) use self::directory::DirectoryRow;
pub use self::file::{FileRecord, FileUpdate, NewFile};
pub(crate) use self::file::FileRow;
pub use self::sort::SortOrder;
pub use self::thumbnail::{ThumbnailRecord, Tier};
pub(crate) use self::thumbnail::ThumbnailRow;
pub use self::tracking::TrackingEntry;
pub(crate) use self::tracking::TrackingRow;

use crate::error::{ErrorKind, Result};
use exn::ResultExt;
use time::UtcDateTime;

/// Timestamps are stored as UNIX milliseconds.
pub fn to_millis(timestamp: UtcDateTime) -> i64 {
    timestamp.unix_timestamp() * 1000 + i64::from(timestamp.millisecond())
}

pub fn from_millis(millis: i64) -> Result<UtcDateTime> {
    UtcDateTime::from_unix_timestamp_nanos(i128::from(millis) * 1_000_000).or_raise(|| ErrorKind::InvalidData("timestamp"))
}

pub(crate) fn size_to_db(size: u64) -> Result<i64> {
    i64::try_from(size).or_raise(|| ErrorKind::InvalidData("file size"))
}

pub(crate) fn size_from_db(size: i64) -> Result<u64> {
    u64::try_from(size).or_raise(|| ErrorKind::InvalidData("file size"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_millis_truncate_sub_millisecond_precision() {
        let now = UtcDateTime::now();
        let restored = from_millis(to_millis(now)).unwrap();
        assert_eq!(restored.millisecond(), now.millisecond());
        assert!(now - restored < time::Duration::milliseconds(1));
        assert_eq!(to_millis(from_millis(-1500).unwrap()), -1500);
    }
}
