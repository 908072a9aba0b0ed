mod comments;
mod media;
mod messages;
mod posts;
mod push;
mod uploads;
mod users;

pub use posts::PostFilter;

use anyhow::Result;
use rusqlite::Row;

use crate::models::UserSummaryRow;

/// True when the error is a UNIQUE / CHECK / FK constraint failure.
pub fn is_constraint_violation(err: &anyhow::Error) -> bool {
    err.downcast_ref::<rusqlite::Error>()
        .and_then(|e| e.sqlite_error_code())
        .is_some_and(|code| code == rusqlite::ErrorCode::ConstraintViolation)
}

/// Reads `id, username, avatar_url` starting at column `start`.
pub(crate) fn summary_at(row: &Row<'_>, start: usize) -> rusqlite::Result<UserSummaryRow> {
    Ok(UserSummaryRow {
        id: row.get(start)?,
        username: row.get(start + 1)?,
        avatar_url: row.get(start + 2)?,
    })
}

/// `?1, ?2, ...` placeholders for an IN clause, numbered from `first`.
pub(crate) fn placeholders(first: usize, count: usize) -> String {
    (first..first + count)
        .map(|i| format!("?{}", i))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Extension trait for optional query results
pub(crate) trait OptionalExt<T> {
    fn optional(self) -> Result<Option<T>>;
}

impl<T> OptionalExt<T> for std::result::Result<T, rusqlite::Error> {
    fn optional(self) -> Result<Option<T>> {
        match self {
            Ok(val) => Ok(Some(val)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}
