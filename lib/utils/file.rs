//! File helpers.

use std::path::Path;

use tokio::fs;

use crate::LiaResult;

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Reads the last `n` lines of a file, returning them along with the file's
/// total line count. A missing file reads as empty.
pub async fn read_last_lines(path: &Path, n: usize) -> LiaResult<(Vec<String>, usize)> {
    if !fs::try_exists(path).await.unwrap_or(false) {
        return Ok((vec![], 0));
    }

    let contents = fs::read_to_string(path).await?;
    let all: Vec<&str> = contents.lines().collect();
    let total = all.len();
    let start = total.saturating_sub(n);

    Ok((all[start..].iter().map(|s| s.to_string()).collect(), total))
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test_log::test(tokio::test)]
    async fn test_tail_shorter_and_longer_than_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.log");
        fs::write(&path, "one\ntwo\nthree\n").await.unwrap();

        let (lines, total) = read_last_lines(&path, 2).await.unwrap();
        assert_eq!(total, 3);
        assert_eq!(lines, vec!["two", "three"]);

        let (lines, total) = read_last_lines(&path, 10).await.unwrap();
        assert_eq!(total, 3);
        assert_eq!(lines.len(), 3);
    }

    #[test_log::test(tokio::test)]
    async fn test_missing_file_reads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let (lines, total) = read_last_lines(&dir.path().join("gone.log"), 5)
            .await
            .unwrap();
        assert!(lines.is_empty());
        assert_eq!(total, 0);
    }
}
