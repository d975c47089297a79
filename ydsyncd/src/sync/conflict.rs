use std::str::FromStr;

/// Outcome of comparing a local file against its remote counterpart whose
/// content hash differs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileDecision {
    Upload,
    Download,
    Conflict,
}

/// Classifies a differing file from its local mtime `local`, remote mtime
/// `remote` and the last synchronized mtime `history` (all epoch seconds).
/// Without a history record the local mtime stands in for it.
pub fn decide_file(local: i64, remote: i64, history: Option<i64>) -> FileDecision {
    let history = history.unwrap_or(local);
    if local > remote {
        FileDecision::Upload
    } else if local > history && remote > history {
        FileDecision::Conflict
    } else {
        FileDecision::Download
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConflictPolicy {
    /// Keep the local edit under a conflict name and take the remote version.
    #[default]
    KeepBoth,
    /// Leave both sides untouched and only notify.
    Report,
}

impl FromStr for ConflictPolicy {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "keep-both" | "keep_both" | "keepboth" => Ok(ConflictPolicy::KeepBoth),
            "report" => Ok(ConflictPolicy::Report),
            other => Err(format!("unknown conflict policy: {other}")),
        }
    }
}

/// "/Docs/A.txt" -> "/Docs/A (conflict 1700000000).txt".
pub fn conflict_path(path: &str, stamp: i64) -> String {
    let (dir, name) = match path.rsplit_once('/') {
        Some((dir, name)) => (format!("{dir}/"), name),
        None => (String::new(), path),
    };

    match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => format!("{dir}{stem} (conflict {stamp}).{ext}"),
        _ => format!("{dir}{name} (conflict {stamp})"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn newer_local_uploads() {
        assert_eq!(decide_file(200, 150, Some(100)), FileDecision::Upload);
    }

    #[test]
    fn both_sides_newer_than_history_conflict() {
        assert_eq!(decide_file(200, 300, Some(100)), FileDecision::Conflict);
    }

    #[test]
    fn unchanged_local_downloads() {
        assert_eq!(decide_file(100, 300, Some(100)), FileDecision::Download);
        assert_eq!(decide_file(100, 300, None), FileDecision::Download);
    }

    #[test]
    fn equal_times_fall_through_to_history() {
        assert_eq!(decide_file(150, 150, Some(100)), FileDecision::Conflict);
        assert_eq!(decide_file(150, 150, Some(150)), FileDecision::Download);
    }

    #[test]
    fn conflict_names_keep_extension() {
        assert_eq!(conflict_path("/Docs/A.txt", 2), "/Docs/A (conflict 2).txt");
        assert_eq!(conflict_path("/Docs/Makefile", 3), "/Docs/Makefile (conflict 3)");
        assert_eq!(conflict_path("/.bashrc", 4), "/.bashrc (conflict 4)");
    }

    #[test]
    fn parses_policy_names() {
        assert_eq!("keep-both".parse(), Ok(ConflictPolicy::KeepBoth));
        assert_eq!("Report".parse(), Ok(ConflictPolicy::Report));
        assert!("merge".parse::<ConflictPolicy>().is_err());
    }
}
