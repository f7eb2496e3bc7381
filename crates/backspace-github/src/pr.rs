//! Pull request title and body

use backspace_core::{AppliedDiff, ChangeKind, ChangedFile};

const MAX_TITLE_CHARS: usize = 50;

/// Short PR title from the request text and the changed files
///
/// Category comes from keywords in the request, falling back to the kinds
/// of change made. File names are used when few files changed, otherwise
/// the first words of the request.
pub fn pr_title(description: &str, files: &[ChangedFile]) -> String {
    let category = category_for(description, files);

    let names: Vec<&str> = files
        .iter()
        .map(|f| f.path.rsplit('/').next().unwrap_or(f.path.as_str()))
        .collect();

    let title = match names.len() {
        0 => format!("{}: {}", category, subject(description)),
        1..=3 => format!("{}: {}", category, names.join(", ")),
        n => format!("{}: {} files", category, n),
    };

    if title.chars().count() <= MAX_TITLE_CHARS {
        return title;
    }

    let title = format!("{}: {}", category, subject(description));
    if title.chars().count() <= MAX_TITLE_CHARS {
        title
    } else {
        let cut: String = title.chars().take(MAX_TITLE_CHARS - 3).collect();
        format!("{}...", cut)
    }
}

fn category_for(description: &str, files: &[ChangedFile]) -> &'static str {
    let lower = description.to_lowercase();
    let has_any = |words: &[&str]| words.iter().any(|w| lower.contains(w));

    if has_any(&["fix", "bug", "error", "issue"]) {
        "Fix"
    } else if has_any(&["add", "create", "new", "implement"]) {
        "Add"
    } else if has_any(&["update", "improve", "enhance", "refactor"]) {
        "Update"
    } else if has_any(&["test"]) {
        "Test"
    } else if has_any(&["doc", "readme", "comment"]) {
        "Docs"
    } else {
        let created = files.iter().any(|f| f.kind == ChangeKind::Created);
        let modified = files.iter().any(|f| f.kind == ChangeKind::Modified);
        let deleted = files.iter().any(|f| f.kind == ChangeKind::Deleted);
        match (created, modified, deleted) {
            (true, true, _) => "Add & Update",
            (true, false, _) => "Add",
            (false, true, _) => "Update",
            (false, false, true) => "Remove",
            _ => "Change",
        }
    }
}

fn subject(description: &str) -> String {
    let words: Vec<&str> = description.split_whitespace().collect();
    if words.len() > 5 {
        format!("{}...", words[..4].join(" "))
    } else {
        words.join(" ")
    }
}

/// PR body listing the request and the changed files
pub fn pr_body(description: &str, diff: &AppliedDiff) -> String {
    let mut body = String::from("## Automated change by Backspace\n\n");
    body.push_str(&format!("**Request:** {}\n\n", description));
    body.push_str(&format!("### Files changed ({})\n\n", diff.summary()));
    for file in &diff.files {
        body.push_str(&format!("- `{}` ({})\n", file.path, file.kind));
    }
    body.push_str(&format!("\nDiff digest: `{}`\n", diff.digest));
    body.push_str("\nThe change passed all configured validation commands before this PR was opened.\n");
    body
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(path: &str, kind: ChangeKind) -> ChangedFile {
        ChangedFile {
            path: path.to_string(),
            kind,
        }
    }

    #[test]
    fn test_title_with_few_files() {
        let files = [
            file("app/health.py", ChangeKind::Created),
            file("app/main.py", ChangeKind::Modified),
        ];
        assert_eq!(
            pr_title("add a health-check endpoint", &files),
            "Add: health.py, main.py"
        );
    }

    #[test]
    fn test_title_with_many_files() {
        let files: Vec<_> = (0..6)
            .map(|i| file(&format!("src/m{}.rs", i), ChangeKind::Modified))
            .collect();
        assert_eq!(pr_title("fix the flaky retry logic", &files), "Fix: 6 files");
    }

    #[test]
    fn test_title_falls_back_to_kinds() {
        let files = [file("old.txt", ChangeKind::Deleted)];
        assert_eq!(pr_title("tidy up", &files), "Remove: old.txt");
    }

    #[test]
    fn test_long_title_uses_subject_and_is_capped() {
        let files = [file(
            "a/very/long/path/to/some_extremely_long_module_name_for_testing.py",
            ChangeKind::Modified,
        )];
        let title = pr_title("update the configuration loader to support overrides", &files);
        assert_eq!(title, "Update: update the configuration loader...");
        assert!(title.chars().count() <= MAX_TITLE_CHARS);
    }

    #[test]
    fn test_body_lists_files() {
        let diff = AppliedDiff {
            diff: String::new(),
            files: vec![file("app/health.py", ChangeKind::Created)],
            digest: "abc123".to_string(),
        };
        let body = pr_body("add a health-check endpoint", &diff);
        assert!(body.contains("add a health-check endpoint"));
        assert!(body.contains("- `app/health.py` (created)"));
        assert!(body.contains("abc123"));
    }
}
