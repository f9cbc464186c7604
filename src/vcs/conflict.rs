//! Conflict-marker parsing for files left mid-merge.

const OURS_MARKER: &str = "<<<<<<<";
const BASE_MARKER: &str = "|||||||";
const SPLIT_MARKER: &str = "=======";
const THEIRS_MARKER: &str = ">>>>>>>";

/// Both sides of a conflicted file, reconstructed from its markers.
///
/// Text outside conflict hunks appears in both `ours` and `theirs`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConflictSides {
    pub ours: String,
    pub theirs: String,
    /// Common ancestor text, present only with `diff3`-style markers.
    pub base: Option<String>,
    pub hunks: usize,
}

pub fn has_conflict_markers(content: &str) -> bool {
    let mut open = false;
    for line in content.lines() {
        if line.starts_with(OURS_MARKER) {
            open = true;
        } else if open && line.starts_with(THEIRS_MARKER) {
            return true;
        }
    }
    false
}

#[derive(Clone, Copy, PartialEq)]
enum Section {
    Common,
    Ours,
    Base,
    Theirs,
}

/// Split a conflicted file into its two sides.
pub fn split_conflict(content: &str) -> ConflictSides {
    let mut sides = ConflictSides::default();
    let mut base = String::new();
    let mut saw_base = false;
    let mut section = Section::Common;

    for line in content.split_inclusive('\n') {
        match section {
            Section::Common if line.starts_with(OURS_MARKER) => {
                section = Section::Ours;
                sides.hunks += 1;
                continue;
            }
            Section::Ours if line.starts_with(BASE_MARKER) => {
                section = Section::Base;
                saw_base = true;
                continue;
            }
            Section::Ours | Section::Base if line.starts_with(SPLIT_MARKER) => {
                section = Section::Theirs;
                continue;
            }
            Section::Theirs if line.starts_with(THEIRS_MARKER) => {
                section = Section::Common;
                continue;
            }
            _ => {}
        }

        match section {
            Section::Common => {
                sides.ours.push_str(line);
                sides.theirs.push_str(line);
                base.push_str(line);
            }
            Section::Ours => sides.ours.push_str(line),
            Section::Base => base.push_str(line),
            Section::Theirs => sides.theirs.push_str(line),
        }
    }

    if saw_base {
        sides.base = Some(base);
    }
    sides
}
