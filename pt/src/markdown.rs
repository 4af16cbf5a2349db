//! Markdown PRD backend.
//!
//! Tasks live under a `## Tasks` heading as checkbox list items. Marker
//! semantics: `x` done, `-`/`!` blocked, `~` in-progress, anything else
//! open. Indented bullets under a task line are its acceptance criteria;
//! a `Depends on: 2, 3` bullet populates the dependency list. Task IDs are
//! ordinal (document order, 1-based) so the agent and the engine agree on
//! numbering without any markup.

use std::collections::HashSet;
use std::fs;
use std::path::PathBuf;
use std::sync::LazyLock;

use regex::Regex;

use crate::{PrdKind, SelectedTask, TaskStatus, Tracker, TrackerError, atomic_write, deps_satisfied};

static TASKS_HEADING_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^\s*##\s+tasks\b").unwrap());
static HEADING_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^\s*#{1,6}\s+\S").unwrap());
static FENCE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^\s*```").unwrap());
static CHECKBOX_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\s*[-*]\s+\[)([^\]])(\]\s+)(.+?)\s*$").unwrap());
static BULLET_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*[-*]\s+(?:\[[ xX]\]\s+)?(.+?)\s*$").unwrap());
static BRANCH_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^\s*(?:branch|branchname)\s*:\s*(.+?)\s*$").unwrap());
static DEPENDS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^\s*depends\s+on\s*:\s*(.+?)\s*$").unwrap());
static MARKER_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\[[^\]]\]").unwrap());
static DIGITS_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\d+").unwrap());

fn marker_to_status(marker: &str) -> TaskStatus {
    match marker.trim().to_lowercase().as_str() {
        "x" => TaskStatus::Done,
        "-" | "!" => TaskStatus::Blocked,
        "~" => TaskStatus::InProgress,
        _ => TaskStatus::Open,
    }
}

/// One parsed checkbox task line.
#[derive(Debug, Clone)]
pub struct MdTask {
    pub id: String,
    pub title: String,
    pub status: TaskStatus,
    pub line_index: usize,
    pub indent: usize,
    pub acceptance: Vec<String>,
    pub depends_on: Vec<String>,
}

/// A parsed Markdown PRD: the raw lines (kept for surgical rewrites) plus
/// the extracted tasks.
#[derive(Debug, Clone)]
pub struct MdPrd {
    pub lines: Vec<String>,
    pub tasks: Vec<MdTask>,
}

fn indent_of(line: &str) -> usize {
    line.len() - line.trim_start_matches(' ').len()
}

fn parse_depends(acceptance: &[String]) -> Vec<String> {
    let mut deps: Vec<String> = Vec::new();
    for item in acceptance {
        let Some(caps) = DEPENDS_RE.captures(item) else {
            continue;
        };
        for m in DIGITS_RE.find_iter(&caps[1]) {
            let n = m.as_str().to_string();
            if !deps.contains(&n) {
                deps.push(n);
            }
        }
    }
    deps
}

/// Parse the PRD text into tasks. Fenced code blocks are inert everywhere:
/// a checkbox inside a fence is not a task and a heading inside a fence does
/// not end the tasks section.
pub fn parse_markdown(text: &str) -> MdPrd {
    let lines: Vec<String> = text.lines().map(str::to_string).collect();

    // Locate an explicit "## Tasks" heading outside fences.
    let mut in_fence = false;
    let mut tasks_start: Option<usize> = None;
    for (i, line) in lines.iter().enumerate() {
        if FENCE_RE.is_match(line) {
            in_fence = !in_fence;
            continue;
        }
        if in_fence {
            continue;
        }
        if TASKS_HEADING_RE.is_match(line) {
            tasks_start = Some(i + 1);
            break;
        }
    }

    let mut tasks: Vec<MdTask> = Vec::new();
    let mut scan = |start: usize, end: usize, tasks: &mut Vec<MdTask>| {
        let mut in_fence = false;
        for li in start..end {
            let line = &lines[li];
            if FENCE_RE.is_match(line) {
                in_fence = !in_fence;
                continue;
            }
            if in_fence {
                continue;
            }
            let Some(caps) = CHECKBOX_RE.captures(line) else {
                continue;
            };
            tasks.push(MdTask {
                id: (tasks.len() + 1).to_string(),
                title: caps[4].trim().to_string(),
                status: marker_to_status(&caps[2]),
                line_index: li,
                indent: indent_of(line),
                acceptance: Vec::new(),
                depends_on: Vec::new(),
            });
        }
    };

    match tasks_start {
        Some(start) => {
            // The tasks section ends at the next heading outside fences.
            let mut end = lines.len();
            let mut in_fence = false;
            for (j, line) in lines.iter().enumerate().skip(start) {
                if FENCE_RE.is_match(line) {
                    in_fence = !in_fence;
                    continue;
                }
                if in_fence {
                    continue;
                }
                if HEADING_RE.is_match(line) {
                    end = j;
                    break;
                }
            }
            scan(start, end, &mut tasks);
        }
        None => {
            // Fallback: any checkbox line in the document.
            scan(0, lines.len(), &mut tasks);
        }
    }

    // Acceptance criteria: indented bullets between a task line and the next
    // task line, stopping at the next heading.
    let boundaries: Vec<(usize, usize)> = tasks
        .iter()
        .enumerate()
        .map(|(idx, t)| {
            let start = t.line_index + 1;
            let end = tasks
                .get(idx + 1)
                .map(|n| n.line_index)
                .unwrap_or(lines.len());
            (start, end)
        })
        .collect();

    for (task, (start, end)) in tasks.iter_mut().zip(boundaries) {
        let mut acc: Vec<String> = Vec::new();
        let mut in_fence = false;
        for line in &lines[start..end] {
            if FENCE_RE.is_match(line) {
                in_fence = !in_fence;
                continue;
            }
            if in_fence {
                continue;
            }
            if HEADING_RE.is_match(line) {
                break;
            }
            if indent_of(line) <= task.indent {
                continue;
            }
            if let Some(caps) = BULLET_RE.captures(line) {
                let item = caps[1].trim().to_string();
                if !item.is_empty() {
                    acc.push(item);
                }
            }
        }
        task.depends_on = parse_depends(&acc);
        task.acceptance = acc;
    }

    MdPrd { lines, tasks }
}

/// Tracker over a Markdown PRD file. Re-reads the file on every operation;
/// read failures degrade to empty results per the tracker contract.
#[derive(Debug, Clone)]
pub struct MarkdownTracker {
    prd_path: PathBuf,
}

impl MarkdownTracker {
    pub fn new(prd_path: PathBuf) -> Self {
        Self { prd_path }
    }

    fn load(&self) -> Result<MdPrd, TrackerError> {
        let text = fs::read_to_string(&self.prd_path)
            .map_err(|_| TrackerError::MissingPrd(self.prd_path.clone()))?;
        Ok(parse_markdown(&text))
    }

    fn save(&self, prd: &MdPrd) -> bool {
        let mut text = prd.lines.join("\n");
        if !text.ends_with('\n') {
            text.push('\n');
        }
        atomic_write(&self.prd_path, &text).is_ok()
    }

    fn to_selected(task: &MdTask) -> SelectedTask {
        SelectedTask {
            id: task.id.clone(),
            title: task.title.clone(),
            kind: PrdKind::Markdown,
            acceptance: task.acceptance.clone(),
            depends_on: task.depends_on.clone(),
            group: "default".to_string(),
        }
    }
}

impl Tracker for MarkdownTracker {
    fn kind(&self) -> PrdKind {
        PrdKind::Markdown
    }

    fn peek_next_task(&self, exclude_ids: &HashSet<String>) -> Option<SelectedTask> {
        let prd = self.load().ok()?;
        let settled: HashSet<String> = prd
            .tasks
            .iter()
            .filter(|t| t.status.is_settled())
            .map(|t| t.id.clone())
            .collect();
        prd.tasks
            .iter()
            .find(|t| {
                t.status == TaskStatus::Open
                    && !exclude_ids.contains(&t.id)
                    && deps_satisfied(&t.depends_on, &settled)
            })
            .map(Self::to_selected)
    }

    fn counts(&self) -> (usize, usize) {
        match self.load() {
            Ok(prd) => {
                let done = prd.tasks.iter().filter(|t| t.status.is_settled()).count();
                (done, prd.tasks.len())
            }
            Err(_) => (0, 0),
        }
    }

    fn all_done(&self) -> bool {
        match self.load() {
            Ok(prd) => prd.tasks.iter().all(|t| t.status.is_settled()),
            Err(_) => false,
        }
    }

    fn all_blocked(&self) -> bool {
        match self.load() {
            Ok(prd) => {
                let open: Vec<_> = prd
                    .tasks
                    .iter()
                    .filter(|t| t.status != TaskStatus::Done)
                    .collect();
                !open.is_empty() && open.iter().all(|t| t.status == TaskStatus::Blocked)
            }
            Err(_) => false,
        }
    }

    fn is_task_done(&self, task_id: &str) -> bool {
        match self.load() {
            Ok(prd) => prd
                .tasks
                .iter()
                .any(|t| t.id == task_id && t.status == TaskStatus::Done),
            Err(_) => false,
        }
    }

    fn force_task_open(&self, task_id: &str) -> bool {
        let Ok(mut prd) = self.load() else {
            return false;
        };
        let Some(task) = prd.tasks.iter().find(|t| t.id == task_id) else {
            return false;
        };
        if task.status != TaskStatus::Done {
            return false;
        }
        let li = task.line_index;
        prd.lines[li] = MARKER_RE.replace(&prd.lines[li], "[ ]").into_owned();
        self.save(&prd)
    }

    fn block_task(&self, task_id: &str, _reason: &str) -> bool {
        let Ok(mut prd) = self.load() else {
            return false;
        };
        let Some(task) = prd.tasks.iter().find(|t| t.id == task_id) else {
            return false;
        };
        if task.status == TaskStatus::Blocked {
            return false;
        }
        let li = task.line_index;
        prd.lines[li] = MARKER_RE.replace(&prd.lines[li], "[-]").into_owned();
        self.save(&prd)
    }

    fn branch_name(&self) -> Option<String> {
        let text = fs::read_to_string(&self.prd_path).ok()?;
        // Only the header portion, to avoid false positives in task titles.
        for line in text.lines().take(60) {
            if let Some(caps) = BRANCH_RE.captures(line) {
                let val = caps[1].trim().to_string();
                if !val.is_empty() {
                    return Some(val);
                }
            }
        }
        None
    }

    fn get_task_by_id(&self, task_id: &str) -> Option<SelectedTask> {
        let prd = self.load().ok()?;
        prd.tasks
            .iter()
            .find(|t| t.id == task_id)
            .map(Self::to_selected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const SAMPLE: &str = "\
# My Project

Branch: feature/ralph

## Tasks

- [ ] First task
  - criterion one
  - criterion two
- [x] Second task
- [~] Third task
- [-] Fourth task
- [ ] Fifth task
  - Depends on: 2, 4

## Notes

- [ ] not a task (different section)
";

    fn write_prd(text: &str) -> (tempfile::TempDir, MarkdownTracker) {
        let dir = tempdir().unwrap();
        let path = dir.path().join("PRD.md");
        fs::write(&path, text).unwrap();
        (dir, MarkdownTracker::new(path))
    }

    #[test]
    fn test_parse_tasks_section_only() {
        let prd = parse_markdown(SAMPLE);
        assert_eq!(prd.tasks.len(), 5);
        assert_eq!(prd.tasks[0].title, "First task");
        assert_eq!(prd.tasks[0].status, TaskStatus::Open);
        assert_eq!(prd.tasks[1].status, TaskStatus::Done);
        assert_eq!(prd.tasks[2].status, TaskStatus::InProgress);
        assert_eq!(prd.tasks[3].status, TaskStatus::Blocked);
    }

    #[test]
    fn test_parse_acceptance_and_depends() {
        let prd = parse_markdown(SAMPLE);
        assert_eq!(prd.tasks[0].acceptance, vec!["criterion one", "criterion two"]);
        assert_eq!(prd.tasks[4].depends_on, vec!["2", "4"]);
    }

    #[test]
    fn test_fenced_checkboxes_ignored() {
        let text = "\
## Tasks

- [ ] real task

```
- [ ] fake task in fence
```
";
        let prd = parse_markdown(text);
        assert_eq!(prd.tasks.len(), 1);
        assert_eq!(prd.tasks[0].title, "real task");
    }

    #[test]
    fn test_fallback_without_tasks_heading() {
        let text = "- [ ] loose one\n- [x] loose two\n";
        let prd = parse_markdown(text);
        assert_eq!(prd.tasks.len(), 2);
    }

    #[test]
    fn test_select_respects_dependencies() {
        let (_dir, tracker) = write_prd(SAMPLE);
        // Task 1 is the first open task.
        let task = tracker.peek_next_task(&HashSet::new()).unwrap();
        assert_eq!(task.id, "1");

        // With 1 excluded, task 5 is next: deps 2 (done) and 4 (blocked) are
        // settled, while task 3 is in-progress.
        let exclude: HashSet<String> = ["1".to_string()].into_iter().collect();
        let task = tracker.peek_next_task(&exclude).unwrap();
        assert_eq!(task.id, "5");
    }

    #[test]
    fn test_unsatisfied_dependency_not_selectable() {
        let text = "\
## Tasks

- [ ] Build parser
- [ ] Wire parser into CLI
  - Depends on: 1
";
        let (_dir, tracker) = write_prd(text);
        let exclude: HashSet<String> = ["1".to_string()].into_iter().collect();
        assert!(tracker.peek_next_task(&exclude).is_none());
    }

    #[test]
    fn test_counts_and_all_done() {
        let (_dir, tracker) = write_prd(SAMPLE);
        // Done + blocked both settle.
        assert_eq!(tracker.counts(), (2, 5));
        assert!(!tracker.all_done());

        let (_dir, tracker) = write_prd("## Tasks\n\n- [x] a\n- [-] b\n");
        assert!(tracker.all_done());
    }

    #[test]
    fn test_force_task_open_rewrites_marker() {
        let (_dir, tracker) = write_prd(SAMPLE);
        assert!(tracker.is_task_done("2"));
        assert!(tracker.force_task_open("2"));
        assert!(!tracker.is_task_done("2"));
        // A second force is a no-op.
        assert!(!tracker.force_task_open("2"));
    }

    #[test]
    fn test_block_task() {
        let (_dir, tracker) = write_prd(SAMPLE);
        assert!(tracker.block_task("1", "attempt limit"));
        let prd = tracker.load().unwrap();
        assert_eq!(prd.tasks[0].status, TaskStatus::Blocked);
        // Already blocked.
        assert!(!tracker.block_task("4", "again"));
    }

    #[test]
    fn test_branch_name_from_header() {
        let (_dir, tracker) = write_prd(SAMPLE);
        assert_eq!(tracker.branch_name().as_deref(), Some("feature/ralph"));
    }

    proptest::proptest! {
        /// Arbitrary text never panics the parser and always yields
        /// sequential 1-based ids.
        #[test]
        fn test_parse_total_and_ids_sequential(text in "\\PC{0,400}") {
            let prd = parse_markdown(&text);
            for (i, task) in prd.tasks.iter().enumerate() {
                let expected_id = (i + 1).to_string();
                proptest::prop_assert_eq!(task.id.as_str(), expected_id.as_str());
            }
        }
    }

    #[test]
    fn test_missing_file_degrades() {
        let tracker = MarkdownTracker::new(PathBuf::from("/nonexistent/PRD.md"));
        assert!(tracker.peek_next_task(&HashSet::new()).is_none());
        assert_eq!(tracker.counts(), (0, 0));
        assert!(!tracker.all_done());
        assert!(!tracker.force_task_open("1"));
    }
}
