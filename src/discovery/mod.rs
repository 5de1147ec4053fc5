//! Discovery (spec §4.5): walk a tasks directory and return `Unit[]`.
//!
//! Each immediate subdirectory of the tasks root is a candidate unit. It
//! must contain exactly one implementation-plan file (a markdown file whose
//! frontmatter carries a `unit:` key) and any number of numbered task files
//! (markdown files whose frontmatter carries a `task:` key). Discovery never
//! mutates the frontmatter it reads; only the Worker does.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::domain::{Task, TaskStatus, Unit};
use crate::frontmatter;

#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    #[error("{path}: {source}")]
    Frontmatter {
        path: PathBuf,
        #[source]
        source: frontmatter::FrontmatterError,
    },

    #[error("{path}: {0}", path = .path.display())]
    Io { path: PathBuf, source: std::io::Error },

    #[error("unit directory {dir} has no implementation-plan file (a markdown file with a `unit:` frontmatter key)")]
    MissingPlanFile { dir: PathBuf },

    #[error("duplicate unit id {id:?}: seen in both {first} and {second}")]
    DuplicateUnitId { id: String, first: PathBuf, second: PathBuf },

    #[error("unit {unit:?} depends on unknown unit {dependency:?}")]
    UnknownUnitDependency { unit: String, dependency: String },

    #[error("unit {unit:?} task {task} depends on unknown task number {dependency} within the same unit")]
    UnknownTaskDependency { unit: String, task: u32, dependency: u32 },

    #[error("unit {unit:?} has two task files both declaring task number {number}")]
    DuplicateTaskNumber { unit: String, number: u32 },

    #[error("unit {unit:?}: unknown task status {status:?}")]
    UnknownTaskStatus { unit: String, status: String },
}

#[derive(Debug, Deserialize)]
struct PlanFrontmatter {
    unit: String,
    #[serde(default)]
    depends_on: Vec<String>,
    #[serde(default)]
    provider: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TaskFrontmatter {
    task: u32,
    status: String,
    backpressure: String,
    #[serde(default)]
    depends_on: Vec<u32>,
}

/// Walk `tasks_dir` and return every discovered unit, sorted by id for
/// deterministic downstream scheduling.
pub fn discover(tasks_dir: &Path) -> Result<Vec<Unit>, DiscoveryError> {
    let mut units = Vec::new();
    let mut seen_ids: HashMap<String, PathBuf> = HashMap::new();

    let mut entries: Vec<PathBuf> = std::fs::read_dir(tasks_dir)
        .map_err(|e| DiscoveryError::Io { path: tasks_dir.to_path_buf(), source: e })?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_dir())
        .collect();
    entries.sort();

    for dir in entries {
        let unit = discover_unit(&dir)?;
        if let Some(prior) = seen_ids.get(&unit.id) {
            return Err(DiscoveryError::DuplicateUnitId {
                id: unit.id.clone(),
                first: prior.clone(),
                second: dir.clone(),
            });
        }
        seen_ids.insert(unit.id.clone(), dir.clone());
        units.push(unit);
    }

    let known_ids: HashSet<&str> = units.iter().map(|u| u.id.as_str()).collect();
    for unit in &units {
        for dep in &unit.depends_on {
            if !known_ids.contains(dep.as_str()) {
                return Err(DiscoveryError::UnknownUnitDependency {
                    unit: unit.id.clone(),
                    dependency: dep.clone(),
                });
            }
        }
    }

    units.sort_by(|a, b| a.id.cmp(&b.id));
    Ok(units)
}

fn discover_unit(dir: &Path) -> Result<Unit, DiscoveryError> {
    let mut plan: Option<(PathBuf, PlanFrontmatter)> = None;
    let mut tasks = Vec::new();
    let mut task_numbers = HashSet::new();
    let mut unit_id_for_errors = dir.display().to_string();

    let mut md_files: Vec<PathBuf> = walkdir::WalkDir::new(dir)
        .max_depth(1)
        .into_iter()
        .filter_map(|e| e.ok())
        .map(|e| e.path().to_path_buf())
        .filter(|p| p.extension().map(|e| e == "md").unwrap_or(false))
        .collect();
    md_files.sort();

    for path in md_files {
        let content = std::fs::read_to_string(&path).map_err(|e| DiscoveryError::Io { path: path.clone(), source: e })?;

        // Sniff which kind of file this is before committing to a typed
        // parse, since a unit directory freely mixes exactly one plan file
        // with any number of task files.
        let (yaml, _body) = frontmatter::split(&content)
            .map_err(|source| DiscoveryError::Frontmatter { path: path.clone(), source })?;
        let sniff: serde_yaml::Value = serde_yaml::from_str(&yaml).map_err(|e| DiscoveryError::Frontmatter {
            path: path.clone(),
            source: frontmatter::FrontmatterError::InvalidYaml(e),
        })?;

        if sniff.get("unit").is_some() {
            let (fm, _): (PlanFrontmatter, String) = frontmatter::parse(&content)
                .map_err(|source| DiscoveryError::Frontmatter { path: path.clone(), source })?;
            unit_id_for_errors = fm.unit.clone();
            plan = Some((path, fm));
        } else if sniff.get("task").is_some() {
            let (fm, body): (TaskFrontmatter, String) = frontmatter::parse(&content)
                .map_err(|source| DiscoveryError::Frontmatter { path: path.clone(), source })?;

            if !task_numbers.insert(fm.task) {
                return Err(DiscoveryError::DuplicateTaskNumber {
                    unit: unit_id_for_errors.clone(),
                    number: fm.task,
                });
            }

            let status = fm.status.parse::<TaskStatus>().map_err(|_| DiscoveryError::UnknownTaskStatus {
                unit: unit_id_for_errors.clone(),
                status: fm.status.clone(),
            })?;

            tasks.push(Task {
                number: fm.task,
                path: path.clone(),
                prompt: body,
                backpressure: fm.backpressure,
                depends_on: fm.depends_on,
                status,
            });
        }
        // Files with neither key are ignored (README.md, notes, etc.).
    }

    let (plan_file, plan_fm) = plan.ok_or_else(|| DiscoveryError::MissingPlanFile { dir: dir.to_path_buf() })?;

    tasks.sort_by_key(|t| t.number);

    let known_task_numbers: HashSet<u32> = tasks.iter().map(|t| t.number).collect();
    for task in &tasks {
        for dep in &task.depends_on {
            if !known_task_numbers.contains(dep) {
                return Err(DiscoveryError::UnknownTaskDependency {
                    unit: plan_fm.unit.clone(),
                    task: task.number,
                    dependency: *dep,
                });
            }
        }
    }

    Ok(Unit {
        id: plan_fm.unit,
        dir: dir.to_path_buf(),
        plan_file,
        depends_on: plan_fm.depends_on,
        tasks,
        provider: plan_fm.provider,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn write(dir: &Path, name: &str, content: &str) {
        fs::write(dir.join(name), content).unwrap();
    }

    #[test]
    fn discovers_single_unit_with_two_tasks() {
        let root = tempdir().unwrap();
        let unit_dir = root.path().join("unit-a");
        fs::create_dir(&unit_dir).unwrap();
        write(&unit_dir, "plan.md", "---\nunit: unit-a\ndepends_on: []\n---\nDo the thing\n");
        write(
            &unit_dir,
            "1.md",
            "---\ntask: 1\nstatus: pending\nbackpressure: \"exit 0\"\ndepends_on: []\n---\nFirst task\n",
        );
        write(
            &unit_dir,
            "2.md",
            "---\ntask: 2\nstatus: pending\nbackpressure: \"exit 0\"\ndepends_on: [1]\n---\nSecond task\n",
        );

        let units = discover(root.path()).unwrap();
        assert_eq!(units.len(), 1);
        assert_eq!(units[0].id, "unit-a");
        assert_eq!(units[0].tasks.len(), 2);
        assert_eq!(units[0].tasks[1].depends_on, vec![1]);
    }

    #[test]
    fn rejects_unknown_unit_dependency() {
        let root = tempdir().unwrap();
        let unit_dir = root.path().join("unit-a");
        fs::create_dir(&unit_dir).unwrap();
        write(&unit_dir, "plan.md", "---\nunit: unit-a\ndepends_on: [ghost]\n---\nbody\n");

        let err = discover(root.path()).unwrap_err();
        assert!(matches!(err, DiscoveryError::UnknownUnitDependency { .. }));
    }

    #[test]
    fn rejects_missing_plan_file() {
        let root = tempdir().unwrap();
        let unit_dir = root.path().join("unit-a");
        fs::create_dir(&unit_dir).unwrap();
        write(
            &unit_dir,
            "1.md",
            "---\ntask: 1\nstatus: pending\nbackpressure: \"exit 0\"\ndepends_on: []\n---\nbody\n",
        );

        let err = discover(root.path()).unwrap_err();
        assert!(matches!(err, DiscoveryError::MissingPlanFile { .. }));
    }

    #[test]
    fn rejects_duplicate_unit_ids() {
        let root = tempdir().unwrap();
        for name in ["unit-a", "unit-b"] {
            let dir = root.path().join(name);
            fs::create_dir(&dir).unwrap();
            write(&dir, "plan.md", "---\nunit: same-id\ndepends_on: []\n---\nbody\n");
        }

        let err = discover(root.path()).unwrap_err();
        assert!(matches!(err, DiscoveryError::DuplicateUnitId { .. }));
    }

    #[test]
    fn rejects_unknown_task_status() {
        let root = tempdir().unwrap();
        let unit_dir = root.path().join("unit-a");
        fs::create_dir(&unit_dir).unwrap();
        write(&unit_dir, "plan.md", "---\nunit: unit-a\ndepends_on: []\n---\nbody\n");
        write(
            &unit_dir,
            "1.md",
            "---\ntask: 1\nstatus: done_i_guess\nbackpressure: \"exit 0\"\ndepends_on: []\n---\nbody\n",
        );

        let err = discover(root.path()).unwrap_err();
        assert!(matches!(err, DiscoveryError::UnknownTaskStatus { .. }));
    }

    #[test]
    fn rejects_duplicate_task_number() {
        let root = tempdir().unwrap();
        let unit_dir = root.path().join("unit-a");
        fs::create_dir(&unit_dir).unwrap();
        write(&unit_dir, "plan.md", "---\nunit: unit-a\ndepends_on: []\n---\nbody\n");
        write(
            &unit_dir,
            "1.md",
            "---\ntask: 1\nstatus: pending\nbackpressure: \"exit 0\"\ndepends_on: []\n---\nfirst\n",
        );
        write(
            &unit_dir,
            "1b.md",
            "---\ntask: 1\nstatus: pending\nbackpressure: \"exit 0\"\ndepends_on: []\n---\nalso claims task 1\n",
        );

        let err = discover(root.path()).unwrap_err();
        assert!(matches!(err, DiscoveryError::DuplicateTaskNumber { .. }));
    }

    #[test]
    fn rejects_unknown_task_dependency() {
        let root = tempdir().unwrap();
        let unit_dir = root.path().join("unit-a");
        fs::create_dir(&unit_dir).unwrap();
        write(&unit_dir, "plan.md", "---\nunit: unit-a\ndepends_on: []\n---\nbody\n");
        write(
            &unit_dir,
            "1.md",
            "---\ntask: 1\nstatus: pending\nbackpressure: \"exit 0\"\ndepends_on: [99]\n---\nbody\n",
        );

        let err = discover(root.path()).unwrap_err();
        assert!(matches!(err, DiscoveryError::UnknownTaskDependency { .. }));
    }

    #[test]
    fn results_are_sorted_by_unit_id() {
        let root = tempdir().unwrap();
        for (dirname, id) in [("z", "zzz"), ("a", "aaa")] {
            let dir = root.path().join(dirname);
            fs::create_dir(&dir).unwrap();
            write(&dir, "plan.md", &format!("---\nunit: {id}\ndepends_on: []\n---\nbody\n"));
        }

        let units = discover(root.path()).unwrap();
        assert_eq!(units.iter().map(|u| u.id.as_str()).collect::<Vec<_>>(), vec!["aaa", "zzz"]);
    }
}
