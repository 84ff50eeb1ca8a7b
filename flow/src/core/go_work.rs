//! `go.work` parsing and rewriting for ecosystem worktrees.

use std::collections::HashSet;
use std::fmt::Write as _;
use std::path::Path;

pub const DEFAULT_GO_VERSION: &str = "go 1.21";

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct GoWork {
    /// The full `go <version>` line.
    pub go_version: Option<String>,
    pub uses: Vec<String>,
}

pub fn parse(text: &str) -> GoWork {
    let mut work = GoWork::default();
    let mut in_use_block = false;
    for raw in text.lines() {
        let line = raw.split("//").next().unwrap_or("").trim();
        if line.is_empty() {
            continue;
        }
        if in_use_block {
            if line == ")" {
                in_use_block = false;
            } else {
                work.uses.push(line.to_string());
            }
        } else if line.starts_with("go ") {
            work.go_version = Some(line.to_string());
        } else if let Some(rest) = line.strip_prefix("use") {
            let rest = rest.trim();
            if rest == "(" {
                in_use_block = true;
            } else if !rest.is_empty() {
                work.uses.push(rest.to_string());
            }
        }
    }
    work
}

/// The repository a `use` path points at (`./grove-core` -> `grove-core`).
pub fn module_name(use_path: &str) -> &str {
    use_path
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or(use_path)
}

/// Render `work` for a worktree.
///
/// Modules populated inside the worktree keep a relative path; the rest are
/// pointed at their checkout under `source_root` so the workspace still
/// builds.
pub fn rewrite(work: &GoWork, source_root: &Path, populated: &HashSet<String>) -> String {
    let uses = work
        .uses
        .iter()
        .map(|use_path| {
            let name = module_name(use_path);
            if use_path == "." || populated.contains(name) {
                use_path.clone()
            } else if Path::new(use_path).is_absolute() {
                use_path.clone()
            } else {
                let relative = use_path.trim_start_matches("./");
                source_root.join(relative).display().to_string()
            }
        })
        .collect::<Vec<_>>();
    render(work.go_version.as_deref().unwrap_or(DEFAULT_GO_VERSION), &uses)
}

/// A fresh `go.work` using `./<repo>` for each repository.
pub fn generate<'a>(repos: impl IntoIterator<Item = &'a str>) -> String {
    let uses = repos
        .into_iter()
        .map(|repo| format!("./{repo}"))
        .collect::<Vec<_>>();
    render(DEFAULT_GO_VERSION, &uses)
}

fn render(go_version: &str, uses: &[String]) -> String {
    let mut out = format!("{go_version}\n\nuse (\n");
    for use_path in uses {
        let _ = writeln!(out, "\t{use_path}");
    }
    out.push_str(")\n");
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const WORK: &str = "go 1.22\n\n// modules\nuse (\n\t./core\n\t./cli // main\n\t./docs\n)\n\nuse ./extra\n";

    #[test]
    fn parses_block_and_single_uses() {
        let work = parse(WORK);
        assert_eq!(work.go_version.as_deref(), Some("go 1.22"));
        assert_eq!(work.uses, vec!["./core", "./cli", "./docs", "./extra"]);
    }

    #[test]
    fn unpopulated_modules_point_at_source() {
        let work = parse(WORK);
        let populated = HashSet::from(["core".to_string(), "cli".to_string()]);
        let text = rewrite(&work, Path::new("/src/eco"), &populated);
        assert_eq!(
            text,
            "go 1.22\n\nuse (\n\t./core\n\t./cli\n\t/src/eco/docs\n\t/src/eco/extra\n)\n"
        );
    }

    #[test]
    fn generates_from_repos() {
        assert_eq!(
            generate(["api", "web"]),
            "go 1.21\n\nuse (\n\t./api\n\t./web\n)\n"
        );
    }
}
