//! Skill discovery.
//!
//! A skill is a directory under `<workspace>/skills/` containing a `SKILL.md`.
//! Only the name, description, and path are put in the system prompt; the
//! model reads the file itself when it decides to use the skill.

use std::path::{Path, PathBuf};

use crate::agent::persona::split_front_matter;

/// One discovered skill.
#[derive(Debug, Clone, PartialEq)]
pub struct Skill {
    pub name: String,
    pub description: String,
    pub path: PathBuf,
}

/// Scans a skills directory on demand.
#[derive(Debug, Clone)]
pub struct SkillRegistry {
    dir: Option<PathBuf>,
}

impl SkillRegistry {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: Some(dir.into()),
        }
    }

    /// A registry with no skills.
    pub fn empty() -> Self {
        Self { dir: None }
    }

    /// Re-read the directory. Missing directories yield no skills.
    pub fn reload(&self) -> Vec<Skill> {
        let Some(dir) = &self.dir else {
            return Vec::new();
        };
        let mut skills = scan(dir);
        skills.sort_by(|a, b| a.name.cmp(&b.name));
        skills
    }

    /// Render the skills section of the system prompt.
    pub fn prompt_section(&self) -> String {
        let skills = self.reload();
        if skills.is_empty() {
            return String::new();
        }
        let mut out = String::from(
            "## Skills\n\nRead a skill's SKILL.md before using it.\n\n",
        );
        for skill in skills {
            out.push_str(&format!(
                "- **{}**: {} (`{}`)\n",
                skill.name,
                if skill.description.is_empty() {
                    "no description"
                } else {
                    &skill.description
                },
                skill.path.display()
            ));
        }
        out
    }
}

fn scan(dir: &Path) -> Vec<Skill> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!("Failed to read skills dir {}: {}", dir.display(), e);
            }
            return Vec::new();
        }
    };

    let mut out = Vec::new();
    for entry in entries.flatten() {
        let skill_dir = entry.path();
        let file = skill_dir.join("SKILL.md");
        let Ok(raw) = std::fs::read_to_string(&file) else {
            continue;
        };
        let fallback = skill_dir
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("skill")
            .to_string();

        let (front, body) = split_front_matter(&raw);
        let mut skill = Skill {
            name: fallback,
            description: String::new(),
            path: file,
        };
        for line in front.lines() {
            if let Some((key, value)) = line.split_once(':') {
                let value = value.trim().trim_matches('"');
                match key.trim() {
                    "name" if !value.is_empty() => skill.name = value.to_string(),
                    "description" => skill.description = value.to_string(),
                    _ => {}
                }
            }
        }
        if skill.description.is_empty() {
            // First non-heading line of the body.
            skill.description = body
                .lines()
                .map(str::trim)
                .find(|l| !l.is_empty() && !l.starts_with('#'))
                .unwrap_or_default()
                .to_string();
        }
        out.push(skill);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prompt_section_lists_skills() {
        let dir = tempfile::tempdir().unwrap();
        let weather = dir.path().join("weather");
        std::fs::create_dir_all(&weather).unwrap();
        std::fs::write(
            weather.join("SKILL.md"),
            "---\nname: weather\ndescription: Look up forecasts\n---\n# Weather\n",
        )
        .unwrap();
        let notes = dir.path().join("notes");
        std::fs::create_dir_all(&notes).unwrap();
        std::fs::write(notes.join("SKILL.md"), "# Notes\nKeep a journal.\n").unwrap();

        let registry = SkillRegistry::new(dir.path());
        let skills = registry.reload();
        assert_eq!(skills.len(), 2);
        assert_eq!(skills[0].name, "notes");
        assert_eq!(skills[0].description, "Keep a journal.");

        let section = registry.prompt_section();
        assert!(section.starts_with("## Skills"));
        assert!(section.contains("**weather**: Look up forecasts"));
    }

    #[test]
    fn test_empty_registry_renders_nothing() {
        assert!(SkillRegistry::empty().prompt_section().is_empty());
        let dir = tempfile::tempdir().unwrap();
        assert!(SkillRegistry::new(dir.path().join("absent")).prompt_section().is_empty());
    }
}
