//! Persona templates.
//!
//! A persona is a Markdown system-prompt template stored at
//! `<workspace>/agents/<name>.md`. Templates may start with a front matter
//! block:
//!
//! ```text
//! ---
//! name: coder
//! description: Writes and reviews code
//! ---
//! You are a careful engineer. It is {{TIME}}.
//! ```
//!
//! `{{KEY}}` placeholders are filled from persona vars at render time.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Persona used when nothing else is configured.
pub const DEFAULT_PERSONA: &str = "soul";

const SOUL_TEMPLATE: &str = "You are a personal assistant running as a long-lived agent.\n\
You are woken by chat messages, timers, and other sessions. Each wake message \
starts with a header describing why you were woken and where your reply goes.\n\n\
Current time: {{TIME}}\n\n\
## Tools\n\n{{TOOLS}}\n\n\
{{SKILLS}}\n\n\
## Session\n\n{{SESSION}}";

/// A loaded persona template plus its substitution vars.
#[derive(Debug, Clone, PartialEq)]
pub struct Persona {
    name: String,
    description: String,
    template: String,
    vars: BTreeMap<String, String>,
}

impl Persona {
    /// Create a persona from a raw template.
    pub fn new(name: impl Into<String>, template: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            template: template.into(),
            vars: BTreeMap::new(),
        }
    }

    /// The built-in default persona.
    pub fn soul() -> Self {
        Self::new(DEFAULT_PERSONA, SOUL_TEMPLATE)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    /// Set a substitution var.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.vars.insert(key.into(), value.into());
    }

    /// Render the template. Unknown placeholders are left as-is.
    pub fn render(&self) -> String {
        let mut out = self.template.clone();
        for (key, value) in &self.vars {
            out = out.replace(&format!("{{{{{}}}}}", key), value);
        }
        out.trim().to_string()
    }

    fn parse(file_stem: &str, raw: &str) -> Self {
        let (front, body) = split_front_matter(raw);
        let mut persona = Self::new(file_stem, body.trim());
        for line in front.lines() {
            let Some((key, value)) = line.split_once(':') else {
                continue;
            };
            let value = value.trim().trim_matches('"');
            match key.trim() {
                "name" if !value.is_empty() => persona.name = value.to_string(),
                "description" => persona.description = value.to_string(),
                _ => {}
            }
        }
        persona
    }
}

/// Split `---\n...\n---\n` front matter from the body.
pub(crate) fn split_front_matter(raw: &str) -> (&str, &str) {
    let Some(rest) = raw.strip_prefix("---") else {
        return ("", raw);
    };
    match rest.find("\n---") {
        Some(end) => {
            let front = &rest[..end];
            let body = &rest[end + 4..];
            (front, body.strip_prefix('\n').unwrap_or(body))
        }
        None => ("", raw),
    }
}

/// Looks up persona templates on disk.
///
/// Files are re-read on every lookup so edits take effect on the next turn.
#[derive(Debug, Clone)]
pub struct PersonaRegistry {
    dir: Option<PathBuf>,
    default_name: String,
}

impl PersonaRegistry {
    /// Create a registry reading from `dir`.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: Some(dir.into()),
            default_name: DEFAULT_PERSONA.to_string(),
        }
    }

    /// A registry that only knows the built-in persona.
    pub fn builtin() -> Self {
        Self {
            dir: None,
            default_name: DEFAULT_PERSONA.to_string(),
        }
    }

    /// Override the default persona name.
    pub fn with_default(mut self, name: impl Into<String>) -> Self {
        self.default_name = name.into();
        self
    }

    pub fn default_name(&self) -> &str {
        &self.default_name
    }

    /// Load a persona by name. Blank names resolve to the default persona.
    pub fn load(&self, name: &str) -> Option<Persona> {
        let name = match name.trim() {
            "" => self.default_name.as_str(),
            n => n,
        };

        if let Some(dir) = &self.dir {
            if let Some(persona) = load_from_dir(dir, name) {
                return Some(persona);
            }
        }

        (name == DEFAULT_PERSONA).then(Persona::soul)
    }

    /// Load the default persona, falling back to the built-in one.
    pub fn load_default(&self) -> Persona {
        self.load(&self.default_name).unwrap_or_else(Persona::soul)
    }

    /// Names of every persona available on disk plus the built-in one.
    pub fn names(&self) -> Vec<String> {
        let mut names = vec![DEFAULT_PERSONA.to_string()];
        if let Some(dir) = &self.dir {
            for (stem, raw) in read_templates(dir) {
                names.push(Persona::parse(&stem, &raw).name);
            }
        }
        names.sort();
        names.dedup();
        names
    }
}

fn load_from_dir(dir: &Path, name: &str) -> Option<Persona> {
    let direct = dir.join(format!("{}.md", name));
    if let Ok(raw) = std::fs::read_to_string(&direct) {
        return Some(Persona::parse(name, &raw));
    }
    read_templates(dir)
        .into_iter()
        .map(|(stem, raw)| Persona::parse(&stem, &raw))
        .find(|p| p.name == name)
}

fn read_templates(dir: &Path) -> Vec<(String, String)> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!("Failed to read persona dir {}: {}", dir.display(), e);
            }
            return Vec::new();
        }
    };

    let mut out = Vec::new();
    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("md") {
            continue;
        }
        let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        match std::fs::read_to_string(&path) {
            Ok(raw) => out.push((stem.to_string(), raw)),
            Err(e) => tracing::warn!("Failed to read persona {}: {}", path.display(), e),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_substitutes_vars() {
        let mut p = Persona::new("t", "Hi {{USER}}, it is {{TIME}}. {{MISSING}}");
        p.set("USER", "Ada");
        p.set("TIME", "noon");
        assert_eq!(p.render(), "Hi Ada, it is noon. {{MISSING}}");
    }

    #[test]
    fn test_front_matter_name_overrides_stem() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("engineer.md"),
            "---\nname: coder\ndescription: writes code\n---\nYou write code.",
        )
        .unwrap();

        let registry = PersonaRegistry::new(dir.path());
        let p = registry.load("coder").unwrap();
        assert_eq!(p.name(), "coder");
        assert_eq!(p.description(), "writes code");
        assert_eq!(p.render(), "You write code.");
        assert_eq!(registry.names(), vec!["coder".to_string(), "soul".to_string()]);
    }

    #[test]
    fn test_unknown_persona_and_builtin_fallback() {
        let dir = tempfile::tempdir().unwrap();
        let registry = PersonaRegistry::new(dir.path());
        assert!(registry.load("ghost").is_none());
        assert_eq!(registry.load("").unwrap().name(), DEFAULT_PERSONA);
        assert_eq!(registry.load_default().name(), DEFAULT_PERSONA);
    }

    #[test]
    fn test_split_front_matter_without_block() {
        assert_eq!(split_front_matter("plain"), ("", "plain"));
    }
}
