//! Prompt-side agent pieces: personas, skills, and context budgeting.

pub mod context_monitor;
mod persona;
mod skills;

pub use context_monitor::{ContextBreakdown, ContextMonitor};
pub use persona::{DEFAULT_PERSONA, Persona, PersonaRegistry};
pub use skills::{Skill, SkillRegistry};
