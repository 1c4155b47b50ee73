use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};

/// Placeholder replaced by the profile's source filename
pub const INPUT_PLACEHOLDER: &str = "%INPUT%";
/// Placeholder replaced by the build artifact name
pub const OUTPUT_PLACEHOLDER: &str = "%OUTPUT%";
/// Name of the artifact produced by a build step
pub const ARTIFACT_NAME: &str = "main";

/// Build/run recipe for one supported language
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct LanguageProfile {
    pub id: String,
    pub source_filename: String,
    /// Isolation environment reference (a container image for the docker runtime)
    pub image: String,
    #[serde(default)]
    pub build_command: Option<Vec<String>>,
    pub run_command: Vec<String>,
    #[serde(default)]
    pub aliases: Vec<String>,
}

impl LanguageProfile {
    pub fn is_compiled(&self) -> bool {
        self.build_command.is_some()
    }

    /// Build command with placeholders substituted, if the language has one
    pub fn build_argv(&self) -> Option<Vec<String>> {
        self.build_command
            .as_deref()
            .map(|command| self.apply_template(command))
    }

    /// Run command with placeholders substituted
    pub fn run_argv(&self) -> Vec<String> {
        self.apply_template(&self.run_command)
    }

    fn apply_template(&self, command: &[String]) -> Vec<String> {
        command
            .iter()
            .map(|arg| {
                arg.replace(INPUT_PLACEHOLDER, &self.source_filename)
                    .replace(OUTPUT_PLACEHOLDER, ARTIFACT_NAME)
            })
            .collect()
    }

    fn validate(&self) -> Result<()> {
        if normalize_id(&self.id).is_empty() {
            bail!("language profile with an empty id");
        }
        if self.run_command.is_empty() {
            bail!("language {} has an empty run command", self.id);
        }
        if matches!(&self.build_command, Some(command) if command.is_empty()) {
            bail!("language {} has an empty build command", self.id);
        }
        if !is_plain_file_name(&self.source_filename) {
            bail!(
                "language {} has an invalid source filename {:?}",
                self.id,
                self.source_filename
            );
        }
        Ok(())
    }
}

/// Immutable mapping from language ids (and aliases) to profiles.
///
/// Built once at startup and shared read-only afterwards. New languages are added
/// by listing them in the configuration; nothing in the sandbox has to change.
#[derive(Debug, Clone)]
pub struct LanguageRegistry {
    profiles: HashMap<String, Arc<LanguageProfile>>,
    index: HashMap<String, String>,
}

impl LanguageRegistry {
    /// Builds a registry, rejecting duplicate ids/aliases and malformed profiles
    pub fn new(profiles: Vec<LanguageProfile>) -> Result<Self> {
        let mut registry = Self {
            profiles: HashMap::new(),
            index: HashMap::new(),
        };

        for profile in profiles {
            profile.validate()?;
            let id = normalize_id(&profile.id);
            if registry.profiles.contains_key(&id) {
                bail!("duplicate language id: {id}");
            }

            for key in std::iter::once(&profile.id).chain(profile.aliases.iter()) {
                let key = normalize_id(key);
                match registry.index.get(&key) {
                    Some(owner) if *owner == id => {}
                    Some(owner) => bail!("language key {key} is claimed by both {owner} and {id}"),
                    None => {
                        registry.index.insert(key, id.clone());
                    }
                }
            }
            registry.profiles.insert(id, Arc::new(profile));
        }

        Ok(registry)
    }

    /// Built-in profiles, overlaid by `extra` (an entry with the same id replaces
    /// the built-in one)
    pub fn with_builtin(extra: Vec<LanguageProfile>) -> Result<Self> {
        let mut profiles = builtin_profiles();
        for profile in extra {
            let id = normalize_id(&profile.id);
            profiles.retain(|p| normalize_id(&p.id) != id);
            profiles.push(profile);
        }
        Self::new(profiles)
    }

    pub fn resolve(&self, language: &str) -> EngineResult<Arc<LanguageProfile>> {
        self.index
            .get(&normalize_id(language))
            .and_then(|id| self.profiles.get(id))
            .cloned()
            .ok_or_else(|| EngineError::UnsupportedLanguage(language.trim().to_string()))
    }

    /// All registered profiles, sorted by id
    pub fn profiles(&self) -> Vec<Arc<LanguageProfile>> {
        let mut profiles: Vec<_> = self.profiles.values().cloned().collect();
        profiles.sort_by(|a, b| a.id.cmp(&b.id));
        profiles
    }

    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }
}

fn normalize_id(id: &str) -> String {
    id.trim().to_ascii_lowercase()
}

/// True for a single path component that is not `.`/`..`
pub(crate) fn is_plain_file_name(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains('/')
        && !name.contains('\\')
        && !name.contains('\0')
}

fn argv(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|s| s.to_string()).collect()
}

/// The languages supported out of the box
pub fn builtin_profiles() -> Vec<LanguageProfile> {
    vec![
        LanguageProfile {
            id: "python".to_string(),
            source_filename: "code.py".to_string(),
            image: "python:3.9-slim".to_string(),
            build_command: None,
            run_command: argv(&["python", "-u", "%INPUT%"]),
            aliases: argv(&["py", "python3"]),
        },
        LanguageProfile {
            id: "cpp".to_string(),
            source_filename: "code.cpp".to_string(),
            image: "gcc:latest".to_string(),
            build_command: Some(argv(&["g++", "-O2", "-o", "%OUTPUT%", "%INPUT%"])),
            run_command: argv(&["./%OUTPUT%"]),
            aliases: argv(&["c++", "cxx"]),
        },
        LanguageProfile {
            id: "java".to_string(),
            source_filename: "Main.java".to_string(),
            image: "openjdk:11-jdk-slim".to_string(),
            build_command: Some(argv(&["javac", "%INPUT%"])),
            run_command: argv(&["java", "-cp", ".", "Main"]),
            aliases: Vec::new(),
        },
        LanguageProfile {
            id: "javascript".to_string(),
            source_filename: "code.js".to_string(),
            image: "node:16-slim".to_string(),
            build_command: None,
            run_command: argv(&["node", "%INPUT%"]),
            aliases: argv(&["js", "node"]),
        },
        LanguageProfile {
            id: "go".to_string(),
            source_filename: "main.go".to_string(),
            image: "golang:1.19-alpine".to_string(),
            build_command: Some(argv(&["go", "build", "-o", "%OUTPUT%", "%INPUT%"])),
            run_command: argv(&["./%OUTPUT%"]),
            aliases: argv(&["golang"]),
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shell_profile(id: &str) -> LanguageProfile {
        LanguageProfile {
            id: id.to_string(),
            source_filename: "main.sh".to_string(),
            image: "busybox".to_string(),
            build_command: None,
            run_command: argv(&["sh", "%INPUT%"]),
            aliases: Vec::new(),
        }
    }

    #[test]
    fn test_builtin_languages_resolve() {
        let registry = LanguageRegistry::with_builtin(Vec::new()).unwrap();
        assert_eq!(registry.len(), 5);
        for id in ["python", "cpp", "java", "javascript", "go"] {
            assert_eq!(registry.resolve(id).unwrap().id, id);
        }
    }

    #[test]
    fn test_resolve_is_case_insensitive_and_follows_aliases() {
        let registry = LanguageRegistry::with_builtin(Vec::new()).unwrap();
        assert_eq!(registry.resolve("  Python ").unwrap().id, "python");
        assert_eq!(registry.resolve("JS").unwrap().id, "javascript");
        assert_eq!(registry.resolve("c++").unwrap().id, "cpp");
    }

    #[test]
    fn test_unknown_language_is_unsupported() {
        let registry = LanguageRegistry::with_builtin(Vec::new()).unwrap();
        assert_eq!(
            registry.resolve("cobol").unwrap_err(),
            EngineError::UnsupportedLanguage("cobol".to_string())
        );
    }

    #[test]
    fn test_templates_are_substituted() {
        let registry = LanguageRegistry::with_builtin(Vec::new()).unwrap();
        let cpp = registry.resolve("cpp").unwrap();
        assert_eq!(
            cpp.build_argv().unwrap(),
            argv(&["g++", "-O2", "-o", "main", "code.cpp"])
        );
        assert_eq!(cpp.run_argv(), argv(&["./main"]));

        let python = registry.resolve("python").unwrap();
        assert!(python.build_argv().is_none());
        assert_eq!(python.run_argv(), argv(&["python", "-u", "code.py"]));
    }

    #[test]
    fn test_configured_profiles_extend_and_replace_builtins() {
        let mut python = shell_profile("python");
        python.image = "python:3.12-slim".to_string();
        let registry =
            LanguageRegistry::with_builtin(vec![shell_profile("sh"), python]).unwrap();

        assert_eq!(registry.len(), 6);
        assert_eq!(registry.resolve("sh").unwrap().image, "busybox");
        assert_eq!(registry.resolve("python").unwrap().image, "python:3.12-slim");
        // aliases of the replaced built-in are gone with it
        assert!(registry.resolve("py").is_err());
    }

    #[test]
    fn test_duplicate_keys_are_rejected() {
        assert!(LanguageRegistry::new(vec![shell_profile("sh"), shell_profile("SH")]).is_err());

        let mut other = shell_profile("bash");
        other.aliases = vec!["sh".to_string()];
        assert!(LanguageRegistry::new(vec![shell_profile("sh"), other]).is_err());
    }

    #[test]
    fn test_malformed_profiles_are_rejected() {
        let mut empty_run = shell_profile("sh");
        empty_run.run_command.clear();
        assert!(LanguageRegistry::new(vec![empty_run]).is_err());

        let mut nested = shell_profile("sh");
        nested.source_filename = "../main.sh".to_string();
        assert!(LanguageRegistry::new(vec![nested]).is_err());
    }

    #[test]
    fn test_profiles_are_sorted() {
        let registry = LanguageRegistry::with_builtin(Vec::new()).unwrap();
        let ids: Vec<_> = registry.profiles().iter().map(|p| p.id.clone()).collect();
        assert_eq!(ids, vec!["cpp", "go", "java", "javascript", "python"]);
    }

    #[test]
    fn test_alias_repeating_own_id_is_accepted() {
        let mut ruby = shell_profile("ruby");
        ruby.aliases = argv(&["Ruby", " ruby ", "rb"]);
        let registry = LanguageRegistry::new(vec![ruby]).unwrap();
        assert_eq!(registry.resolve("RB").unwrap().id, "ruby");
    }
}
