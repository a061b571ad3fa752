use serde::{Deserialize, Deserializer, Serialize, de};

use crate::config::ConfigError;
use crate::types::{DirRule, EnvRule, ResourceLimits};

const INVALID_FILE_EXT_CHARS: [char; 2] = ['/', '.'];

/// Default PATH inside the sandbox
pub const DEFAULT_SANDBOX_PATH: &str = "/usr/bin:/bin";

/// Profile of a programming language
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Language {
    /// Human-readable name for the language (e.g., "C++20 (GCC)")
    pub name: String,

    pub extension: FileExtension,

    /// Compilation step; `None` for interpreted languages
    #[serde(default)]
    pub compile: Option<CompileConfig>,

    pub run: RunConfig,

    /// Directories the toolchain needs. Mounted while compiling, and also at
    /// run time when the language is interpreted.
    #[serde(default)]
    pub mounts: Vec<DirRule>,

    /// Environment shared by compilation and execution
    #[serde(default)]
    pub env: Vec<EnvRule>,

    /// PATH inside the sandbox
    #[serde(default = "default_sandbox_path")]
    pub path: String,
}

impl Language {
    pub fn is_compiled(&self) -> bool {
        self.compile.is_some()
    }

    /// Name the submitted source is written under
    pub fn source_name(&self) -> String {
        match self.compile {
            Some(ref compile) => compile.source_name.clone(),
            None => format!("main.{}", self.extension),
        }
    }

    /// Name the cached artifact is staged under before a run.
    ///
    /// Interpreted languages cache the source itself, so this is the source
    /// name for them.
    pub fn compiled_name(&self) -> String {
        match self.compile {
            Some(ref compile) => compile.output_name.clone(),
            None => self.source_name(),
        }
    }

    /// Compile command with placeholders filled in, `None` when interpreted
    pub fn compile_command(&self) -> Option<Vec<String>> {
        self.compile.as_ref().map(|compile| {
            Self::expand_command(&compile.command, &compile.source_name, &compile.output_name)
        })
    }

    pub fn run_command(&self) -> Vec<String> {
        Self::expand_command(&self.run.command, &self.source_name(), &self.compiled_name())
    }

    /// Environment for the compile step: PATH, then common, then build rules
    pub fn build_env(&self) -> Vec<EnvRule> {
        let build = self.compile.iter().flat_map(|c| c.env.iter());
        self.layered_env(build)
    }

    /// Environment for the run step: PATH, then common, then run rules
    pub fn run_env(&self) -> Vec<EnvRule> {
        self.layered_env(self.run.env.iter())
    }

    fn layered_env<'a>(&'a self, specific: impl Iterator<Item = &'a EnvRule>) -> Vec<EnvRule> {
        std::iter::once(EnvRule::set("PATH", self.path.clone()))
            .chain(self.env.iter().cloned())
            .chain(specific.cloned())
            .collect()
    }

    /// Directory rules for the run step
    pub fn run_mounts(&self) -> Vec<DirRule> {
        let toolchain = (!self.is_compiled()).then_some(self.mounts.iter());
        toolchain
            .into_iter()
            .flatten()
            .chain(self.run.mounts.iter())
            .cloned()
            .collect()
    }

    /// Expand placeholders in the given command
    pub fn expand_command(command: &[String], source: &str, binary: &str) -> Vec<String> {
        command
            .iter()
            .map(|arg| {
                arg.replace("{source}", source)
                    .replace("{output}", binary)
                    .replace("{binary}", binary)
            })
            .collect()
    }
}

/// File extension without dot (e.g., "cpp")
#[derive(Debug, Clone, Serialize)]
pub struct FileExtension(String);

impl FileExtension {
    pub fn new(extension: &str) -> Result<Self, ConfigError> {
        let contains_invalid = extension
            .chars()
            .any(|c| INVALID_FILE_EXT_CHARS.contains(&c));
        if contains_invalid {
            return Err(ConfigError::InvalidFileExtChars);
        }
        Ok(Self(extension.to_owned()))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<'de> Deserialize<'de> for FileExtension {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        FileExtension::new(&s).map_err(|_| {
            de::Error::invalid_value(
                de::Unexpected::Str(&s),
                &"a file extension without '/' or '.' characters",
            )
        })
    }
}

impl std::fmt::Display for FileExtension {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Configuration for the compilation step
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompileConfig {
    /// Command and arguments; `{source}` and `{output}` are substituted
    pub command: Vec<String>,

    /// Source file name in the sandbox (e.g., "main.cpp")
    pub source_name: String,

    /// Name of the produced artifact (e.g., "main")
    pub output_name: String,

    /// Build-only environment
    #[serde(default)]
    pub env: Vec<EnvRule>,

    /// Overrides the grader's compile limits
    #[serde(default)]
    pub limits: Option<ResourceLimits>,
}

/// Configuration for the execution step
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    /// Command and arguments; `{source}` and `{binary}` are substituted
    pub command: Vec<String>,

    /// Run-only environment
    #[serde(default)]
    pub env: Vec<EnvRule>,

    /// Directories needed at run time regardless of compilation
    #[serde(default)]
    pub mounts: Vec<DirRule>,

    /// Limits layered under each test's own limits, e.g. a process cap
    #[serde(default)]
    pub limits: Option<ResourceLimits>,
}

fn default_sandbox_path() -> String {
    DEFAULT_SANDBOX_PATH.to_owned()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn cpp() -> Language {
        Language {
            name: "C++".to_owned(),
            extension: FileExtension::new("cpp").unwrap(),
            compile: Some(CompileConfig {
                command: vec![
                    "g++".to_owned(),
                    "{source}".to_owned(),
                    "-o".to_owned(),
                    "{output}".to_owned(),
                ],
                source_name: "main.cpp".to_owned(),
                output_name: "main".to_owned(),
                env: vec![EnvRule::set("TMPDIR", "/box")],
                limits: None,
            }),
            run: RunConfig {
                command: vec!["./{binary}".to_owned()],
                env: vec![],
                mounts: vec![],
                limits: None,
            },
            mounts: vec![DirRule::mount("/usr/lib/gcc")],
            env: vec![EnvRule::set("LC_ALL", "C")],
            path: DEFAULT_SANDBOX_PATH.to_owned(),
        }
    }

    pub(crate) fn python() -> Language {
        Language {
            name: "Python 3".to_owned(),
            extension: FileExtension::new("py").unwrap(),
            compile: None,
            run: RunConfig {
                command: vec!["python3".to_owned(), "{source}".to_owned()],
                env: vec![EnvRule::set("PYTHONDONTWRITEBYTECODE", "1")],
                mounts: vec![],
                limits: None,
            },
            mounts: vec![DirRule::mount("/usr/lib/python3")],
            env: vec![],
            path: DEFAULT_SANDBOX_PATH.to_owned(),
        }
    }

    #[test]
    fn file_extension_validation() {
        assert_eq!(FileExtension::new("cpp").unwrap().to_string(), "cpp");
        assert_eq!(FileExtension::new("f90").unwrap().to_string(), "f90");
        assert!(FileExtension::new("").unwrap().is_empty());
        assert!(FileExtension::new("path/ext").is_err());
        assert!(FileExtension::new(".cpp").is_err());
        assert!(FileExtension::new(".tar.gz").is_err());
    }

    #[test]
    fn expand_command_placeholders() {
        let cmd = vec![
            "gcc".to_owned(),
            "{source}".to_owned(),
            "-o".to_owned(),
            "{output}".to_owned(),
        ];
        let result = Language::expand_command(&cmd, "test.c", "test");
        assert_eq!(result, vec!["gcc", "test.c", "-o", "test"]);

        let cmd = vec!["./{binary}".to_owned(), "prefix-{source}-suffix".to_owned()];
        let result = Language::expand_command(&cmd, "main.c", "main");
        assert_eq!(result, vec!["./main", "prefix-main.c-suffix"]);

        assert!(Language::expand_command(&[], "main.c", "main").is_empty());
    }

    #[test]
    fn compiled_language_names() {
        let lang = cpp();
        assert!(lang.is_compiled());
        assert_eq!(lang.source_name(), "main.cpp");
        assert_eq!(lang.compiled_name(), "main");
        assert_eq!(
            lang.compile_command().unwrap(),
            vec!["g++", "main.cpp", "-o", "main"]
        );
        assert_eq!(lang.run_command(), vec!["./main"]);
    }

    #[test]
    fn interpreted_language_caches_its_source() {
        let lang = python();
        assert!(!lang.is_compiled());
        assert_eq!(lang.source_name(), "main.py");
        assert_eq!(lang.compiled_name(), "main.py");
        assert!(lang.compile_command().is_none());
        assert_eq!(lang.run_command(), vec!["python3", "main.py"]);
    }

    #[test]
    fn build_env_layers_path_common_then_build() {
        let env = cpp().build_env();
        assert_eq!(
            env,
            vec![
                EnvRule::set("PATH", DEFAULT_SANDBOX_PATH),
                EnvRule::set("LC_ALL", "C"),
                EnvRule::set("TMPDIR", "/box"),
            ]
        );
    }

    #[test]
    fn run_env_uses_run_rules() {
        let env = python().run_env();
        assert_eq!(
            env,
            vec![
                EnvRule::set("PATH", DEFAULT_SANDBOX_PATH),
                EnvRule::set("PYTHONDONTWRITEBYTECODE", "1"),
            ]
        );
        assert!(!cpp().run_env().iter().any(|rule| rule.key() == "TMPDIR"));
    }

    #[test]
    fn toolchain_mounts_only_at_run_time_for_interpreted() {
        assert!(cpp().run_mounts().is_empty());
        assert_eq!(python().run_mounts(), vec![DirRule::mount("/usr/lib/python3")]);

        let mut lang = cpp();
        lang.run.mounts.push(DirRule::mount("/usr/lib/jvm"));
        assert_eq!(lang.run_mounts(), vec![DirRule::mount("/usr/lib/jvm")]);
    }
}
