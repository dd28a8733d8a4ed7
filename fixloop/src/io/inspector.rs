//! Project inspection: type, entry point, run/test/install commands.
//!
//! Detectors run in a fixed order and the first match wins, so inspecting
//! the same directory twice yields the same context.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde_json::Value;
use tracing::{debug, instrument, warn};

use crate::core::types::{ProjectContext, ProjectType, TestFramework};

/// Fatal problem with the project location or its commands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigurationError {
    pub message: String,
}

impl ConfigurationError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl fmt::Display for ConfigurationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "configuration error: {}", self.message)
    }
}

impl std::error::Error for ConfigurationError {}

/// Explicit commands that replace the detected ones.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InspectOptions {
    pub run_command: Option<Vec<String>>,
    pub test_command: Option<Vec<String>>,
}

/// Build the immutable [`ProjectContext`] for `path`.
///
/// Returns a [`ConfigurationError`] (through `anyhow`) when the path is
/// missing or not a directory.
#[instrument(skip_all, fields(path = %path.display()))]
pub fn inspect(path: &Path, options: &InspectOptions) -> Result<ProjectContext> {
    if !path.exists() {
        return Err(ConfigurationError::new(format!(
            "project path {} does not exist",
            path.display()
        ))
        .into());
    }
    if !path.is_dir() {
        return Err(ConfigurationError::new(format!(
            "project path {} is not a directory",
            path.display()
        ))
        .into());
    }
    let root = path
        .canonicalize()
        .with_context(|| format!("canonicalize {}", path.display()))?;

    let manifest = read_package_json(&root);
    let project_type = detect_type(&root, manifest.as_ref());
    let mut context = match project_type {
        ProjectType::Nextjs | ProjectType::React | ProjectType::Node => {
            node_context(&root, project_type, manifest.as_ref().unwrap_or(&Value::Null))
        }
        ProjectType::Django => django_context(&root),
        ProjectType::Flask => flask_context(&root),
        ProjectType::Python => python_context(&root),
        ProjectType::Generic => base_context(&root, ProjectType::Generic),
    };

    if let Some(run) = &options.run_command {
        if run.first().is_none_or(|program| program.trim().is_empty()) {
            return Err(ConfigurationError::new("run command is empty").into());
        }
        context.run_command = Some(run.clone());
    }
    if let Some(test) = &options.test_command {
        if test.first().is_none_or(|program| program.trim().is_empty()) {
            return Err(ConfigurationError::new("test command is empty").into());
        }
        context.test_framework = framework_from_command(test).unwrap_or(context.test_framework);
        context.test_command = Some(test.clone());
    }

    debug!(
        project_type = %context.project_type,
        framework = context.test_framework.as_str(),
        run = ?context.run_command,
        test = ?context.test_command,
        "inspected project"
    );
    Ok(context)
}

fn detect_type(root: &Path, manifest: Option<&Value>) -> ProjectType {
    if let Some(manifest) = manifest {
        if has_dependency(manifest, "next") {
            return ProjectType::Nextjs;
        }
        if has_dependency(manifest, "react") {
            return ProjectType::React;
        }
        return ProjectType::Node;
    }
    if root.join("package.json").is_file() {
        return ProjectType::Node;
    }
    let requirements = read_lower(&root.join("requirements.txt"));
    if read_lower(&root.join("manage.py")).contains("django") || requirements.contains("django")
    {
        return ProjectType::Django;
    }
    if requirements.contains("flask")
        || FLASK_ENTRIES
            .iter()
            .any(|entry| imports_flask(&read_lower(&root.join(entry))))
    {
        return ProjectType::Flask;
    }
    if PYTHON_MARKERS.iter().any(|marker| root.join(marker).is_file()) {
        return ProjectType::Python;
    }
    ProjectType::Generic
}

const FLASK_ENTRIES: [&str; 3] = ["app.py", "application.py", "wsgi.py"];
const PYTHON_MARKERS: [&str; 7] = [
    "requirements.txt",
    "setup.py",
    "setup.cfg",
    "pyproject.toml",
    "Pipfile",
    "main.py",
    "app.py",
];
const PYTHON_ENTRIES: [&str; 4] = ["main.py", "app.py", "run.py", "__main__.py"];
const NODE_ENTRIES: [&str; 4] = ["index.js", "server.js", "app.js", "main.js"];
/// Script npm writes by default; it always fails.
const NPM_PLACEHOLDER_TEST: &str = "no test specified";

fn imports_flask(source: &str) -> bool {
    source.contains("from flask import") || source.contains("import flask")
}

fn base_context(root: &Path, project_type: ProjectType) -> ProjectContext {
    ProjectContext {
        root: root.to_path_buf(),
        project_type,
        entry_point: None,
        run_command: None,
        test_command: None,
        test_framework: TestFramework::None,
        install_command: None,
        env: BTreeMap::new(),
        ports: Vec::new(),
    }
}

fn node_context(root: &Path, project_type: ProjectType, manifest: &Value) -> ProjectContext {
    let mut context = base_context(root, project_type);
    let has_script = |name: &str| script(manifest, name).is_some();
    let main = manifest
        .get("main")
        .and_then(Value::as_str)
        .filter(|main| root.join(main).is_file())
        .map(str::to_string)
        .or_else(|| existing(root, &NODE_ENTRIES));

    context.run_command = match project_type {
        ProjectType::Nextjs if has_script("dev") => Some(argv(&["npm", "run", "dev"])),
        _ if has_script("start") => Some(argv(&["npm", "start"])),
        _ if has_script("dev") => Some(argv(&["npm", "run", "dev"])),
        _ => main.as_deref().map(|main| argv(&["node", main])),
    };
    context.entry_point = match project_type {
        ProjectType::Node => main,
        ProjectType::React => existing(
            root,
            &["src/index.js", "src/index.jsx", "src/main.jsx", "src/index.tsx"],
        ),
        _ => existing(
            root,
            &["pages/index.js", "pages/index.tsx", "app/page.js", "app/page.tsx"],
        ),
    };

    if let Some(test) = script(manifest, "test")
        && !test.contains(NPM_PLACEHOLDER_TEST)
    {
        context.test_command = Some(argv(&["npm", "test"]));
        context.test_framework = node_framework(manifest, test);
        // Keeps jest and vitest out of watch mode.
        context.env.insert("CI".to_string(), "true".to_string());
    }
    context.install_command = Some(argv(&["npm", "install"]));
    if project_type == ProjectType::React {
        context.env.insert("BROWSER".to_string(), "none".to_string());
    }
    context.ports = vec![3000];
    context
}

fn node_framework(manifest: &Value, test_script: &str) -> TestFramework {
    for (name, framework) in [
        ("vitest", TestFramework::Vitest),
        ("jest", TestFramework::Jest),
        ("mocha", TestFramework::Mocha),
    ] {
        if has_dependency(manifest, name) || test_script.contains(name) {
            return framework;
        }
    }
    if test_script.contains("react-scripts test") {
        return TestFramework::Jest;
    }
    TestFramework::None
}

fn django_context(root: &Path) -> ProjectContext {
    let mut context = base_context(root, ProjectType::Django);
    context.entry_point = Some("manage.py".to_string());
    context.run_command = Some(argv(&["python", "manage.py", "runserver"]));
    context.test_command = Some(argv(&["python", "manage.py", "test"]));
    context.test_framework = TestFramework::Django;
    context.install_command = python_install(root);
    context.ports = vec![8000];
    context
}

fn flask_context(root: &Path) -> ProjectContext {
    let mut context = base_context(root, ProjectType::Flask);
    let entry = existing(root, &FLASK_ENTRIES).unwrap_or_else(|| "app.py".to_string());
    context.run_command = Some(argv(&["python", "-m", "flask", "run"]));
    context.env.insert("FLASK_APP".to_string(), entry.clone());
    context.entry_point = Some(entry);
    apply_pytest(root, &mut context);
    context.install_command = python_install(root);
    context.ports = vec![5000];
    context
}

fn python_context(root: &Path) -> ProjectContext {
    let mut context = base_context(root, ProjectType::Python);
    context.entry_point = existing(root, &PYTHON_ENTRIES);
    context.run_command = context
        .entry_point
        .as_deref()
        .map(|entry| argv(&["python", entry]));
    apply_pytest(root, &mut context);
    context.install_command = python_install(root);
    context
}

fn apply_pytest(root: &Path, context: &mut ProjectContext) {
    if uses_pytest(root) {
        context.test_command = Some(argv(&["python", "-m", "pytest", "--tb=short"]));
        context.test_framework = TestFramework::Pytest;
    }
}

fn uses_pytest(root: &Path) -> bool {
    if root.join("pytest.ini").is_file() || root.join("conftest.py").is_file() {
        return true;
    }
    if read_lower(&root.join("pyproject.toml")).contains("[tool.pytest") {
        return true;
    }
    if root.join("tests").is_dir() || root.join("test").is_dir() {
        return true;
    }
    fs::read_dir(root)
        .map(|entries| {
            entries.filter_map(|e| e.ok()).any(|e| {
                let name = e.file_name();
                let name = name.to_string_lossy();
                name.starts_with("test_") && name.ends_with(".py")
            })
        })
        .unwrap_or(false)
}

fn python_install(root: &Path) -> Option<Vec<String>> {
    if root.join("requirements.txt").is_file() {
        Some(argv(&["pip", "install", "-r", "requirements.txt"]))
    } else if root.join("pyproject.toml").is_file() || root.join("setup.py").is_file() {
        Some(argv(&["pip", "install", "-e", "."]))
    } else if root.join("Pipfile").is_file() {
        Some(argv(&["pipenv", "install"]))
    } else {
        None
    }
}

/// Infer the framework of an explicit test command.
fn framework_from_command(command: &[String]) -> Option<TestFramework> {
    let line = command.join(" ");
    if line.contains("manage.py test") {
        Some(TestFramework::Django)
    } else if line.contains("pytest") {
        Some(TestFramework::Pytest)
    } else if line.contains("vitest") {
        Some(TestFramework::Vitest)
    } else if line.contains("jest") {
        Some(TestFramework::Jest)
    } else if line.contains("mocha") {
        Some(TestFramework::Mocha)
    } else {
        None
    }
}

/// `package.json` contents; a malformed manifest reads as empty.
fn read_package_json(root: &Path) -> Option<Value> {
    let path = root.join("package.json");
    let contents = fs::read_to_string(&path).ok()?;
    match serde_json::from_str::<Value>(&contents) {
        Ok(value) if value.is_object() => Some(value),
        Ok(_) | Err(_) => {
            warn!(path = %path.display(), "malformed package.json, treating as empty");
            Some(Value::Object(serde_json::Map::new()))
        }
    }
}

fn has_dependency(manifest: &Value, name: &str) -> bool {
    ["dependencies", "devDependencies"]
        .iter()
        .any(|table| manifest.get(table).and_then(|deps| deps.get(name)).is_some())
}

fn script<'a>(manifest: &'a Value, name: &str) -> Option<&'a str> {
    manifest.get("scripts")?.get(name)?.as_str()
}

fn existing(root: &Path, candidates: &[&str]) -> Option<String> {
    candidates
        .iter()
        .find(|candidate| root.join(candidate).is_file())
        .map(|candidate| candidate.to_string())
}

fn read_lower(path: &Path) -> String {
    fs::read_to_string(path)
        .map(|s| s.to_lowercase())
        .unwrap_or_default()
}

fn argv(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|part| part.to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::TestProject;

    fn detect(project: &TestProject) -> ProjectContext {
        inspect(project.path(), &InspectOptions::default()).expect("inspect")
    }

    #[test]
    fn missing_path_is_configuration_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        let err = inspect(&temp.path().join("nope"), &InspectOptions::default()).unwrap_err();
        let config = err.downcast_ref::<ConfigurationError>().expect("typed error");
        assert!(config.message.contains("does not exist"));
    }

    #[test]
    fn file_path_is_configuration_error() {
        let project = TestProject::new().file("app.py", "print('hi')\n");
        let err = inspect(&project.path().join("app.py"), &InspectOptions::default()).unwrap_err();
        assert!(err.downcast_ref::<ConfigurationError>().is_some());
    }

    #[test]
    fn flask_project_runs_through_python_module() {
        let project = TestProject::new()
            .file("requirements.txt", "flask==3.0\n")
            .file("app.py", "from flask import Flask\napp = Flask(__name__)\n");
        let context = detect(&project);
        assert_eq!(context.project_type, ProjectType::Flask);
        assert_eq!(context.run_command_line().as_deref(), Some("python -m flask run"));
        assert_eq!(context.env.get("FLASK_APP").map(String::as_str), Some("app.py"));
        assert_eq!(
            context.install_command,
            Some(argv(&["pip", "install", "-r", "requirements.txt"]))
        );
        assert_eq!(context.ports, vec![5000]);
        assert!(context.root.is_absolute());
    }

    #[test]
    fn flask_detected_from_import_without_requirements() {
        let project = TestProject::new().file("wsgi.py", "import flask\n");
        let context = detect(&project);
        assert_eq!(context.project_type, ProjectType::Flask);
        assert_eq!(context.entry_point.as_deref(), Some("wsgi.py"));
    }

    #[test]
    fn django_wins_over_flask_and_python() {
        let project = TestProject::new()
            .file("manage.py", "import django\n")
            .file("app.py", "from flask import Flask\n");
        let context = detect(&project);
        assert_eq!(context.project_type, ProjectType::Django);
        assert_eq!(context.test_framework, TestFramework::Django);
        assert_eq!(context.ports, vec![8000]);
    }

    #[test]
    fn nextjs_then_react_then_node() {
        let next = TestProject::new().file(
            "package.json",
            r#"{"dependencies":{"next":"14","react":"18"},"scripts":{"dev":"next dev","start":"next start"}}"#,
        );
        let context = detect(&next);
        assert_eq!(context.project_type, ProjectType::Nextjs);
        assert_eq!(context.run_command_line().as_deref(), Some("npm run dev"));

        let react = TestProject::new().file(
            "package.json",
            r#"{"dependencies":{"react":"18"},"devDependencies":{"vitest":"1"},"scripts":{"start":"vite","test":"vitest run"}}"#,
        );
        let context = detect(&react);
        assert_eq!(context.project_type, ProjectType::React);
        assert_eq!(context.test_framework, TestFramework::Vitest);
        assert_eq!(context.env.get("BROWSER").map(String::as_str), Some("none"));

        let node = TestProject::new()
            .file("package.json", r#"{"main":"server.js","scripts":{"test":"mocha"}}"#)
            .file("server.js", "require('http')\n");
        let context = detect(&node);
        assert_eq!(context.project_type, ProjectType::Node);
        assert_eq!(context.run_command_line().as_deref(), Some("node server.js"));
        assert_eq!(context.test_framework, TestFramework::Mocha);
        assert_eq!(context.test_command, Some(argv(&["npm", "test"])));
    }

    #[test]
    fn npm_placeholder_test_script_is_ignored() {
        let project = TestProject::new().file(
            "package.json",
            r#"{"scripts":{"start":"node index.js","test":"echo \"Error: no test specified\" && exit 1"}}"#,
        );
        let context = detect(&project);
        assert!(context.test_command.is_none());
        assert_eq!(context.test_framework, TestFramework::None);
    }

    #[test]
    fn malformed_package_json_is_plain_node() {
        let project = TestProject::new()
            .file("package.json", "{ not json")
            .file("index.js", "console.log(1)\n");
        let context = detect(&project);
        assert_eq!(context.project_type, ProjectType::Node);
        assert_eq!(context.run_command_line().as_deref(), Some("node index.js"));
    }

    #[test]
    fn python_project_with_tests_dir_uses_pytest() {
        let project = TestProject::new()
            .file("main.py", "print('hi')\n")
            .file("tests/test_main.py", "def test_ok():\n    assert True\n");
        let context = detect(&project);
        assert_eq!(context.project_type, ProjectType::Python);
        assert_eq!(context.run_command_line().as_deref(), Some("python main.py"));
        assert_eq!(context.test_framework, TestFramework::Pytest);
        assert!(context.install_command.is_none());
    }

    #[test]
    fn empty_directory_is_generic_without_run_command() {
        let project = TestProject::new();
        let context = detect(&project);
        assert_eq!(context.project_type, ProjectType::Generic);
        assert!(context.run_command.is_none());
        assert_eq!(context.test_framework, TestFramework::None);
    }

    #[test]
    fn explicit_commands_override_detection() {
        let project = TestProject::new();
        let options = InspectOptions {
            run_command: Some(argv(&["./serve.sh"])),
            test_command: Some(argv(&["python", "-m", "pytest", "-q"])),
        };
        let context = inspect(project.path(), &options).expect("inspect");
        assert_eq!(context.run_command, Some(argv(&["./serve.sh"])));
        assert_eq!(context.test_framework, TestFramework::Pytest);
    }

    #[test]
    fn inspection_is_deterministic() {
        let project = TestProject::new()
            .file("requirements.txt", "requests\n")
            .file("app.py", "import requests\n");
        assert_eq!(detect(&project), detect(&project));
        assert_eq!(detect(&project).project_type, ProjectType::Python);
    }
}
