//! Deterministic rule oracle.
//!
//! Rules only propose fixes whose outcome is mechanical (installs, port
//! changes, template copies, permission bits). Anything needing source edits
//! gets an empty proposal with category guidance as the root cause.

use std::fs;
use std::net::TcpListener;
use std::path::Path;
use std::sync::LazyLock;

use anyhow::Result;
use regex::Regex;
use tracing::debug;

use crate::core::classifier::guidance;
use crate::core::diagnosis::{ErrorCategory, ErrorEntry};
use crate::core::fix::{Fix, FixAction};
use crate::core::types::{ProjectContext, ProjectType};
use crate::io::oracle::{FixOracle, Proposal};

/// Confidence for installing a package named by the error.
pub const NAMED_INSTALL_CONFIDENCE: f64 = 0.95;
/// Confidence for a full dependency reinstall.
pub const REINSTALL_CONFIDENCE: f64 = 0.9;
pub const KILL_PROCESS_CONFIDENCE: f64 = 0.8;
pub const CHANGE_PORT_CONFIDENCE: f64 = 0.85;
pub const ENV_TEMPLATE_CONFIDENCE: f64 = 0.9;
pub const CHMOD_CONFIDENCE: f64 = 0.8;
/// A placeholder value for a missing variable is a guess.
pub const ENV_PLACEHOLDER_CONFIDENCE: f64 = 0.5;

const ENV_TEMPLATES: [&str; 3] = [".env.example", ".env.sample", ".env.template"];

static PY_MODULE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"No module named ['"]?([\w.]+)['"]?"#).unwrap());
static NPM_MODULE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?:Cannot find module|Cannot find package|Can't resolve|Module not found:) ['"]([^'"]+)['"]"#)
        .unwrap()
});
static NOT_FOUND_PROGRAM_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:^|[\s:])([\w.-]+): (?:command )?not found|'([\w.-]+)' is not recognized").unwrap()
});
static PORT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(?:EADDRINUSE|address already in use|port)\D{0,20}?(\d{2,5})\b").unwrap()
});
static PERMISSION_PATH_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?:EACCES|EPERM|Permission denied|PermissionError)[^'"]*['"]([^'"]+)['"]"#).unwrap()
});
static ENV_VAR_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?:Environment variable ['"]?([A-Z][A-Z0-9_]+)['"]? (?:is )?not set|KeyError: '([A-Z][A-Z0-9_]+)'|process\.env\.([A-Z][A-Z0-9_]+))"#)
        .unwrap()
});

/// Rule-table oracle. Stateless; reads the project tree to tell local
/// modules from packages and to find `.env` templates.
#[derive(Debug, Clone, Copy, Default)]
pub struct RuleOracle;

impl FixOracle for RuleOracle {
    fn propose_fix(&self, error: &ErrorEntry, context: &ProjectContext) -> Result<Proposal> {
        let proposal = match error.category {
            ErrorCategory::Dependency | ErrorCategory::Import => dependency_fixes(error, context),
            ErrorCategory::Port => port_fixes(error, context),
            ErrorCategory::Configuration => configuration_fixes(error, context),
            ErrorCategory::Permission => permission_fixes(error, context),
            _ => None,
        };
        let proposal = proposal.unwrap_or_else(|| guidance_only(error.category));
        debug!(
            category = %error.category,
            fixes = proposal.fixes.len(),
            "rule oracle proposal"
        );
        Ok(proposal)
    }
}

fn guidance_only(category: ErrorCategory) -> Proposal {
    Proposal::new(guidance(category).join("; "), Vec::new())
}

fn dependency_fixes(error: &ErrorEntry, context: &ProjectContext) -> Option<Proposal> {
    if let Some(program) = missing_program(&error.message) {
        return program_fixes(&program, context);
    }
    if let Some(caps) = PY_MODULE_RE.captures(&error.message) {
        let module = caps[1].split('.').next().unwrap_or(&caps[1]).to_string();
        if is_local_python_module(&context.root, &module) {
            return Some(Proposal::new(
                format!("Local module {module} cannot be imported; check the package layout"),
                Vec::new(),
            ));
        }
        let package = pip_package(&module);
        return Some(Proposal::new(
            format!("Python module {module} is not installed"),
            vec![Fix::new(
                FixAction::InstallDependency {
                    command: format!("pip install {package}"),
                    package: Some(module.clone()),
                },
                NAMED_INSTALL_CONFIDENCE,
                format!("Install {package}"),
            )],
        ));
    }
    if let Some(caps) = NPM_MODULE_RE.captures(&error.message) {
        let specifier = &caps[1];
        if specifier.starts_with('.') || specifier.starts_with('/') {
            return Some(Proposal::new(
                format!("Local module {specifier} cannot be resolved; check the path"),
                Vec::new(),
            ));
        }
        let package = npm_package(specifier);
        return Some(Proposal::new(
            format!("npm package {package} is not installed"),
            vec![Fix::new(
                FixAction::InstallDependency {
                    command: format!("npm install {package}"),
                    package: Some(package.clone()),
                },
                NAMED_INSTALL_CONFIDENCE,
                format!("Install {package}"),
            )],
        ));
    }
    if error.category == ErrorCategory::Import {
        // A name missing from an installed module is not an install problem.
        return None;
    }
    reinstall(context).map(|fix| Proposal::new("Project dependencies are not installed", vec![fix]))
}

fn missing_program(message: &str) -> Option<String> {
    let caps = NOT_FOUND_PROGRAM_RE.captures(message)?;
    caps.get(1)
        .or_else(|| caps.get(2))
        .map(|m| m.as_str().to_string())
}

fn program_fixes(program: &str, context: &ProjectContext) -> Option<Proposal> {
    let python_package = match program {
        "flask" => Some("flask"),
        "django-admin" => Some("django"),
        "pytest" => Some("pytest"),
        _ => None,
    };
    if let Some(package) = python_package {
        return Some(Proposal::new(
            format!("{program} is not installed"),
            vec![Fix::new(
                FixAction::InstallDependency {
                    command: format!("pip install {package}"),
                    package: Some(package.to_string()),
                },
                REINSTALL_CONFIDENCE,
                format!("Install {package} to provide {program}"),
            )],
        ));
    }
    if context.project_type.is_node()
        && matches!(program, "jest" | "vitest" | "mocha" | "next" | "react-scripts" | "vite")
    {
        return reinstall(context).map(|fix| {
            Proposal::new(format!("{program} is missing from node_modules"), vec![fix])
        });
    }
    None
}

fn reinstall(context: &ProjectContext) -> Option<Fix> {
    let command = if context.project_type.is_node() {
        "npm install"
    } else if context.project_type.is_python() && context.root.join("requirements.txt").is_file()
    {
        "pip install -r requirements.txt"
    } else {
        return None;
    };
    Some(Fix::new(
        FixAction::InstallDependency {
            command: command.to_string(),
            package: None,
        },
        REINSTALL_CONFIDENCE,
        format!("Run {command}"),
    ))
}

fn is_local_python_module(root: &Path, module: &str) -> bool {
    root.join(format!("{module}.py")).is_file() || root.join(module).join("__init__.py").is_file()
}

/// pip distribution name for common import names that differ.
fn pip_package(module: &str) -> &str {
    match module {
        "cv2" => "opencv-python",
        "PIL" => "Pillow",
        "yaml" => "PyYAML",
        "sklearn" => "scikit-learn",
        "bs4" => "beautifulsoup4",
        "dotenv" => "python-dotenv",
        "jwt" => "PyJWT",
        _ => module,
    }
}

/// Package name of a bare specifier: `lodash/fp` → `lodash`, `@scope/pkg/x` → `@scope/pkg`.
fn npm_package(specifier: &str) -> String {
    let mut parts = specifier.split('/');
    match (parts.next(), parts.next()) {
        (Some(scope), Some(name)) if scope.starts_with('@') => format!("{scope}/{name}"),
        (Some(name), _) => name.to_string(),
        (None, _) => specifier.to_string(),
    }
}

fn port_fixes(error: &ErrorEntry, context: &ProjectContext) -> Option<Proposal> {
    let port = PORT_RE
        .captures(&error.message)
        .and_then(|caps| caps[1].parse::<u16>().ok())
        .or_else(|| context.ports.first().copied())?;
    let mut fixes = vec![Fix::new(
        FixAction::RunCommand {
            command: kill_port_command(port),
        },
        KILL_PROCESS_CONFIDENCE,
        format!("Kill the process listening on port {port}"),
    )];
    if let Some(free) = free_port_after(port) {
        let key = if context.project_type == ProjectType::Flask {
            "FLASK_RUN_PORT"
        } else {
            "PORT"
        };
        fixes.push(Fix::new(
            FixAction::ConfigChange {
                path: ".env".to_string(),
                key: key.to_string(),
                value: free.to_string(),
            },
            CHANGE_PORT_CONFIDENCE,
            format!("Move the server to free port {free}"),
        ));
    }
    Some(Proposal::new(format!("Port {port} is already in use"), fixes))
}

fn kill_port_command(port: u16) -> String {
    if cfg!(windows) {
        format!(
            "for /f \"tokens=5\" %p in ('netstat -ano ^| findstr :{port}') do taskkill /PID %p /F"
        )
    } else {
        format!("lsof -ti tcp:{port} | xargs kill -9")
    }
}

/// First bindable port above `port`, searching 100 ports.
pub fn free_port_after(port: u16) -> Option<u16> {
    (1..=100u16)
        .filter_map(|offset| port.checked_add(offset))
        .find(|candidate| TcpListener::bind(("127.0.0.1", *candidate)).is_ok())
}

fn configuration_fixes(error: &ErrorEntry, context: &ProjectContext) -> Option<Proposal> {
    let lower = error.message.to_lowercase();
    let var = ENV_VAR_RE.captures(&error.message).and_then(|caps| {
        (1..=3)
            .find_map(|i| caps.get(i))
            .map(|m| m.as_str().to_string())
    });
    let mentions_env = lower.contains(".env") || lower.contains("environment") || var.is_some();
    if !mentions_env {
        return None;
    }

    let env_path = context.root.join(".env");
    if !env_path.exists()
        && let Some((template, contents)) = ENV_TEMPLATES.iter().find_map(|name| {
            fs::read_to_string(context.root.join(name))
                .ok()
                .map(|contents| (*name, contents))
        })
    {
        return Some(Proposal::new(
            "The .env file is missing",
            vec![Fix::new(
                FixAction::CreateFile {
                    path: ".env".to_string(),
                    contents,
                },
                ENV_TEMPLATE_CONFIDENCE,
                format!("Create .env from {template}"),
            )],
        ));
    }

    let var = var?;
    Some(Proposal::new(
        format!("Environment variable {var} is not set"),
        vec![Fix::new(
            FixAction::ConfigChange {
                path: ".env".to_string(),
                key: var.clone(),
                value: "changeme".to_string(),
            },
            ENV_PLACEHOLDER_CONFIDENCE,
            format!("Set {var} in .env (placeholder value)"),
        )],
    ))
}

fn permission_fixes(error: &ErrorEntry, context: &ProjectContext) -> Option<Proposal> {
    let raw = PERMISSION_PATH_RE.captures(&error.message)?[1].to_string();
    let path = Path::new(&raw);
    // Only touch paths inside the project.
    let inside = if path.is_absolute() {
        path.starts_with(&context.root)
    } else {
        !raw.split(['/', '\\']).any(|part| part == "..")
    };
    if !inside || cfg!(windows) {
        return None;
    }
    Some(Proposal::new(
        format!("Insufficient permissions on {raw}"),
        vec![Fix::new(
            FixAction::RunCommand {
                command: format!("chmod u+rw {}", shell_quote(&raw)),
            },
            CHMOD_CONFIDENCE,
            format!("Grant the owner read/write access to {raw}"),
        )],
    ))
}

fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}
