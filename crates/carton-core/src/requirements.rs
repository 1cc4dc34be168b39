//! Requirement collection and the embedded checker payload.
//!
//! Reads the dependency lock file and the project manifest, extracts
//! `require.php` and `require.ext-*` constraints, and renders the manifest
//! the embedded checker consumes at `.box/.requirements.php`. The checker
//! payload itself is a small fixed set of PHP files embedded at build time.

use std::collections::BTreeSet;

use crate::composer::{Lock, Manifest};

/// Bundle path of the serialized requirement manifest.
pub const REQUIREMENTS_PATH: &str = ".box/.requirements.php";

/// Bundle path of the checker entry point referenced by the stub.
pub const CHECKER_ENTRY_PATH: &str = ".box/bin/check-requirements.php";

/// One collected requirement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Requirement {
    pub kind: RequirementKind,
    /// Version constraint for `PhpVersion`; extension name for `Extension`.
    pub condition: String,
    /// Package that declared the requirement; `None` for the project root.
    pub source: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequirementKind {
    PhpVersion,
    Extension,
}

impl RequirementKind {
    fn type_tag(self) -> &'static str {
        match self {
            RequirementKind::PhpVersion => "php",
            RequirementKind::Extension => "extension",
        }
    }
}

/// Collect requirements from the project manifest and every locked package.
///
/// Version constraints are not normalizable in general, so each distinct
/// `(constraint, source)` pair is kept; extension requirements are
/// deduplicated by extension name, first source wins.
pub fn collect(
    manifest: Option<&Manifest>,
    lock: Option<&Lock>,
    include_dev: bool,
) -> Vec<Requirement> {
    let mut out = Vec::new();
    let mut seen_extensions = BTreeSet::new();

    let mut add_requires =
        |require: &std::collections::BTreeMap<String, String>, source: Option<&str>| {
            if let Some(php) = require.get("php") {
                let requirement = Requirement {
                    kind: RequirementKind::PhpVersion,
                    condition: php.clone(),
                    source: source.map(str::to_string),
                };
                if !out.contains(&requirement) {
                    out.push(requirement);
                }
            }
            for (name, _constraint) in require.iter() {
                if let Some(extension) = name.strip_prefix("ext-") {
                    if seen_extensions.insert(extension.to_string()) {
                        out.push(Requirement {
                            kind: RequirementKind::Extension,
                            condition: extension.to_string(),
                            source: source.map(str::to_string),
                        });
                    }
                }
            }
        };

    if let Some(manifest) = manifest {
        add_requires(&manifest.require, None);
    }
    if let Some(lock) = lock {
        for package in &lock.packages {
            add_requires(&package.require, Some(&package.name));
        }
        if include_dev {
            for package in &lock.packages_dev {
                add_requires(&package.require, Some(&package.name));
            }
        }
    }
    out
}

/// Render the manifest as the PHP return-array the checker loads.
pub fn render_requirements_php(requirements: &[Requirement]) -> String {
    let mut out = String::from("<?php\n\nreturn array(\n");
    for requirement in requirements {
        out.push_str("    array(\n");
        out.push_str(&format!(
            "        'type' => '{}',\n",
            requirement.kind.type_tag()
        ));
        out.push_str(&format!(
            "        'condition' => '{}',\n",
            php_escape(&requirement.condition)
        ));
        match &requirement.source {
            Some(source) => {
                out.push_str(&format!("        'source' => '{}',\n", php_escape(source)))
            }
            None => out.push_str("        'source' => null,\n"),
        }
        out.push_str("    ),\n");
    }
    out.push_str(");\n");
    out
}

fn php_escape(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\'', "\\'")
}

/// The embedded checker payload: `(bundle path, contents)` pairs.
pub fn checker_payload() -> Vec<(&'static str, &'static [u8])> {
    vec![
        (
            CHECKER_ENTRY_PATH,
            include_bytes!("../resources/requirement-checker/bin/check-requirements.php").as_slice(),
        ),
        (
            ".box/src/RequirementChecker.php",
            include_bytes!("../resources/requirement-checker/src/RequirementChecker.php").as_slice(),
        ),
        (
            ".box/vendor/autoload.php",
            include_bytes!("../resources/requirement-checker/vendor/autoload.php").as_slice(),
        ),
    ]
}
