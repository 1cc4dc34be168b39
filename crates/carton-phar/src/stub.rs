//! Stub synthesis and validation.
//!
//! The stub is the executable prelude the host interpreter runs when the
//! archive is invoked directly. Generated stubs follow a fixed textual
//! layout; custom stubs are embedded verbatim but must carry the
//! `__HALT_COMPILER(); ?>` terminator so the container boundary is
//! well-defined.

use crate::PharError;

/// Terminator every stub must end with (an optional single newline may
/// follow).
pub const STUB_TERMINATOR: &str = "__HALT_COMPILER(); ?>";

/// Inputs for generated-stub rendering.
#[derive(Debug, Clone, Default)]
pub struct StubSpec {
    /// Shebang line without trailing newline (e.g. `#!/usr/bin/env php`).
    pub shebang: Option<String>,
    /// Banner text; rendered as a `/* ... */` block, one ` * ` prefix per
    /// line. Empty string renders no block.
    pub banner: Option<String>,
    /// Archive alias mapped via `Phar::mapPhar`.
    pub alias: String,
    /// Bundle path of the main script, required at the end of the stub.
    pub index: Option<String>,
    pub intercept_file_funcs: bool,
    pub check_requirements: bool,
}

/// Render a generated stub. The output always ends with the terminator
/// followed by exactly one newline.
pub fn generate(spec: &StubSpec) -> String {
    let mut out = String::new();

    if let Some(shebang) = &spec.shebang {
        out.push_str(shebang);
        out.push('\n');
    }
    out.push_str("<?php\n");

    if let Some(banner) = &spec.banner {
        if !banner.is_empty() {
            out.push('\n');
            out.push_str(&banner_block(banner));
        }
    }

    out.push('\n');
    out.push_str(&format!("Phar::mapPhar('{}');\n", spec.alias));

    if spec.intercept_file_funcs {
        out.push('\n');
        out.push_str("Phar::interceptFileFuncs();\n");
    }

    if spec.check_requirements {
        out.push('\n');
        out.push_str(&format!(
            "require 'phar://{}/.box/bin/check-requirements.php';\n",
            spec.alias
        ));
    }

    if let Some(index) = &spec.index {
        out.push('\n');
        out.push_str(&format!("require 'phar://{}/{}';\n", spec.alias, index));
    }

    out.push('\n');
    out.push_str(STUB_TERMINATOR);
    out.push('\n');
    out
}

/// The library's built-in default stub: self-maps the archive and nothing
/// else. No shebang, no banner, no alias embedded (the manifest header
/// carries the alias).
pub fn default_stub() -> String {
    format!("<?php\n\nPhar::mapPhar();\n\n{}\n", STUB_TERMINATOR)
}

/// Wrap banner text as a block comment. A one-line banner still uses the
/// block form.
fn banner_block(banner: &str) -> String {
    let mut block = String::from("/*\n");
    for line in banner.lines() {
        if line.is_empty() {
            block.push_str(" *\n");
        } else {
            block.push_str(" * ");
            block.push_str(line);
            block.push('\n');
        }
    }
    block.push_str(" */\n");
    block
}

/// Validate custom stub bytes: must end with the terminator, optionally
/// followed by a single `\n`. Trailing bytes beyond that are rejected so the
/// manifest offset stays unambiguous.
pub fn validate_custom(stub: &[u8]) -> Result<(), PharError> {
    let text = std::str::from_utf8(stub).map_err(|_| PharError::StubInvalid {
        reason: "stub is not valid UTF-8".into(),
    })?;
    let trimmed = text.strip_suffix('\n').unwrap_or(text);
    if !trimmed.ends_with(STUB_TERMINATOR) {
        return Err(PharError::StubInvalid {
            reason: format!("stub does not end with `{}`", STUB_TERMINATOR),
        });
    }
    Ok(())
}
