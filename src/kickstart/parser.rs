//! Kickstart splitter
//!
//! Splits a kickstart into commands, sections and addons with the file and
//! line each one starts at. Only the line structure is understood here; the
//! meaning of every command belongs to the module that owns it.
//!
//! `%include` and `%ksappend` are followed recursively. Their paths are
//! relative to the directory of the including file.

use super::element::{KickstartElement, KickstartElements, END_MARKER};
use log::{debug, warn};
use std::path::{Path, PathBuf};
use thiserror::Error;

const MARKER: char = '%';
const ADDON: &str = "addon";
const INCLUDE_DIRECTIVES: &[&str] = &["include", "ksappend"];

/// A kickstart that cannot be split.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum KickstartError {
    #[error("{filename}:{lineno}: unknown kickstart section %{name}")]
    UnknownSection {
        filename: String,
        lineno: u32,
        name: String,
    },

    #[error("{filename}:{lineno}: section %{name} does not end with %end")]
    UnterminatedSection {
        filename: String,
        lineno: u32,
        name: String,
    },

    #[error("{filename}:{lineno}: %end outside of a section")]
    UnexpectedEnd { filename: String, lineno: u32 },

    #[error("cannot include {filename}: {reason}")]
    MissingInclude { filename: String, reason: String },

    #[error("{filename}:{lineno}: {path} is already being included")]
    IncludeCycle {
        filename: String,
        lineno: u32,
        path: String,
    },

    #[error("{filename}:{lineno}: {message}")]
    Syntax {
        filename: String,
        lineno: u32,
        message: String,
    },

    #[error("cannot read {filename}: {reason}")]
    Read { filename: String, reason: String },
}

impl KickstartError {
    /// File the error points at.
    pub fn filename(&self) -> &str {
        match self {
            KickstartError::UnknownSection { filename, .. }
            | KickstartError::UnterminatedSection { filename, .. }
            | KickstartError::UnexpectedEnd { filename, .. }
            | KickstartError::MissingInclude { filename, .. }
            | KickstartError::IncludeCycle { filename, .. }
            | KickstartError::Syntax { filename, .. }
            | KickstartError::Read { filename, .. } => filename,
        }
    }

    /// Line the error points at; 0 when there is no line to blame.
    pub fn lineno(&self) -> u32 {
        match self {
            KickstartError::UnknownSection { lineno, .. }
            | KickstartError::UnterminatedSection { lineno, .. }
            | KickstartError::UnexpectedEnd { lineno, .. }
            | KickstartError::IncludeCycle { lineno, .. }
            | KickstartError::Syntax { lineno, .. } => *lineno,
            KickstartError::MissingInclude { .. } | KickstartError::Read { .. } => 0,
        }
    }
}

/// Splits kickstart files into [`KickstartElements`].
#[derive(Debug, Clone)]
pub struct SplitKickstartParser {
    valid_sections: Vec<String>,
    missing_include_is_fatal: bool,
    errors: Vec<KickstartError>,
}

impl SplitKickstartParser {
    /// `valid_sections` are section names without the marker.
    pub fn new<S: AsRef<str>>(valid_sections: &[S], missing_include_is_fatal: bool) -> Self {
        Self {
            valid_sections: valid_sections
                .iter()
                .map(|s| s.as_ref().trim_start_matches(MARKER).to_string())
                .collect(),
            missing_include_is_fatal,
            errors: Vec::new(),
        }
    }

    pub fn valid_sections(&self) -> &[String] {
        &self.valid_sections
    }

    /// Errors that did not stop the last split.
    pub fn errors(&self) -> &[KickstartError] {
        &self.errors
    }

    /// Split the kickstart file at `path`.
    pub fn split(&mut self, path: &Path) -> Result<KickstartElements, KickstartError> {
        let text = std::fs::read_to_string(path).map_err(|e| KickstartError::Read {
            filename: path.display().to_string(),
            reason: e.to_string(),
        })?;
        self.split_from_string(&text, &path.display().to_string())
    }

    /// Split kickstart text. `filename` names the text in element
    /// coordinates and anchors relative includes.
    pub fn split_from_string(
        &mut self,
        text: &str,
        filename: &str,
    ) -> Result<KickstartElements, KickstartError> {
        self.errors.clear();
        let mut elements = KickstartElements::new();
        let mut stack = vec![PathBuf::from(filename)];
        self.split_text(text, filename, &mut elements, &mut stack)?;
        debug!("Split {} into {} element(s)", filename, elements.len());
        Ok(elements)
    }

    fn split_text(
        &mut self,
        text: &str,
        filename: &str,
        elements: &mut KickstartElements,
        stack: &mut Vec<PathBuf>,
    ) -> Result<(), KickstartError> {
        let lines: Vec<&str> = text.lines().collect();
        let mut index = 0;

        while index < lines.len() {
            let line = lines[index];
            let lineno = index as u32 + 1;
            index += 1;

            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }

            let args: Vec<String> = trimmed.split_whitespace().map(str::to_string).collect();
            let Some(directive) = args[0].strip_prefix(MARKER) else {
                elements.append(KickstartElement::command(line, lineno, filename));
                continue;
            };

            if INCLUDE_DIRECTIVES.contains(&directive) {
                let Some(target) = args.get(1) else {
                    return Err(KickstartError::Syntax {
                        filename: filename.to_string(),
                        lineno,
                        message: format!("%{} needs a file name", directive),
                    });
                };
                self.include(target, filename, lineno, elements, stack)?;
                continue;
            }

            if args[0] == END_MARKER {
                return Err(KickstartError::UnexpectedEnd {
                    filename: filename.to_string(),
                    lineno,
                });
            }

            let is_addon = directive == ADDON;
            if !is_addon && !self.valid_sections.iter().any(|s| s == directive) {
                return Err(KickstartError::UnknownSection {
                    filename: filename.to_string(),
                    lineno,
                    name: directive.to_string(),
                });
            }

            let mut body = Vec::new();
            let mut closed = false;
            while index < lines.len() {
                let body_line = lines[index];
                index += 1;
                if body_line.split_whitespace().next() == Some(END_MARKER) {
                    closed = true;
                    break;
                }
                body.push(body_line.to_string());
            }
            if !closed {
                return Err(KickstartError::UnterminatedSection {
                    filename: filename.to_string(),
                    lineno: lines.len() as u32 + 1,
                    name: directive.to_string(),
                });
            }

            let element = if is_addon {
                KickstartElement::addon(args, body, lineno, filename)
            } else {
                KickstartElement::section(args, body, lineno, filename)
            };
            elements.append(element);
        }
        Ok(())
    }

    fn include(
        &mut self,
        target: &str,
        filename: &str,
        lineno: u32,
        elements: &mut KickstartElements,
        stack: &mut Vec<PathBuf>,
    ) -> Result<(), KickstartError> {
        let path = resolve_include(target, stack.last().map(PathBuf::as_path));
        if stack.contains(&path) {
            return Err(KickstartError::IncludeCycle {
                filename: filename.to_string(),
                lineno,
                path: path.display().to_string(),
            });
        }

        let included = path.display().to_string();
        let text = match std::fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) => {
                let error = KickstartError::MissingInclude {
                    filename: included,
                    reason: e.to_string(),
                };
                if self.missing_include_is_fatal {
                    return Err(error);
                }
                warn!("{}", error);
                self.errors.push(error);
                return Ok(());
            }
        };

        debug!("Including {} from {}:{}", included, filename, lineno);
        stack.push(path);
        let result = self.split_text(&text, &included, elements, stack);
        stack.pop();
        result
    }
}

fn resolve_include(target: &str, including: Option<&Path>) -> PathBuf {
    let target = Path::new(target);
    if target.is_absolute() {
        return target.to_path_buf();
    }
    match including.and_then(Path::parent) {
        Some(dir) if !dir.as_os_str().is_empty() => dir.join(target),
        _ => target.to_path_buf(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kickstart::element::{get_kickstart_from_elements, ElementKind};
    use std::fs;
    use tempfile::TempDir;

    const SECTIONS: &[&str] = &["pre", "post", "packages"];

    fn parser() -> SplitKickstartParser {
        SplitKickstartParser::new(SECTIONS, false)
    }

    #[test]
    fn test_split_commands_and_sections() {
        let text = "text\n%pre\necho PRE\n%end\nnetwork --device ens3\n";
        let elements = parser().split_from_string(text, "ks.cfg").unwrap();

        let summary: Vec<(&str, ElementKind, u32)> = elements
            .all_elements()
            .iter()
            .map(|e| (e.name(), e.kind(), e.lineno()))
            .collect();
        assert_eq!(
            summary,
            vec![
                ("text", ElementKind::Command, 1),
                ("pre", ElementKind::Section, 2),
                ("network", ElementKind::Command, 5),
            ]
        );
        assert_eq!(get_kickstart_from_elements(elements.all_elements()), text);
    }

    #[test]
    fn test_comments_and_blanks_between_commands_are_dropped() {
        let text = "# comment\n\ntext\n   \n%post\n# kept\n\necho hi\n%end\n";
        let elements = parser().split_from_string(text, "ks.cfg").unwrap();
        assert_eq!(elements.len(), 2);
        assert_eq!(elements.all_elements()[0].lineno(), 3);
        assert_eq!(elements.all_elements()[1].lines(), &["# kept", "", "echo hi"]);
    }

    #[test]
    fn test_empty_kickstart() {
        let elements = parser().split_from_string("", "ks.cfg").unwrap();
        assert!(elements.is_empty());
    }

    #[test]
    fn test_unknown_section_points_at_header() {
        let error = parser()
            .split_from_string("text\n%bogus\nfoo\n%end\n", "ks.cfg")
            .unwrap_err();
        assert!(matches!(error, KickstartError::UnknownSection { .. }));
        assert_eq!(error.lineno(), 2);
        assert_eq!(error.filename(), "ks.cfg");
    }

    #[test]
    fn test_unterminated_section_points_past_the_body() {
        let error = parser()
            .split_from_string("%pre\necho 1\necho 2\n", "ks.cfg")
            .unwrap_err();
        assert!(matches!(error, KickstartError::UnterminatedSection { .. }));
        assert_eq!(error.lineno(), 4);
    }

    #[test]
    fn test_stray_end_is_an_error() {
        let error = parser().split_from_string("text\n%end\n", "ks.cfg").unwrap_err();
        assert_eq!(
            error,
            KickstartError::UnexpectedEnd {
                filename: "ks.cfg".to_string(),
                lineno: 2
            }
        );
    }

    #[test]
    fn test_addon_is_never_a_section() {
        let mut parser = SplitKickstartParser::new(&["addon"], false);
        let elements = parser
            .split_from_string("%addon org_test_thing --on\nkey = 1\n%end\n", "ks.cfg")
            .unwrap();
        let addon = &elements.all_elements()[0];
        assert_eq!(addon.kind(), ElementKind::Addon);
        assert_eq!(addon.name(), "org_test_thing");
    }

    #[test]
    fn test_include_is_relative_to_including_file() {
        let dir = TempDir::new().unwrap();
        let main = dir.path().join("ks.cfg");
        fs::write(&main, "text\n%include sub.cfg\nreboot\n").unwrap();
        fs::write(dir.path().join("sub.cfg"), "network --device=ens51\n").unwrap();

        let elements = parser().split(&main).unwrap();
        let names: Vec<&str> = elements.all_elements().iter().map(|e| e.name()).collect();
        assert_eq!(names, vec!["text", "network", "reboot"]);

        let network = &elements.all_elements()[1];
        assert_eq!(network.lineno(), 1);
        assert!(network.filename().ends_with("sub.cfg"));
        assert_eq!(elements.all_elements()[2].lineno(), 3);
        assert_eq!(elements.all_elements()[2].filename(), main.display().to_string());
    }

    #[test]
    fn test_missing_include_soft_and_fatal() {
        let text = "text\n%ksappend /nonexistent/quarry/missing.cfg\nreboot\n";

        let mut soft = parser();
        let elements = soft.split_from_string(text, "ks.cfg").unwrap();
        assert_eq!(elements.len(), 2);
        assert_eq!(soft.errors().len(), 1);
        assert_eq!(soft.errors()[0].lineno(), 0);
        assert_eq!(soft.errors()[0].filename(), "/nonexistent/quarry/missing.cfg");

        let mut fatal = SplitKickstartParser::new(SECTIONS, true);
        let error = fatal.split_from_string(text, "ks.cfg").unwrap_err();
        assert!(matches!(error, KickstartError::MissingInclude { .. }));
    }

    #[test]
    fn test_include_cycle_is_detected() {
        let dir = TempDir::new().unwrap();
        let main = dir.path().join("ks.cfg");
        fs::write(&main, "text\n%include ks.cfg\n").unwrap();

        let error = parser().split(&main).unwrap_err();
        assert!(matches!(error, KickstartError::IncludeCycle { lineno: 2, .. }));
    }

    #[test]
    fn test_errors_are_cleared_between_splits() {
        let mut parser = parser();
        parser
            .split_from_string("%include /nonexistent/a.cfg\n", "ks.cfg")
            .unwrap();
        assert_eq!(parser.errors().len(), 1);
        parser.split_from_string("text\n", "ks.cfg").unwrap();
        assert!(parser.errors().is_empty());
    }
}
